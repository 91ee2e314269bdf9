//! Supervision of one external transfer process.
//!
//! One reader thread per output stream and one waiter thread forward raw
//! chunks and the exit code over a channel to a supervising thread, which
//! splits lines, feeds the progress parser and invokes the observer. Once the
//! process has exited, output still held open by helpers it forked is drained
//! for at most the grace period. The process runs in its own process group so
//! that an abort reaches every helper it forked.

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

use tracing::{debug, warn};

use super::RunnerObserver;
use super::progress::{LineSplitter, ProgressParser};
use crate::error::RunnerError;
use crate::model::OperationStatus;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Program and arguments of the external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

enum ProcessState {
    Idle,
    Starting,
    Running {
        pid: u32,
        aborting: bool,
        exited: Option<Receiver<()>>,
    },
    Exited,
}

#[derive(Clone, Copy, Debug)]
enum StreamKind {
    Stdout,
    Stderr,
}

enum StreamMessage {
    Data(StreamKind, Vec<u8>),
    Error(StreamKind, io::Error),
    Finished(StreamKind),
    Exited(i32),
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

/// Owns the lifetime of one external process.
pub struct ProcessSupervisor {
    invocation: Invocation,
    grace: Duration,
    observer: Arc<dyn RunnerObserver>,
    state: Arc<Mutex<ProcessState>>,
}

impl ProcessSupervisor {
    pub fn new(invocation: Invocation, grace: Duration, observer: Arc<dyn RunnerObserver>) -> Self {
        Self {
            invocation,
            grace,
            observer,
            state: Arc::new(Mutex::new(ProcessState::Idle)),
        }
    }

    /// Spawn the process and start draining its output.
    pub fn start(&self) -> Result<(), RunnerError> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, ProcessState::Idle) {
                return Err(RunnerError::AlreadyStarted);
            }
            *state = ProcessState::Starting;
        }

        let mut command = Command::new(&self.invocation.program);
        command
            .args(&self.invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                *lock(&self.state) = ProcessState::Exited;
                return Err(RunnerError::Spawn {
                    program: self.invocation.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        let (exit_tx, exit_rx) = mpsc::channel();
        *lock(&self.state) = ProcessState::Running {
            pid,
            aborting: false,
            exited: Some(exit_rx),
        };
        debug!(pid, program = %self.invocation.program.display(), "transfer process spawned");
        self.observer.on_started();

        let (sender, receiver) = mpsc::channel();
        let mut streams = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, StreamKind::Stdout, sender.clone());
            streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, StreamKind::Stderr, sender.clone());
            streams += 1;
        }
        spawn_waiter(child, sender);

        let supervision = Supervision {
            receiver,
            streams,
            grace: self.grace,
            observer: Arc::clone(&self.observer),
            state: Arc::clone(&self.state),
            exited: exit_tx,
        };
        thread::spawn(move || supervision.run());
        Ok(())
    }

    /// Send the termination signal to the process group and arm the force-kill.
    pub fn abort(&self) -> Result<(), RunnerError> {
        let mut state = lock(&self.state);
        let ProcessState::Running {
            pid,
            aborting,
            exited,
        } = &mut *state
        else {
            return Err(RunnerError::NotRunning);
        };

        signal_group(*pid, Signal::Terminate)?;
        *aborting = true;
        if let Some(exited) = exited.take() {
            let pid = *pid;
            let grace = self.grace;
            let state = Arc::clone(&self.state);
            thread::spawn(move || force_kill_after(pid, grace, exited, state));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_reader<R>(mut reader: R, kind: StreamKind, sender: Sender<StreamMessage>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    let _ = sender.send(StreamMessage::Finished(kind));
                    break;
                }
                Ok(n) => {
                    if sender
                        .send(StreamMessage::Data(kind, buffer[..n].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    let _ = sender.send(StreamMessage::Error(kind, error));
                    break;
                }
            }
        }
    });
}

fn spawn_waiter(mut child: Child, sender: Sender<StreamMessage>) {
    thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => exit_code(status),
            Err(error) => {
                warn!(%error, "failed to wait for transfer process");
                super::LAUNCH_FAILURE_EXIT_CODE
            }
        };
        let _ = sender.send(StreamMessage::Exited(code));
    });
}

struct Supervision {
    receiver: Receiver<StreamMessage>,
    /// Output streams not yet closed.
    streams: usize,
    grace: Duration,
    observer: Arc<dyn RunnerObserver>,
    state: Arc<Mutex<ProcessState>>,
    exited: Sender<()>,
}

impl Supervision {
    fn run(mut self) {
        let mut parser = ProgressParser::new();
        let mut stdout = LineSplitter::new();
        let mut stderr = LineSplitter::new();
        let mut exit: Option<(i32, Instant)> = None;

        loop {
            if exit.is_some() && self.streams == 0 {
                break;
            }
            let message = match exit {
                None => match self.receiver.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
                Some((_, deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.receiver.recv_timeout(remaining) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(open = self.streams, "output still open after exit, not waiting");
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };

            match message {
                StreamMessage::Data(StreamKind::Stdout, data) => {
                    for line in stdout.push(&data) {
                        self.stdout_line(&mut parser, &line);
                    }
                }
                StreamMessage::Data(StreamKind::Stderr, data) => {
                    for line in stderr.push(&data) {
                        self.stderr_line(&mut parser, &line);
                    }
                }
                StreamMessage::Error(kind, error) => {
                    warn!(?kind, %error, "failed to read transfer output");
                    self.streams = self.streams.saturating_sub(1);
                }
                StreamMessage::Finished(kind) => {
                    debug!(?kind, "transfer output closed");
                    self.streams = self.streams.saturating_sub(1);
                }
                StreamMessage::Exited(code) => {
                    exit = Some((code, Instant::now() + self.grace));
                }
            }
        }
        if let Some(line) = stdout.finish() {
            self.stdout_line(&mut parser, &line);
        }
        if let Some(line) = stderr.finish() {
            self.stderr_line(&mut parser, &line);
        }

        let exit_code = exit.map_or(super::LAUNCH_FAILURE_EXIT_CODE, |(code, _)| code);
        let aborted = {
            let mut state = lock(&self.state);
            let aborted = matches!(*state, ProcessState::Running { aborting: true, .. });
            *state = ProcessState::Exited;
            aborted
        };
        drop(self.exited);

        let mut last = parser.finish(exit_code);
        if aborted && exit_code != 0 {
            last.message = "aborted".to_string();
        }
        debug!(exit_code, aborted, "transfer process exited");
        self.observer.on_status(OperationStatus::from_progress(&last));
    }

    fn stdout_line(&self, parser: &mut ProgressParser, line: &str) {
        self.observer.on_stdout(line);
        if let Some(progress) = parser.consume(line) {
            self.observer.on_status(OperationStatus::from_progress(&progress));
        }
    }

    fn stderr_line(&self, parser: &mut ProgressParser, line: &str) {
        self.observer.on_stderr(line);
        parser.note_stderr(line);
    }
}

fn force_kill_after(
    pid: u32,
    grace: Duration,
    exited: Receiver<()>,
    state: Arc<Mutex<ProcessState>>,
) {
    if !matches!(exited.recv_timeout(grace), Err(RecvTimeoutError::Timeout)) {
        return;
    }
    let state = lock(&state);
    if matches!(*state, ProcessState::Running { .. }) {
        warn!(pid, ?grace, "transfer process ignored termination, killing");
        if let Err(error) = signal_group(pid, Signal::Kill) {
            warn!(pid, %error, "failed to kill transfer process");
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    super::LAUNCH_FAILURE_EXIT_CODE
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> Result<(), RunnerError> {
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| RunnerError::Signal(io::Error::from(io::ErrorKind::InvalidInput)))?;
    // SAFETY: kill has no memory-safety preconditions; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(RunnerError::Signal(io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> Result<(), RunnerError> {
    Err(RunnerError::Unsupported)
}
