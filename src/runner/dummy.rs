use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::progress::TransferProgress;
use super::{ABORTED_EXIT_CODE, Runner, RunnerObserver};
use crate::error::RunnerError;
use crate::model::{OperationId, OperationStatus};

enum DummyState {
    Idle,
    Running(Sender<()>),
    Done,
}

/// Test runner that reports `iterations` evenly spaced steps without touching the filesystem.
pub struct DummyRunner {
    operation_id: OperationId,
    iterations: u32,
    interval: Duration,
    observer: Arc<dyn RunnerObserver>,
    state: Arc<Mutex<DummyState>>,
}

impl DummyRunner {
    pub fn new(
        operation_id: OperationId,
        iterations: u32,
        interval: Duration,
        observer: Arc<dyn RunnerObserver>,
    ) -> Self {
        Self {
            operation_id,
            iterations,
            interval,
            observer,
            state: Arc::new(Mutex::new(DummyState::Idle)),
        }
    }
}

fn step(iteration: u32, iterations: u32) -> TransferProgress {
    let total = u64::from(iterations);
    let done = u64::from(iteration);
    TransferProgress {
        message: format!("iteration {iteration}/{iterations}"),
        bytes_total: total,
        bytes_done: done as f64,
        files_total: total,
        files_done: done,
        progress: if total == 0 { 1.0 } else { done as f64 / total as f64 },
        seconds_left: Some(total - done),
        ..TransferProgress::default()
    }
}

impl Runner for DummyRunner {
    fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    fn start(&self) -> Result<(), RunnerError> {
        let (abort_tx, abort_rx) = mpsc::channel();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*state, DummyState::Idle) {
                return Err(RunnerError::AlreadyStarted);
            }
            *state = DummyState::Running(abort_tx);
        }
        self.observer.on_started();

        let iterations = self.iterations;
        let interval = self.interval;
        let observer = Arc::clone(&self.observer);
        let state = Arc::clone(&self.state);
        let id = self.operation_id;
        thread::spawn(move || {
            let mut last = step(0, iterations);
            let mut aborted = false;
            for iteration in 1..=iterations {
                match abort_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => {
                        aborted = true;
                        break;
                    }
                }
                last = step(iteration, iterations);
                observer.on_stdout(&last.message);
                observer.on_status(OperationStatus::from_progress(&last));
            }

            *state.lock().unwrap_or_else(PoisonError::into_inner) = DummyState::Done;
            last.finished = true;
            if aborted {
                last.message = "aborted".to_string();
                last.exit_code = Some(ABORTED_EXIT_CODE);
            } else {
                last.message = "finished".to_string();
                last.exit_code = Some(0);
                last.progress = 1.0;
            }
            debug!(operation = %id, aborted, "dummy run ended");
            observer.on_status(OperationStatus::from_progress(&last));
        });
        Ok(())
    }

    fn abort(&self) -> Result<(), RunnerError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            DummyState::Running(abort) => abort.send(()).map_err(|_| RunnerError::NotRunning),
            _ => Err(RunnerError::NotRunning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{ChannelObserver, RunnerEvent};

    fn runner(iterations: u32, interval: Duration) -> (DummyRunner, ChannelObserver) {
        let observer = ChannelObserver::new();
        let runner = DummyRunner::new(
            OperationId::new(),
            iterations,
            interval,
            Arc::new(observer.clone()),
        );
        (runner, observer)
    }

    #[test]
    fn three_iterations_then_terminal() {
        let (runner, observer) = runner(3, Duration::from_millis(10));
        runner.start().unwrap();
        let events = observer.wait_terminal(Duration::from_secs(5));
        assert_eq!(events.first(), Some(&RunnerEvent::Started));

        let statuses = RunnerEvent::statuses(&events);
        assert_eq!(statuses.len(), 4);
        assert!(statuses[..3].iter().all(|s| !s.finished && s.exit_code.is_none()));
        assert_eq!(
            statuses[..3].iter().map(|s| s.files_done).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let last = &statuses[3];
        assert!(last.finished);
        assert_eq!(last.exit_code, Some(0));
        assert_eq!(last.progress, 1.0);
    }

    #[test]
    fn abort_ends_run_early() {
        let (runner, observer) = runner(1000, Duration::from_millis(20));
        runner.start().unwrap();
        runner.abort().unwrap();
        let statuses = RunnerEvent::statuses(&observer.wait_terminal(Duration::from_secs(5)));
        let last = statuses.last().unwrap();
        assert_eq!(last.exit_code, Some(ABORTED_EXIT_CODE));
        assert_eq!(last.message, "aborted");
        assert!(statuses.len() < 1000);
    }

    #[test]
    fn abort_after_completion_fails() {
        let (runner, observer) = runner(1, Duration::from_millis(1));
        runner.start().unwrap();
        observer.wait_terminal(Duration::from_secs(5));
        assert!(matches!(runner.abort(), Err(RunnerError::NotRunning)));
        assert!(matches!(runner.start(), Err(RunnerError::AlreadyStarted)));
    }

    #[test]
    fn zero_iterations_finish_immediately() {
        let (runner, observer) = runner(0, Duration::from_secs(60));
        runner.start().unwrap();
        let statuses = RunnerEvent::statuses(&observer.wait_terminal(Duration::from_secs(5)));
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].exit_code, Some(0));
    }
}
