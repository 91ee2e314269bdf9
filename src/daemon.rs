//! Daemon-side dispatcher.
//!
//! Requests arrive on [`REQUEST_TOPIC`] and are handed to a dedicated
//! dispatch thread, which mutates the [`OperationRegistry`] and drives one
//! [`Runner`] per operation. Runner callbacks arrive on the runners' own
//! threads and go straight to the registry and the bus.
//!
//! Lock order: `pending_aborts`, then the registry, then `runners`. No lock is
//! held while publishing or while a runner is being signalled.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, info, warn};

use crate::bus::{Bus, Subscription};
use crate::config::DaemonConfig;
use crate::error::Error;
use crate::model::{OperationId, OperationState, OperationStatus};
use crate::protocol::{
    Message, REQUEST_TOPIC, RequestAbort, RequestCreate, RequestId, ResponseList, STATUS_TOPIC,
    StatusUpdate, status_topic,
};
use crate::registry::OperationRegistry;
use crate::runner::{
    LAUNCH_FAILURE_EXIT_CODE, Runner, RunnerFactory, RunnerObserver, ToolRunnerFactory,
};

struct Shared {
    bus: Arc<Bus<Message>>,
    registry: OperationRegistry,
    factory: Arc<dyn RunnerFactory>,
    runners: Mutex<HashMap<OperationId, Arc<dyn Runner>>>,
    pending_aborts: Mutex<HashMap<OperationId, PendingAbort>>,
    /// Notified whenever a pending abort leaves [`AbortStage::Signalling`].
    abort_settled: Condvar,
}

enum AbortStage {
    /// `Runner::abort` is in progress on this thread.
    Signalling(ThreadId),
    /// The runner accepted the abort.
    Signalled,
}

/// Abort in flight for one operation.
struct PendingAbort {
    /// `None` for aborts the daemon issues itself on shutdown.
    request: Option<RequestId>,
    stage: AbortStage,
}

impl PendingAbort {
    fn new(request: Option<RequestId>) -> Self {
        Self {
            request,
            stage: AbortStage::Signalling(thread::current().id()),
        }
    }
}

/// Running daemon: a bus subscription plus its dispatch thread.
pub struct Daemon {
    shared: Arc<Shared>,
    subscription: Subscription,
    dispatcher: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Start a daemon that runs transfers with the configured tool.
    pub fn spawn(bus: Arc<Bus<Message>>, config: DaemonConfig) -> Self {
        Self::with_factory(bus, Arc::new(ToolRunnerFactory::new(config)))
    }

    pub fn with_factory(bus: Arc<Bus<Message>>, factory: Arc<dyn RunnerFactory>) -> Self {
        let shared = Arc::new(Shared {
            bus: Arc::clone(&bus),
            registry: OperationRegistry::new(),
            factory,
            runners: Mutex::new(HashMap::new()),
            pending_aborts: Mutex::new(HashMap::new()),
            abort_settled: Condvar::new(),
        });

        let (inbox, requests) = mpsc::channel::<Message>();
        let subscription = bus.subscribe(REQUEST_TOPIC, move |message: &Message| {
            if inbox.send(message.clone()).is_err() {
                warn!(kind = message.name(), "daemon stopped, dropping request");
            }
        });

        let worker = Arc::clone(&shared);
        let dispatcher = thread::spawn(move || {
            for message in requests {
                worker.dispatch(message);
            }
            debug!("dispatcher stopped");
        });
        info!("daemon started");

        Self {
            shared,
            subscription,
            dispatcher: Some(dispatcher),
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.shared.registry
    }

    /// Stop accepting requests and abort every operation still running.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        self.shared.bus.unsubscribe(&self.subscription);
        if dispatcher.join().is_err() {
            error!("dispatcher thread panicked");
        }

        let active: Vec<(OperationId, Arc<dyn Runner>)> = lock(&self.shared.runners)
            .iter()
            .map(|(id, runner)| (*id, Arc::clone(runner)))
            .collect();
        for (id, runner) in active {
            let fresh = {
                let mut pending = lock(&self.shared.pending_aborts);
                let fresh = !pending.contains_key(&id);
                if fresh {
                    pending.insert(id, PendingAbort::new(None));
                }
                fresh
            };
            if fresh {
                self.shared.signal_abort(id, runner.as_ref());
            }
        }
        info!("daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::RequestCreate(request) => self.handle_create(request),
            Message::RequestAbort(request) => self.handle_abort(request),
            Message::RequestList(request) => {
                let operations = self.registry.list();
                self.respond(request.id, Message::ResponseList(ResponseList { operations }));
            }
            other => debug!(kind = other.name(), "ignoring non-request message"),
        }
    }

    fn respond(&self, request: RequestId, message: Message) {
        if self.bus.publish(&request.topic(), &message) == 0 {
            debug!(%request, kind = message.name(), "no client waiting for response");
        }
    }

    fn publish_status(&self, id: OperationId, status: OperationStatus) {
        let message = Message::StatusUpdate(StatusUpdate {
            operation_id: id,
            status,
        });
        self.bus.publish(STATUS_TOPIC, &message);
        self.bus.publish(&status_topic(id), &message);
    }

    fn handle_create(self: &Arc<Self>, request: RequestCreate) {
        if let Err(e) = request.args.validate() {
            warn!(request = %request.id, error = %e, "rejecting create request");
            self.respond(request.id, Message::create_error(e.to_string()));
            return;
        }

        let operation = self.registry.create(request.args);
        let id = operation.id;
        let observer = Arc::new(OperationObserver {
            shared: Arc::downgrade(self),
            id,
        });

        let runner = match self.factory.build(&operation, observer) {
            Ok(runner) => runner,
            Err(e) => {
                let message = self.fail_launch(id, &e.to_string());
                self.respond(request.id, Message::create_error(message));
                return;
            }
        };

        lock(&self.runners).insert(id, Arc::clone(&runner));
        if let Err(e) = runner.start() {
            lock(&self.runners).remove(&id);
            let message = self.fail_launch(id, &e.to_string());
            self.respond(request.id, Message::create_error(message));
            return;
        }

        match self.registry.get(id) {
            Some(operation) => self.respond(request.id, Message::create_ok(operation)),
            None => self.respond(request.id, Message::create_error(Error::NotFound(id).to_string())),
        }
    }

    /// Record a terminal failure for an operation whose runner never started.
    fn fail_launch(&self, id: OperationId, reason: &str) -> String {
        warn!(operation = %id, reason, "failed to launch operation");
        let status = OperationStatus::launch_failure(reason, LAUNCH_FAILURE_EXIT_CODE);
        if let Err(e) = self.registry.update_status(id, status.clone()) {
            error!(operation = %id, error = %e, "failed to record launch failure");
        }
        if let Err(e) = self.registry.transition(id, OperationState::Failed) {
            error!(operation = %id, error = %e, "rejected transition");
        }
        self.publish_status(id, status);
        reason.to_string()
    }

    fn handle_abort(&self, request: RequestAbort) {
        let id = request.operation_id;
        let runner = {
            let mut pending = lock(&self.pending_aborts);
            match self.registry.get(id) {
                None => Err(Error::NotFound(id).to_string()),
                Some(operation) if operation.state.is_terminal() => {
                    Err(format!("operation {id} has already finished"))
                }
                Some(_) if pending.contains_key(&id) => {
                    Err(format!("operation {id} is already being aborted"))
                }
                Some(_) => match lock(&self.runners).get(&id).cloned() {
                    Some(runner) => {
                        pending.insert(id, PendingAbort::new(Some(request.id)));
                        Ok(runner)
                    }
                    None => Err(format!("operation {id} is not running")),
                },
            }
        };

        let runner = match runner {
            Ok(runner) => runner,
            Err(message) => {
                debug!(operation = %id, %message, "abort rejected");
                self.respond(request.id, Message::abort_error(message));
                return;
            }
        };

        info!(operation = %id, "aborting operation");
        self.signal_abort(id, runner.as_ref());
    }

    /// Signal the runner of an operation whose abort is recorded as pending.
    ///
    /// Runs without any daemon lock held: a runner may report its terminal
    /// status from inside `abort`.
    fn signal_abort(&self, id: OperationId, runner: &dyn Runner) {
        let result = runner.abort();
        let mut pending = lock(&self.pending_aborts);
        match result {
            Ok(()) => {
                if let Some(abort) = pending.get_mut(&id) {
                    abort.stage = AbortStage::Signalled;
                }
                drop(pending);
                self.abort_settled.notify_all();
            }
            Err(e) => {
                // A terminal status that got here first has already answered.
                let abort = pending.remove(&id);
                drop(pending);
                self.abort_settled.notify_all();
                debug!(operation = %id, error = %e, "abort not delivered");
                if let Some(request) = abort.and_then(|a| a.request) {
                    self.respond(request, Message::abort_error(e.to_string()));
                }
            }
        }
    }

    fn record_status(&self, id: OperationId, status: OperationStatus) {
        if let Err(e) = self.registry.update_status(id, status.clone()) {
            error!(operation = %id, error = %e, "status for unknown operation");
            return;
        }
        if !status.finished {
            self.publish_status(id, status);
            return;
        }

        let reply = self.finish(id, &status);
        self.publish_status(id, status);
        if let Some((request, message)) = reply {
            self.respond(request, message);
        }
    }

    /// Apply the terminal transition and work out the answer owed to a pending abort.
    fn finish(&self, id: OperationId, status: &OperationStatus) -> Option<(RequestId, Message)> {
        let (next, abort) = {
            // An abort still being delivered by another thread decides the
            // outcome. One in progress on this thread never returned before
            // the run ended, so it did not cause the ending.
            let current = thread::current().id();
            let mut pending = self
                .abort_settled
                .wait_while(lock(&self.pending_aborts), |pending| {
                    matches!(
                        pending.get(&id),
                        Some(PendingAbort { stage: AbortStage::Signalling(owner), .. })
                            if *owner != current
                    )
                })
                .unwrap_or_else(PoisonError::into_inner);
            let abort = pending.remove(&id);
            let signalled = matches!(
                abort,
                Some(PendingAbort {
                    stage: AbortStage::Signalled,
                    ..
                })
            );
            let next = match (status.exit_code, signalled) {
                (Some(0), _) => OperationState::Finished,
                (_, true) => OperationState::Aborted,
                _ => OperationState::Failed,
            };
            if let Err(e) = self.registry.transition(id, next) {
                error!(operation = %id, error = %e, "rejected transition");
            }
            (next, abort)
        };
        lock(&self.runners).remove(&id);

        let request = abort.and_then(|a| a.request)?;
        let message = if next == OperationState::Aborted {
            Message::abort_ok()
        } else {
            Message::abort_error(format!("operation {id} finished before it could be aborted"))
        };
        Some((request, message))
    }
}

/// Routes one runner's callbacks into the daemon.
struct OperationObserver {
    shared: Weak<Shared>,
    id: OperationId,
}

impl RunnerObserver for OperationObserver {
    fn on_started(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.registry.transition(self.id, OperationState::Running) {
            error!(operation = %self.id, error = %e, "rejected transition");
        }
    }

    fn on_stdout(&self, line: &str) {
        debug!(operation = %self.id, line, "transfer output");
    }

    fn on_stderr(&self, line: &str) {
        warn!(operation = %self.id, line, "transfer error output");
    }

    fn on_status(&self, status: OperationStatus) {
        match self.shared.upgrade() {
            Some(shared) => shared.record_status(self.id, status),
            None => debug!(operation = %self.id, "daemon gone, dropping status"),
        }
    }
}
