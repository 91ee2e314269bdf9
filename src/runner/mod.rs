//! Per-kind supervisors that drive one operation each.
//!
//! A [`Runner`] owns nothing in the registry. It knows its operation id and
//! reports through a [`RunnerObserver`], always by value.

pub mod dummy;
pub mod process;
pub mod progress;
pub mod transfer;

use std::sync::Arc;

use crate::config::DaemonConfig;
use crate::error::RunnerError;
use crate::model::{Operation, OperationArgs, OperationId, OperationStatus};

pub use dummy::DummyRunner;
pub use process::ProcessSupervisor;
pub use transfer::TransferRunner;

/// Exit code recorded when a runner could not be started at all.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -1;
/// Exit code of a cooperatively aborted run (128 + SIGTERM).
pub const ABORTED_EXIT_CODE: i32 = 143;

/// Sink for everything a runner reports.
///
/// `on_started` is called from inside [`Runner::start`] once the work has
/// begun and before any other callback. `on_status` is called once per
/// meaningful update and exactly once more with a terminal status.
pub trait RunnerObserver: Send + Sync {
    fn on_started(&self) {}
    fn on_stdout(&self, _line: &str) {}
    fn on_stderr(&self, _line: &str) {}
    fn on_status(&self, status: OperationStatus);
}

/// Supervision contract shared by every operation kind.
pub trait Runner: Send + Sync {
    fn operation_id(&self) -> OperationId;

    /// Begin the work. A second call fails with [`RunnerError::AlreadyStarted`].
    fn start(&self) -> Result<(), RunnerError>;

    /// Request cancellation. Fails with [`RunnerError::NotRunning`] once the work has ended.
    fn abort(&self) -> Result<(), RunnerError>;
}

/// Builds the runner for an operation.
pub trait RunnerFactory: Send + Sync {
    fn build(
        &self,
        operation: &Operation,
        observer: Arc<dyn RunnerObserver>,
    ) -> Result<Arc<dyn Runner>, RunnerError>;
}

/// Default factory: the configured transfer tool for transfers, [`DummyRunner`] for tests.
#[derive(Debug, Clone, Default)]
pub struct ToolRunnerFactory {
    config: DaemonConfig,
}

impl ToolRunnerFactory {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }
}

impl RunnerFactory for ToolRunnerFactory {
    fn build(
        &self,
        operation: &Operation,
        observer: Arc<dyn RunnerObserver>,
    ) -> Result<Arc<dyn Runner>, RunnerError> {
        let runner: Arc<dyn Runner> = match &operation.args {
            OperationArgs::Dummy { iterations } => Arc::new(DummyRunner::new(
                operation.id,
                *iterations,
                self.config.dummy_interval,
                observer,
            )),
            args => Arc::new(TransferRunner::new(operation.id, args, &self.config, observer)?),
        };
        Ok(runner)
    }
}
