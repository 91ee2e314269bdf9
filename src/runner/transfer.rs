use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use super::process::{Invocation, ProcessSupervisor};
use super::progress::FILE_MARKER;
use super::{Runner, RunnerObserver};
use crate::config::DaemonConfig;
use crate::error::RunnerError;
use crate::model::{OperationArgs, OperationId};

/// Runner for copy, move, push and pull: one supervised transfer-tool process.
pub struct TransferRunner {
    operation_id: OperationId,
    supervisor: ProcessSupervisor,
}

impl TransferRunner {
    pub fn new(
        operation_id: OperationId,
        args: &OperationArgs,
        config: &DaemonConfig,
        observer: Arc<dyn RunnerObserver>,
    ) -> Result<Self, RunnerError> {
        let invocation = build_invocation(&config.transfer_program, args)?;
        Ok(Self {
            operation_id,
            supervisor: ProcessSupervisor::new(invocation, config.abort_grace, observer),
        })
    }
}

impl Runner for TransferRunner {
    fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    fn start(&self) -> Result<(), RunnerError> {
        self.supervisor.start()
    }

    fn abort(&self) -> Result<(), RunnerError> {
        self.supervisor.abort()
    }
}

fn base_invocation(program: &Path) -> Invocation {
    Invocation::new(program)
        .arg("--archive")
        .arg("--no-inc-recursive")
        .arg("--info=progress2")
        .arg("--stats")
        .arg(format!("--out-format={FILE_MARKER}%n"))
}

// Mirroring copies the directory's contents, which the tool expresses with a trailing slash.
fn contents_of(path: &Path) -> OsString {
    let mut raw = path.as_os_str().to_os_string();
    if !raw.to_string_lossy().ends_with('/') {
        raw.push("/");
    }
    raw
}

/// Translate typed operation arguments into a transfer-tool command line.
pub fn build_invocation(program: &Path, args: &OperationArgs) -> Result<Invocation, RunnerError> {
    args.validate()
        .map_err(|e| RunnerError::InvalidArgs(e.to_string()))?;

    let invocation = match args {
        OperationArgs::Copy { from, to } => {
            let mut invocation = base_invocation(program);
            for source in from {
                invocation = invocation.arg(source);
            }
            invocation.arg(to)
        }
        OperationArgs::Move { from, to } => {
            let mut invocation = base_invocation(program).arg("--remove-source-files");
            for source in from {
                invocation = invocation.arg(source);
            }
            invocation.arg(to)
        }
        OperationArgs::Push { src, dst } => base_invocation(program)
            .arg("--delete")
            .arg(contents_of(src))
            .arg(dst),
        OperationArgs::Pull { src, dst } => base_invocation(program)
            .arg("--delete")
            .arg(contents_of(dst))
            .arg(src),
        OperationArgs::Dummy { .. } => {
            return Err(RunnerError::InvalidArgs(
                "dummy operations have no transfer command".to_string(),
            ));
        }
    };
    Ok(invocation)
}
