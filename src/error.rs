use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{OperationId, OperationState};

/// Errors surfaced by the registry, the daemon dispatcher and the client request layer.
#[derive(Debug, Error)]
pub enum Error {
    /// No correlated response arrived within the request timeout.
    #[error("timeout")]
    Timeout,
    /// The daemon answered with an error result; the message is passed through verbatim.
    #[error("{0}")]
    Daemon(String),
    #[error("operation {0} not found")]
    NotFound(OperationId),
    #[error("invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationState,
        to: OperationState,
    },
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("unexpected response to {0} request")]
    UnexpectedResponse(&'static str),
}

/// Errors raised while starting, supervising or aborting a transfer.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner has already been started")]
    AlreadyStarted,
    #[error("operation is not running")]
    NotRunning,
    #[error("failed to launch '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal transfer process: {0}")]
    Signal(#[source] io::Error),
    #[error("aborting a transfer is not supported on this platform")]
    Unsupported,
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
