use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use path_absolutize::Absolutize;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::runner::progress::TransferProgress;

/// Opaque identifier of an operation, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of transfer an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Copy,
    Move,
    Push,
    Pull,
    Dummy,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Copy => "copy",
            OperationKind::Move => "move",
            OperationKind::Push => "push",
            OperationKind::Pull => "pull",
            OperationKind::Dummy => "dummy",
        };
        f.write_str(name)
    }
}

/// Arguments of an operation, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationArgs {
    /// Copy one or more sources into a destination.
    Copy {
        /// Source files or directories.
        from: Vec<PathBuf>,
        /// Destination to copy to.
        to: PathBuf,
    },
    /// Move one or more sources into a destination.
    Move {
        /// Source files or directories.
        from: Vec<PathBuf>,
        /// Destination to move to.
        to: PathBuf,
    },
    /// Mirror `src` into `dst`, deleting extraneous entries in `dst`.
    Push { src: PathBuf, dst: PathBuf },
    /// Mirror `dst` into `src`, deleting extraneous entries in `src`.
    Pull { src: PathBuf, dst: PathBuf },
    /// Test operation that reports `iterations` progress steps.
    Dummy { iterations: u32 },
}

impl OperationArgs {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationArgs::Copy { .. } => OperationKind::Copy,
            OperationArgs::Move { .. } => OperationKind::Move,
            OperationArgs::Push { .. } => OperationKind::Push,
            OperationArgs::Pull { .. } => OperationKind::Pull,
            OperationArgs::Dummy { .. } => OperationKind::Dummy,
        }
    }

    /// Reject argument sets no runner could act on.
    pub fn validate(&self) -> Result<()> {
        match self {
            OperationArgs::Copy { from, to } | OperationArgs::Move { from, to } => {
                if from.is_empty() {
                    return Err(Error::InvalidArgs(format!(
                        "{} needs at least one source",
                        self.kind()
                    )));
                }
                for path in from {
                    require_path(path, "source")?;
                }
                require_path(to, "destination")
            }
            OperationArgs::Push { src, dst } | OperationArgs::Pull { src, dst } => {
                require_path(src, "source")?;
                require_path(dst, "destination")
            }
            OperationArgs::Dummy { .. } => Ok(()),
        }
    }

    /// Resolve relative paths against the current working directory.
    ///
    /// The daemon runs with its own working directory, so clients resolve
    /// paths before sending them.
    pub fn absolutize(self) -> Result<Self> {
        let args = match self {
            OperationArgs::Copy { from, to } => OperationArgs::Copy {
                from: absolutize_all(&from)?,
                to: absolutize_keep_slash(&to)?,
            },
            OperationArgs::Move { from, to } => OperationArgs::Move {
                from: absolutize_all(&from)?,
                to: absolutize_keep_slash(&to)?,
            },
            OperationArgs::Push { src, dst } => OperationArgs::Push {
                src: absolutize_keep_slash(&src)?,
                dst: absolutize_keep_slash(&dst)?,
            },
            OperationArgs::Pull { src, dst } => OperationArgs::Pull {
                src: absolutize_keep_slash(&src)?,
                dst: absolutize_keep_slash(&dst)?,
            },
            dummy @ OperationArgs::Dummy { .. } => dummy,
        };
        Ok(args)
    }
}

fn require_path(path: &Path, what: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgs(format!("{what} path is empty")));
    }
    Ok(())
}

fn absolutize_all(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|p| absolutize_keep_slash(p)).collect()
}

// A trailing slash changes what the transfer tool copies, so it survives resolution.
fn absolutize_keep_slash(path: &Path) -> Result<PathBuf> {
    let resolved = path
        .absolutize()
        .map_err(|e| Error::InvalidArgs(format!("cannot resolve {}: {e}", path.display())))?;
    let raw = path.as_os_str().to_string_lossy();
    let mut resolved = resolved.into_owned();
    if raw.len() > 1 && raw.ends_with('/') {
        resolved.as_mut_os_string().push("/");
    }
    Ok(resolved)
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Finished | OperationState::Aborted | OperationState::Failed
        )
    }

    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Finished | Aborted | Failed)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Finished => "finished",
            OperationState::Aborted => "aborted",
            OperationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Immutable progress snapshot of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperationStatus {
    pub message: String,
    pub bytes_total: u64,
    pub bytes_diff_total: u64,
    pub bytes_done: u64,
    pub files_total: u64,
    pub files_diff_total: u64,
    pub files_done: u64,
    /// Fraction in `[0, 1]`, two decimals.
    pub progress: f64,
    /// Bytes per second, two decimals.
    pub speed: f64,
    /// `None` until the tool reports a usable estimate.
    pub seconds_left: Option<u64>,
    /// Path currently being transferred, empty when none.
    pub file_name: String,
    pub finished: bool,
    /// Set only when `finished` is true.
    pub exit_code: Option<i32>,
}

impl OperationStatus {
    /// Status of an operation no runner has reported on yet.
    pub fn pending() -> Self {
        Self {
            message: "pending".to_string(),
            bytes_total: 0,
            bytes_diff_total: 0,
            bytes_done: 0,
            files_total: 0,
            files_diff_total: 0,
            files_done: 0,
            progress: 0.0,
            speed: 0.0,
            seconds_left: None,
            file_name: String::new(),
            finished: false,
            exit_code: None,
        }
    }

    /// Terminal status for an operation whose runner never got going.
    pub fn launch_failure(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            finished: true,
            exit_code: Some(exit_code),
            ..Self::pending()
        }
    }

    /// Convert raw parsed progress into a status snapshot.
    ///
    /// This is the only place `progress` and `speed` are rounded.
    pub fn from_progress(raw: &TransferProgress) -> Self {
        let bytes_done = raw.bytes_done.max(0.0) as u64;
        let bytes_done = if raw.bytes_total > 0 {
            bytes_done.min(raw.bytes_total)
        } else {
            bytes_done
        };
        let files_done = if raw.files_total > 0 {
            raw.files_done.min(raw.files_total)
        } else {
            raw.files_done
        };
        let progress = if raw.bytes_total > 0 {
            raw.bytes_done / raw.bytes_total as f64
        } else {
            raw.progress
        };

        Self {
            message: raw.message.clone(),
            bytes_total: raw.bytes_total,
            bytes_diff_total: raw.bytes_diff_total,
            bytes_done,
            files_total: raw.files_total,
            files_diff_total: raw.files_diff_total,
            files_done,
            progress: round2(progress.clamp(0.0, 1.0)),
            speed: round2(raw.speed.max(0.0)),
            seconds_left: raw.seconds_left,
            file_name: raw.file_name.clone(),
            finished: raw.finished,
            exit_code: if raw.finished { raw.exit_code } else { None },
        }
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Operation {
    pub id: OperationId,
    pub args: OperationArgs,
    pub state: OperationState,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        self.args.kind()
    }
}
