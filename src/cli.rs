use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::OperationArgs;

/// Supervised file transfers with live progress.
#[derive(Parser)]
#[command(name = "xferd", version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output structured JSON lines to stdout.
    #[arg(long, global = true)]
    pub json: bool,

    /// Daemon config file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the transfer tool.
    #[arg(long, global = true)]
    pub transfer_program: Option<PathBuf>,

    /// Override the grace period between terminate and kill (e.g. "5s").
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub abort_grace: Option<Duration>,

    /// Override the delay between dummy iterations (e.g. "200ms").
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub dummy_interval: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print JSON Schema for bus messages.
    Schema,
    /// Copy sources into a destination.
    #[command(visible_alias = "cp")]
    Copy(TransferArgs),
    /// Move sources into a destination.
    #[command(visible_alias = "mv")]
    Move(TransferArgs),
    /// Mirror SRC into DST, deleting extraneous files in DST.
    Push(MirrorArgs),
    /// Mirror DST back into SRC, deleting extraneous files in SRC.
    Pull(MirrorArgs),
    /// Run a simulated operation that only reports progress.
    Dummy(DummyArgs),
}

#[derive(Args)]
pub struct TransferArgs {
    /// Source paths.
    #[arg(required = true, num_args = 1..)]
    pub src: Vec<PathBuf>,

    /// Destination path.
    pub dst: PathBuf,
}

#[derive(Args)]
pub struct MirrorArgs {
    pub src: PathBuf,
    pub dst: PathBuf,
}

#[derive(Args)]
pub struct DummyArgs {
    /// Number of progress steps.
    #[arg(default_value_t = 10)]
    pub iterations: u32,
}

impl Command {
    /// Operation arguments for the transfer subcommands, `None` for the rest.
    pub fn operation_args(&self) -> Option<OperationArgs> {
        let args = match self {
            Command::Schema => return None,
            Command::Copy(a) => OperationArgs::Copy {
                from: a.src.clone(),
                to: a.dst.clone(),
            },
            Command::Move(a) => OperationArgs::Move {
                from: a.src.clone(),
                to: a.dst.clone(),
            },
            Command::Push(a) => OperationArgs::Push {
                src: a.src.clone(),
                dst: a.dst.clone(),
            },
            Command::Pull(a) => OperationArgs::Pull {
                src: a.src.clone(),
                dst: a.dst.clone(),
            },
            Command::Dummy(a) => OperationArgs::Dummy {
                iterations: a.iterations,
            },
        };
        Some(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_takes_many_sources_and_one_destination() {
        let cli = Cli::try_parse_from(["xferd", "cp", "a", "b", "dst"]).unwrap();
        let Some(OperationArgs::Copy { from, to }) = cli.command.operation_args() else {
            panic!("expected copy");
        };
        assert_eq!(from, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(to, PathBuf::from("dst"));
    }

    #[test]
    fn global_overrides_parse_durations() {
        let cli = Cli::try_parse_from([
            "xferd",
            "dummy",
            "3",
            "--dummy-interval",
            "10ms",
            "--abort-grace",
            "2s",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.dummy_interval, Some(Duration::from_millis(10)));
        assert_eq!(cli.abort_grace, Some(Duration::from_secs(2)));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command.operation_args(),
            Some(OperationArgs::Dummy { iterations: 3 })
        ));
    }

    #[test]
    fn copy_requires_a_source() {
        assert!(Cli::try_parse_from(["xferd", "copy", "dst"]).is_err());
    }
}
