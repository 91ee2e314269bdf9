use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::bus::Bus;
use crate::cli::Cli;
use crate::client::Client;
use crate::config::DaemonConfig;
use crate::daemon::Daemon;
use crate::exit_codes::exit;
use crate::model::{OperationArgs, OperationState};
use crate::protocol;
use crate::reporter::Reporter;

/// Run the command line: print the schema, or drive one operation in the foreground.
pub fn run(cli: Cli) -> Result<i32> {
    let Some(args) = cli.command.operation_args() else {
        println!("{}", protocol::generate_schema());
        return Ok(exit::SUCCESS);
    };
    let config = resolve_config(&cli)?;
    let args = args.absolutize()?;
    transfer(config, args, cli.json)
}

/// Config file first, then command-line overrides.
pub fn resolve_config(cli: &Cli) -> Result<DaemonConfig> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(program) = &cli.transfer_program {
        config.transfer_program = program.clone();
    }
    if let Some(grace) = cli.abort_grace {
        config.abort_grace = grace;
    }
    if let Some(interval) = cli.dummy_interval {
        config.dummy_interval = interval;
    }
    Ok(config)
}

/// Start an in-process daemon, submit one operation and follow it to completion.
pub fn transfer(config: DaemonConfig, args: OperationArgs, json: bool) -> Result<i32> {
    let mut reporter = Reporter::new(json);
    let bus = Arc::new(Bus::new());
    let daemon = Daemon::spawn(Arc::clone(&bus), config);
    let client = Client::new(Arc::clone(&bus));

    // Subscribed before the create request so no early update is missed.
    let monitor = client.monitor(&[]);
    let operation = client
        .create_operation(args)
        .context("failed to start operation")?;
    reporter.created(&operation);

    monitor.wait_finished(&[operation.id], None, |update| {
        if update.operation_id == operation.id {
            reporter.status(update);
        }
    })?;
    drop(monitor);

    let operations = client.list_operations()?;
    reporter.operations(&operations);
    info!("{}", reporter.summary());
    daemon.shutdown();

    let state = operations
        .iter()
        .find(|o| o.id == operation.id)
        .map(|o| o.state);
    Ok(match state {
        Some(OperationState::Finished) => exit::SUCCESS,
        _ => exit::OPERATION_FAILURE,
    })
}
