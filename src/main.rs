//! `xferd` - supervised file transfers with live progress.
//!
//! See `DESIGN.md` for architecture.

use clap::Parser;
use tracing::Level;

use xferd::cli::Cli;
use xferd::exit_codes::exit;

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match xferd::engine::run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit::ERROR
        }
    };
    std::process::exit(exit_code);
}
