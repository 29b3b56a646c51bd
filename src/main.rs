//! `nsrun`: run a command in new Linux namespaces.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

mod cli;

use cli::Cli;

fn configure_logging(verbose: bool) {
    let default_verbosity = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    // Parse errors exit 1; only --help and --version succeed.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    configure_logging(cli.verbose);

    let status = match cli.to_command().status() {
        Ok(status) => status,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!(%status, "terminating");
    ExitCode::from(status.shell_code())
}
