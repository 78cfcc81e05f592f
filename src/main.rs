//! Stagehand entry point.
//!
//! Runs suite phases by hand (setup, teardown, packaging) and inspects
//! buildpack archives and staging traffic without a test runner.

use std::process::ExitCode;

use clap::Parser;

use stagehand::cli::Cli;
use stagehand::telemetry::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging disabled: {}", e);
    }

    let code = cli.run().await;
    ExitCode::from(code.clamp(0, 255) as u8)
}
