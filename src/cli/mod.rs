// Copyright 2024-2026 Stagehand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Operator commands for running suite phases by hand.
//!
//! ## Usage
//!
//! ```bash
//! stagehand setup                 # package + install the buildpack, print shared state
//! stagehand teardown              # global cleanup if no worker is still running
//! stagehand package               # package only
//! stagehand manifest node 10.x    # latest manifest version matching a constraint
//! stagehand traffic vendored      # stage a fixture locally, assert no network use
//! stagehand config show           # effective configuration
//! ```
//!
//! Exit codes: 0 success, 1 failure, 2 configuration error.

pub mod config_cmd;
pub mod inspect_cmd;
pub mod suite_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for a failed operation.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for unusable configuration.
pub const EXIT_CONFIG: i32 = 2;

/// Stagehand - buildpack integration harness
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run global setup and print the shared state as JSON
    Setup,
    /// Run global cleanup once no worker is registered
    Teardown,
    /// Package the buildpack without installing it
    Package {
        /// Build an uncached archive
        #[arg(long)]
        uncached: bool,
    },
    /// Print the newest manifest version of a dependency matching a constraint
    Manifest {
        dependency: String,
        constraint: String,
        /// Archive to read (defaults to the configured one, then BUILDPACK_DIR)
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Stage a fixture locally and check its network traffic
    Traffic {
        /// Fixture path relative to the fixtures directory
        fixture: String,
        /// Route staging through a recording proxy instead of asserting no traffic
        #[arg(long)]
        proxy: bool,
        /// With --proxy, the only upstream host allowed
        #[arg(long)]
        expect_host: Option<String>,
        /// Buildpack archive (defaults to the configured pre-built one)
        #[arg(long)]
        buildpack: Option<PathBuf>,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print effective configuration
    Show,
    /// Check for problems that make the suite unrunnable
    Validate,
}

impl Cli {
    /// Run the command and return the process exit code.
    pub async fn run(self) -> i32 {
        match self.command {
            Commands::Setup => suite_cmd::run_setup().await,
            Commands::Teardown => suite_cmd::run_teardown().await,
            Commands::Package { uncached } => suite_cmd::run_package(uncached).await,
            Commands::Manifest {
                dependency,
                constraint,
                archive,
            } => inspect_cmd::run_manifest(&dependency, &constraint, archive.as_deref()),
            Commands::Traffic {
                fixture,
                proxy,
                expect_host,
                buildpack,
            } => {
                inspect_cmd::run_traffic(&fixture, proxy, expect_host.as_deref(), buildpack.as_deref())
                    .await
            }
            Commands::Config { action } => match action {
                ConfigAction::Show => config_cmd::run_show(),
                ConfigAction::Validate => config_cmd::run_validate(),
            },
            Commands::Version => {
                println!("stagehand {}", env!("CARGO_PKG_VERSION"));
                EXIT_OK
            }
        }
    }
}

/// Load configuration, reporting a bad config file on stderr.
pub(crate) fn load_config() -> Option<crate::config::SuiteConfig> {
    match crate::config::load() {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            None
        }
    }
}
