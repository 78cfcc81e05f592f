// Copyright 2024-2026 Stagehand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Suite phase subcommands: setup, teardown, package.
//!
//! `setup` lets CI package and install the buildpack once before launching
//! test workers; they find the published state in the hand-off directory and
//! skip their own election. `teardown` cleans up once the test binaries exit;
//! every process resolves the same run id, so it finds their hand-off dir.

use std::sync::Arc;

use tracing::warn;

use super::{load_config, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
use crate::buildpack::{CliPackager, Packager};
use crate::config::SuiteConfig;
use crate::platform::Platform;
use crate::process::{CliRunner, CommandRunner};
use crate::suite::{remove_buildpack, Handoff, SharedState, SuiteController};

fn usable_config() -> Option<SuiteConfig> {
    let config = load_config()?;
    let problems = config.validate();
    if problems.is_empty() {
        return Some(config);
    }
    for problem in &problems {
        eprintln!("ERROR: {}", problem);
    }
    None
}

/// Run global setup and print the shared state.
pub async fn run_setup() -> i32 {
    let Some(config) = usable_config() else {
        return EXIT_CONFIG;
    };
    let runner: Arc<dyn CommandRunner> = Arc::new(CliRunner::new());
    let platform = Platform::new(runner.clone());
    let packager = CliPackager::new(runner);

    let mut controller = match SuiteController::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return EXIT_FAILURE;
        }
    };
    let result = controller.join(&packager, &platform).await;
    // This process is not a test worker; the last real worker tears down.
    if let Err(e) = controller.handoff().deregister_worker(controller.worker_id()) {
        warn!(error = %e, "failed to deregister setup process");
    }
    match result.and_then(|shared| Ok(serde_json::to_string_pretty(&shared)?)) {
        Ok(json) => {
            println!("{}", json);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            EXIT_FAILURE
        }
    }
}

/// Global cleanup, if no worker is still registered.
///
/// Fails when the hand-off directory holds no shared state: that means this
/// process resolved a different run id than the one the tests used.
pub async fn run_teardown() -> i32 {
    let Some(config) = load_config() else {
        return EXIT_CONFIG;
    };
    let platform = Platform::new(Arc::new(CliRunner::new()));
    let handoff = match Handoff::open(&config.handoff_dir) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return EXIT_FAILURE;
        }
    };
    match handoff.live_workers() {
        Ok(0) => {}
        Ok(n) => {
            eprintln!("{} worker(s) still registered; leaving teardown to them", n);
            return EXIT_FAILURE;
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return EXIT_FAILURE;
        }
    }
    let shared = match handoff.shared_state::<SharedState>() {
        Ok(Some(shared)) => shared,
        Ok(None) => {
            eprintln!(
                "ERROR: no shared state in {} (run id {}); nothing was set up under this id. \
                 Set STAGEHAND_RUN_ID or STAGEHAND_HANDOFF_DIR to the values the test run used.",
                handoff.dir().display(),
                config.run_id
            );
            // Drop a failed setup's leftovers so the next run can elect again.
            if let Err(e) = handoff.clear() {
                warn!(error = %e, "failed to clear hand-off dir");
            }
            return EXIT_FAILURE;
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return EXIT_FAILURE;
        }
    };
    let result = match remove_buildpack(&shared, &platform).await {
        Ok(()) => handoff.clear(),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            println!("Teardown complete.");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            EXIT_FAILURE
        }
    }
}

/// Package the buildpack source tree and print the archive identity.
pub async fn run_package(uncached: bool) -> i32 {
    let Some(config) = load_config() else {
        return EXIT_CONFIG;
    };
    let Some(dir) = config.buildpack_dir.clone() else {
        eprintln!("ERROR: setting $BUILDPACK_DIR is required");
        return EXIT_CONFIG;
    };
    let packager = CliPackager::new(Arc::new(CliRunner::new()));
    match packager.package(&dir, &config.stack, config.cached && !uncached).await {
        Ok(bp) => {
            println!("file={}", bp.file.display());
            println!("version={}", bp.version);
            println!("sha256={}", bp.sha256);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            EXIT_FAILURE
        }
    }
}
