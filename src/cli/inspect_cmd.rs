// Copyright 2024-2026 Stagehand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inspection subcommands: manifest, traffic.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{load_config, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
use crate::buildpack::BuildpackManifest;
use crate::config::SuiteConfig;
use crate::error::{HarnessError, Result};
use crate::fixture::FixtureRoot;
use crate::process::CliRunner;
use crate::suite::{Handoff, SharedState};
use crate::traffic::{DockerStager, TrafficMonitor, TrafficReport};

fn read_manifest(config: &SuiteConfig, archive: Option<&Path>) -> Result<BuildpackManifest> {
    if let Some(archive) = archive {
        return BuildpackManifest::from_archive(archive);
    }
    if let Some(prebuilt) = &config.prebuilt {
        return BuildpackManifest::from_archive(&prebuilt.file);
    }
    match &config.buildpack_dir {
        Some(dir) => BuildpackManifest::from_dir(dir),
        None => Err(HarnessError::config(
            "no archive given and $BUILDPACK_DIR is unset",
        )),
    }
}

/// Print the newest version of `dependency` satisfying `constraint`.
pub fn run_manifest(dependency: &str, constraint: &str, archive: Option<&Path>) -> i32 {
    let Some(config) = load_config() else {
        return EXIT_CONFIG;
    };
    match read_manifest(&config, archive).and_then(|m| m.latest_matching(dependency, constraint)) {
        Ok(version) => {
            println!("{}", version);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            EXIT_FAILURE
        }
    }
}

/// Archive to stage with: explicit, then pre-built, then the suite's published one.
fn staging_archive(config: &SuiteConfig, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(prebuilt) = &config.prebuilt {
        return Some(prebuilt.file.clone());
    }
    let handoff = Handoff::open(&config.handoff_dir).ok()?;
    let shared: SharedState = handoff.shared_state().ok()??;
    Some(shared.buildpack.file)
}

fn print_report(report: &TrafficReport) {
    println!("outcome={:?}", report.outcome);
    println!("packets={}", report.traffic.packets());
    for destination in report.traffic.destinations() {
        println!("destination={}", destination);
    }
}

/// Stage `fixture` locally and assert on its network traffic.
pub async fn run_traffic(
    fixture: &str,
    proxy: bool,
    expect_host: Option<&str>,
    buildpack: Option<&Path>,
) -> i32 {
    let Some(config) = load_config() else {
        return EXIT_CONFIG;
    };
    let Some(archive) = staging_archive(&config, buildpack) else {
        eprintln!("ERROR: no buildpack archive; pass --buildpack or run `stagehand setup`");
        return EXIT_CONFIG;
    };
    let fixture = match FixtureRoot::from_config(&config).and_then(|root| root.get(&[fixture])) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return EXIT_CONFIG;
        }
    };

    let stager = DockerStager::new(Arc::new(CliRunner::new()), config.stager_image.clone());
    let monitor = TrafficMonitor::new(Arc::new(stager)).with_proxy_address(
        SocketAddr::from(([0, 0, 0, 0], 0)),
        Some(config.proxy_host.clone()),
    );
    let result = if proxy {
        monitor
            .assert_routes_through_proxy(fixture.path(), &archive, expect_host)
            .await
    } else {
        monitor.assert_airgapped(fixture.path(), &archive).await
    };
    match result {
        Ok(report) => {
            print_report(&report);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            EXIT_FAILURE
        }
    }
}
