//! Live-platform scenarios.
//!
//! Requires a logged-in `cf` CLI and either `BUILDPACK_DIR` or a pre-built
//! archive (`STAGEHAND_BUILDPACK_FILE` + `STAGEHAND_BUILDPACK_VERSION`). The
//! first scenario to join packages and installs the buildpack; the rest reuse
//! it through the hand-off directory. Run `stagehand teardown` once the test
//! binaries exit to remove the buildpack and orphaned routes. It must see the
//! same configuration: the default run id is derived from the buildpack
//! source, stack and cache mode, so exporting those once is enough. It exits
//! non-zero if it finds no published setup under that id.
//!
//! ```text
//! BUILDPACK_DIR=~/workspace/nodejs-buildpack cargo test --features platform-e2e --test e2e nodejs
//! stagehand teardown
//! ```

#![cfg(feature = "platform-e2e")]

mod dotnet_core;
mod nodejs;
mod php;
mod python;

use std::path::PathBuf;
use std::sync::Arc;

use stagehand::buildpack::CliPackager;
use stagehand::config;
use stagehand::platform::{ApiCapability, Platform};
use stagehand::process::{CliRunner, CommandRunner};
use stagehand::telemetry::init_test_logging;
use stagehand::{AppGuard, SuiteController, WorkerContext};

/// One scenario's membership in the suite.
///
/// Global setup happens on first join. Leaving only drops this scenario's
/// worker marker; global cleanup is left to `stagehand teardown` so a gap
/// between scenarios never looks like the end of the suite.
pub struct Scenario {
    controller: SuiteController,
    worker: Option<WorkerContext>,
}

impl Scenario {
    pub async fn start() -> Self {
        init_test_logging();
        let config = config::load().expect("failed to load configuration");
        let problems = config.validate();
        assert!(problems.is_empty(), "unusable configuration: {:?}", problems);

        let runner: Arc<dyn CommandRunner> = Arc::new(CliRunner::new());
        let platform = Platform::new(runner.clone());
        let packager = CliPackager::new(runner);

        let mut controller = SuiteController::new(config).expect("failed to open hand-off dir");
        controller
            .join(&packager, &platform)
            .await
            .expect("global setup failed");
        let worker = controller
            .start_worker()
            .await
            .expect("worker setup failed");
        Self {
            controller,
            worker: Some(worker),
        }
    }

    pub fn ctx(&self) -> &WorkerContext {
        self.worker.as_ref().expect("scenario already finished")
    }

    pub async fn finish(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.close().await;
        }
    }
}

impl Drop for Scenario {
    fn drop(&mut self) {
        let handoff = self.controller.handoff();
        if let Err(e) = handoff.deregister_worker(self.controller.worker_id()) {
            eprintln!("failed to deregister scenario worker: {}", e);
        }
    }
}

/// Log why a scenario does not apply and let it pass.
pub fn skip(reason: &str) {
    eprintln!("Skipping: {}", reason);
}

pub fn skip_unless_cached(ctx: &WorkerContext) -> bool {
    if !ctx.config().cached {
        skip("running uncached tests");
        return true;
    }
    false
}

pub fn skip_unless_uncached(ctx: &WorkerContext) -> bool {
    if ctx.config().cached {
        skip("running cached tests");
        return true;
    }
    false
}

pub fn skip_unless_stack(ctx: &WorkerContext, stack: &str) -> bool {
    if ctx.config().stack != stack {
        skip(&format!("the stack {:?} is not supported", ctx.config().stack));
        return true;
    }
    false
}

pub async fn skip_unless_supported(ctx: &WorkerContext, capability: ApiCapability) -> bool {
    let supported = ctx
        .platform()
        .supports(capability)
        .await
        .expect("failed to read platform API version");
    if !supported {
        skip(&format!("platform API lacks {:?}", capability));
    }
    !supported
}

/// Path of a fixture, for local staging.
pub fn fixture_path(ctx: &WorkerContext, names: &[&str]) -> PathBuf {
    ctx.fixtures()
        .get(names)
        .expect("fixture not found")
        .path()
        .to_path_buf()
}

/// Guarded handle for a fixture with suite defaults applied.
pub fn guarded(ctx: &WorkerContext, names: &[&str]) -> AppGuard {
    ctx.guard(ctx.app(names).expect("fixture not found"))
}

/// Cached suites must stage `fixture` with no network traffic at all.
pub async fn assert_no_internet_traffic(ctx: &WorkerContext, names: &[&str]) {
    if skip_unless_cached(ctx) {
        return;
    }
    let report = ctx
        .traffic_monitor()
        .assert_airgapped(&fixture_path(ctx, names), &ctx.shared().buildpack.file)
        .await
        .expect("staging reached the network");
    assert!(report.traffic.is_empty());
}

/// Uncached suites must send every download through `HTTP(S)_PROXY`. With
/// `expected_host`, the proxy may only have been asked for that host.
pub async fn assert_uses_proxy_during_staging(
    ctx: &WorkerContext,
    names: &[&str],
    expected_host: Option<&str>,
) {
    if skip_unless_uncached(ctx) {
        return;
    }
    ctx.traffic_monitor()
        .assert_routes_through_proxy(
            &fixture_path(ctx, names),
            &ctx.shared().buildpack.file,
            expected_host,
        )
        .await
        .expect("staging bypassed the proxy");
}

/// The one host every manifest dependency is downloaded from, if there is one.
pub fn dependency_host(ctx: &WorkerContext) -> Option<String> {
    let hosts = ctx
        .shared()
        .buildpack
        .manifest()
        .expect("buildpack manifest is readable")
        .dependency_hosts();
    match hosts.as_slice() {
        [host] => Some(host.clone()),
        _ => None,
    }
}
