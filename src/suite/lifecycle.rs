//! Suite controller, per-worker context, and application guards.

use std::future::Future;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Handoff, SharedState, SuitePhase};
use crate::app::{App, NameGenerator};
use crate::browser::BrowserDriver;
use crate::buildpack::{resolve, Packager};
use crate::config::SuiteConfig;
use crate::driver::DeploymentDriver;
use crate::error::{HarnessError, Result};
use crate::fixture::{FixtureRoot, WorkingCopy};
use crate::http::HttpProbe;
use crate::platform::{cf_home_source, copy_cf_home, ApiCapability, Platform};
use crate::poll::Poller;
use crate::process::{CliRunner, CommandRunner, Invocation};
use crate::traffic::{DockerStager, TrafficMonitor};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Package (or adopt) the buildpack and register it on the platform.
pub async fn install_buildpack(
    config: &SuiteConfig,
    packager: &dyn Packager,
    platform: &Platform,
) -> Result<SharedState> {
    let buildpack = resolve(config, packager).await?;
    let name = config.platform_buildpack_name();
    let stack = match platform.supports(ApiCapability::StackAssociation).await {
        Ok(true) => Some(config.stack.as_str()),
        Ok(false) => None,
        Err(e) => {
            if let Err(cleanup) = buildpack.remove() {
                warn!(error = %cleanup, "failed to remove packaged buildpack after setup failure");
            }
            return Err(HarnessError::setup(format!("cannot read platform API version: {}", e)));
        }
    };
    if let Err(e) = platform
        .create_or_update_buildpack(&name, &buildpack.file, stack)
        .await
    {
        if let Err(cleanup) = buildpack.remove() {
            warn!(error = %cleanup, "failed to remove packaged buildpack after install failure");
        }
        return Err(HarnessError::setup(format!("installing {}: {}", name, e)));
    }
    info!(buildpack = %name, version = %buildpack.version, "buildpack ready");
    Ok(SharedState {
        run_id: config.run_id.clone(),
        buildpack,
        platform_buildpack: name,
        installed: true,
        created_at: Utc::now(),
    })
}

/// Undo [`install_buildpack`]. Every step runs; the first failure is returned.
pub async fn remove_buildpack(shared: &SharedState, platform: &Platform) -> Result<()> {
    let mut first_error: Option<HarnessError> = None;
    if shared.installed {
        if let Err(e) = platform.delete_buildpack(&shared.platform_buildpack).await {
            warn!(buildpack = %shared.platform_buildpack, error = %e, "failed to delete buildpack");
            first_error.get_or_insert(e);
        }
    }
    if let Err(e) = shared.buildpack.remove() {
        warn!(error = %e, "failed to remove buildpack archive");
        first_error.get_or_insert(e);
    }
    if let Err(e) = platform.delete_orphaned_routes().await {
        warn!(error = %e, "failed to delete orphaned routes");
        first_error.get_or_insert(e);
    }
    first_error.map_or(Ok(()), Err)
}

/// One worker's view of the suite lifecycle.
pub struct SuiteController {
    config: SuiteConfig,
    handoff: Handoff,
    worker_id: String,
    phase: SuitePhase,
    shared: Option<SharedState>,
}

impl SuiteController {
    pub fn new(config: SuiteConfig) -> Result<Self> {
        let handoff = Handoff::open(&config.handoff_dir)?;
        Ok(Self {
            config,
            handoff,
            worker_id: Uuid::new_v4().simple().to_string(),
            phase: SuitePhase::NotStarted,
            shared: None,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn phase(&self) -> SuitePhase {
        self.phase
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    /// Join the suite. The elected worker runs `global_setup`; every worker
    /// then waits for its published result.
    pub async fn join_with<F, Fut>(&mut self, global_setup: F) -> Result<SharedState>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedState>>,
    {
        self.handoff.register_worker(&self.worker_id)?;
        if self.handoff.try_elect(&self.worker_id)? {
            match global_setup().await {
                Ok(state) => self.handoff.publish(&state)?,
                Err(e) => {
                    error!(error = %e, "global setup failed");
                    self.handoff.publish_failure(&e.to_string())?;
                }
            }
        }

        let poller = Poller::new(self.config.poll_interval, self.config.setup_timeout);
        let joined = match self.handoff.wait_for::<SharedState>(&poller).await {
            Ok(shared) => shared.buildpack.verify().map(|()| shared),
            Err(e) => Err(e),
        };
        match joined {
            Ok(shared) => {
                info!(worker = %self.worker_id, version = %shared.buildpack.version, "joined suite");
                self.phase = SuitePhase::SharedStateReady;
                self.shared = Some(shared.clone());
                Ok(shared)
            }
            Err(e) => {
                if let Err(cleanup) = self.handoff.deregister_worker(&self.worker_id) {
                    warn!(error = %cleanup, "failed to deregister worker");
                }
                Err(e)
            }
        }
    }

    /// Join with the default global setup: [`install_buildpack`].
    pub async fn join(&mut self, packager: &dyn Packager, platform: &Platform) -> Result<SharedState> {
        let config = self.config.clone();
        self.join_with(|| async move { install_buildpack(&config, packager, platform).await })
            .await
    }

    /// Per-worker setup with a private copy of the operator's `cf` login.
    pub async fn start_worker(&mut self) -> Result<WorkerContext> {
        let source = cf_home_source()
            .ok_or_else(|| HarnessError::setup("neither CF_HOME nor HOME is set"))?;
        let home = tempfile::Builder::new().prefix("stagehand-cf-home-").tempdir()?;
        let cf_home = copy_cf_home(&source, home.path())?;
        let cf_home = cf_home.display().to_string();
        let runner: Arc<dyn CommandRunner> =
            Arc::new(CliRunner::new().with_env("CF_HOME", cf_home));

        let mut worker = self.start_worker_with(runner).await?;
        worker.cf_home = Some(home);
        Ok(worker)
    }

    /// Per-worker setup around an existing runner.
    pub async fn start_worker_with(&mut self, runner: Arc<dyn CommandRunner>) -> Result<WorkerContext> {
        let shared = self
            .shared
            .clone()
            .ok_or_else(|| HarnessError::setup("worker started before joining the suite"))?;
        let fixtures = FixtureRoot::from_config(&self.config)?;
        let http = HttpProbe::new(HTTP_TIMEOUT)?;
        let browser = if self.config.browser {
            let ready = Poller::new(Duration::from_millis(250), Duration::from_secs(30));
            Some(BrowserDriver::start(runner.clone(), ready).await?)
        } else {
            None
        };
        let driver = DeploymentDriver::from_config(&self.config, shared.buildpack.version.clone());

        self.phase = SuitePhase::WorkerReady;
        Ok(WorkerContext {
            id: self.worker_id.clone(),
            shared,
            config: self.config.clone(),
            platform: Platform::new(runner.clone()),
            runner,
            names: NameGenerator::from_entropy(),
            driver,
            fixtures,
            http,
            browser,
            cf_home: None,
        })
    }

    /// Local cleanup, then global cleanup if this is the last worker out.
    ///
    /// Global cleanup failures are logged and returned; they never panic.
    pub async fn teardown_with<F, Fut>(
        &mut self,
        worker: Option<WorkerContext>,
        global_cleanup: F,
    ) -> Result<()>
    where
        F: FnOnce(SharedState) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.phase = SuitePhase::TearingDown;
        if let Some(worker) = worker {
            worker.close().await;
        }

        let remaining = self.handoff.deregister_worker(&self.worker_id)?;
        let mut result = Ok(());
        if remaining == 0 && self.handoff.try_claim_teardown(&self.worker_id)? {
            let shared = match self.shared.clone() {
                Some(shared) => Some(shared),
                None => self.handoff.shared_state::<SharedState>()?,
            };
            match shared {
                Some(shared) => {
                    info!(worker = %self.worker_id, "running global teardown");
                    match global_cleanup(shared).await {
                        Ok(()) => self.handoff.clear()?,
                        Err(e) => {
                            warn!(error = %e, "global teardown failed");
                            result = Err(e);
                        }
                    }
                }
                None => {
                    info!("no shared state published; nothing to tear down");
                    self.handoff.clear()?;
                }
            }
        }
        self.phase = SuitePhase::Done;
        result
    }

    /// Teardown with the default global cleanup: [`remove_buildpack`].
    pub async fn teardown(&mut self, worker: Option<WorkerContext>, platform: &Platform) -> Result<()> {
        self.teardown_with(worker, |shared| async move {
            remove_buildpack(&shared, platform).await
        })
        .await
    }
}

/// Everything a scenario needs from its worker.
pub struct WorkerContext {
    id: String,
    shared: SharedState,
    config: SuiteConfig,
    runner: Arc<dyn CommandRunner>,
    names: NameGenerator,
    platform: Platform,
    driver: DeploymentDriver,
    fixtures: FixtureRoot,
    http: HttpProbe,
    browser: Option<BrowserDriver>,
    cf_home: Option<TempDir>,
}

impl WorkerContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn names(&self) -> &NameGenerator {
        &self.names
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn driver(&self) -> &DeploymentDriver {
        &self.driver
    }

    pub fn fixtures(&self) -> &FixtureRoot {
        &self.fixtures
    }

    pub fn http(&self) -> &HttpProbe {
        &self.http
    }

    pub fn browser(&self) -> Option<&BrowserDriver> {
        self.browser.as_ref()
    }

    fn apply_defaults(&self, app: &mut App) {
        let s = &mut app.settings;
        s.memory = Some(self.config.default_memory.clone());
        s.disk = Some(self.config.default_disk.clone());
        s.stack = Some(self.config.stack.clone());
        if self.config.buildpack_name == "php" {
            if let Some(token) = &self.config.composer_token {
                s.env
                    .insert("COMPOSER_GITHUB_OAUTH_TOKEN".to_string(), token.clone());
            }
        }
    }

    /// Handle for the fixture at `fixtures/<names...>`.
    pub fn app(&self, names: &[&str]) -> Result<App> {
        let fixture = self.fixtures.get(names)?;
        let mut app = App::new(&fixture, &self.names, self.runner.clone(), self.http.clone());
        self.apply_defaults(&mut app);
        Ok(app)
    }

    /// Private copy of a fixture, for scenarios that template or mutate it.
    pub fn copy_fixture(&self, names: &[&str]) -> Result<WorkingCopy> {
        self.fixtures.get(names)?.copy()
    }

    pub fn app_from_copy(&self, copy: WorkingCopy) -> App {
        let mut app = App::from_working_copy(copy, &self.names, self.runner.clone(), self.http.clone());
        self.apply_defaults(&mut app);
        app
    }

    /// Destroys `app` when the scenario ends, however it ends.
    pub fn guard(&self, app: App) -> AppGuard {
        AppGuard::new(app)
    }

    /// Local staging monitor using the stack's image.
    pub fn traffic_monitor(&self) -> TrafficMonitor {
        let stager = DockerStager::new(self.runner.clone(), self.config.stager_image.clone());
        TrafficMonitor::new(Arc::new(stager)).with_proxy_address(
            SocketAddr::from(([0, 0, 0, 0], 0)),
            Some(self.config.proxy_host.clone()),
        )
    }

    /// Stop the browser and drop the private CLI home.
    pub async fn close(mut self) {
        if let Some(browser) = self.browser.take() {
            browser.stop().await;
        }
        if let Some(home) = self.cf_home.take() {
            if let Err(e) = home.close() {
                warn!(worker = %self.id, error = %e, "failed to remove worker CF_HOME");
            }
        }
    }
}

/// Owns an [`App`] for one scenario and deletes it from the platform at the end.
///
/// Prefer [`AppGuard::finish`]; dropping the guard falls back to a blocking
/// `cf delete` through the app's runner, after printing recent logs if the
/// thread is panicking.
pub struct AppGuard {
    app: App,
}

impl AppGuard {
    pub fn new(app: App) -> Self {
        Self { app }
    }

    /// Destroy the app, printing its recent logs first when `outcome` failed.
    pub async fn finish<T>(self, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            match self.app.recent_logs().await {
                Ok(logs) => eprintln!("{} failed: {}\nrecent logs:\n{}", self.app.name(), e, logs),
                Err(log_err) => warn!(app = self.app.name(), error = %log_err, "could not fetch recent logs"),
            }
        }
        if let Err(e) = self.app.destroy().await {
            warn!(app = self.app.name(), error = %e, "teardown failed");
        }
        outcome
    }
}

impl Deref for AppGuard {
    type Target = App;

    fn deref(&self) -> &App {
        &self.app
    }
}

impl DerefMut for AppGuard {
    fn deref_mut(&mut self) -> &mut App {
        &mut self.app
    }
}

impl Drop for AppGuard {
    fn drop(&mut self) {
        if !self.app.mark_destroyed() {
            return;
        }
        let name = self.app.name().to_string();
        let runner = self.app.runner();
        if std::thread::panicking() {
            match runner.run_blocking(&Invocation::cf(["logs", name.as_str(), "--recent"])) {
                Ok(out) => eprintln!("recent logs for {}:\n{}", name, out.stdout),
                Err(e) => warn!(app = %name, error = %e, "could not fetch recent logs"),
            }
        }
        let delete = Invocation::cf(["delete", "-f", "-r", name.as_str()]);
        match runner.run_blocking(&delete).and_then(|out| out.check(&delete)) {
            Ok(_) => info!(app = %name, "deleted"),
            Err(e) => warn!(app = %name, error = %e, "delete failed"),
        }
    }
}
