//! Deployment driver: push, wait for a terminal state, confirm.
//!
//! The driver only talks to a [`Deployable`], so its polling and confirmation
//! logic can be exercised against a scripted fake.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use crate::app::{App, InstanceState};
use crate::config::SuiteConfig;
use crate::error::{HarnessError, Result};
use crate::output::LogBuffer;
use crate::poll::{Poller, Probe};

/// What the driver needs from an application handle.
#[async_trait]
pub trait Deployable: Send + Sync {
    fn name(&self) -> &str;

    /// Captured platform output for this app.
    fn output(&self) -> &LogBuffer;

    async fn push(&self) -> Result<()>;

    async fn instance_states(&self) -> Result<Vec<InstanceState>>;

    async fn restart(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;
}

#[async_trait]
impl Deployable for App {
    fn name(&self) -> &str {
        App::name(self)
    }

    fn output(&self) -> &LogBuffer {
        App::output(self)
    }

    async fn push(&self) -> Result<()> {
        App::push(self).await
    }

    async fn instance_states(&self) -> Result<Vec<InstanceState>> {
        App::instance_states(self).await
    }

    async fn restart(&self) -> Result<()> {
        App::restart(self).await
    }

    async fn stop(&self) -> Result<()> {
        App::stop(self).await
    }

    async fn destroy(&self) -> Result<()> {
        App::destroy(self).await
    }
}

fn buildpack_version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Buildpack version (\S+)").expect("buildpack version pattern is valid")
    })
}

/// Every `Buildpack version X` announced in `text`, in order, deduplicated.
pub fn announced_versions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for cap in buildpack_version_pattern().captures_iter(text) {
        let v = cap[1].to_string();
        if !found.contains(&v) {
            found.push(v);
        }
    }
    found
}

fn describe(states: &[InstanceState]) -> String {
    let names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
    format!("[{}]", names.join(", "))
}

/// Drives [`Deployable`]s to confirmed states.
#[derive(Debug, Clone)]
pub struct DeploymentDriver {
    /// Bound and interval for the running-state poll.
    pub running: Poller,
    /// Bound and interval for waiting on log output.
    pub logs: Poller,
    /// Version every staged app must announce.
    pub buildpack_version: String,
}

impl DeploymentDriver {
    pub fn new(buildpack_version: impl Into<String>) -> Self {
        Self {
            running: Poller::new(Duration::from_secs(1), Duration::from_secs(60)),
            logs: Poller::new(Duration::from_millis(250), Duration::from_secs(10)),
            buildpack_version: buildpack_version.into(),
        }
    }

    pub fn from_config(config: &SuiteConfig, buildpack_version: impl Into<String>) -> Self {
        let mut driver = Self::new(buildpack_version);
        driver.running = Poller::new(config.poll_interval, config.push_timeout);
        driver.logs.interval = config.poll_interval.min(Duration::from_millis(250));
        driver
    }

    pub async fn push(&self, app: &dyn Deployable) -> Result<()> {
        app.push().await
    }

    /// Poll until every instance is running.
    pub async fn await_running(
        &self,
        app: &dyn Deployable,
        timeout: Duration,
    ) -> Result<Vec<InstanceState>> {
        let description = format!("instances of {} to be running", app.name());
        self.running
            .with_timeout(timeout)
            .until(&description, || async move {
                let states = app.instance_states().await?;
                if !states.is_empty() && states.iter().all(InstanceState::is_running) {
                    Ok(Probe::Ready(states))
                } else {
                    Ok(Probe::Pending(describe(&states)))
                }
            })
            .await
    }

    /// The captured output must announce exactly `expected`.
    pub fn confirm_buildpack(&self, app: &dyn Deployable, expected: &str) -> Result<()> {
        let found = announced_versions(&app.output().ansi_stripped());
        if found.iter().any(|version| version == expected) {
            return Ok(());
        }
        Err(HarnessError::BuildpackMismatch {
            expected: expected.to_string(),
            found,
        })
    }

    /// Push, wait for running, confirm the buildpack under test staged it.
    pub async fn push_and_confirm(&self, app: &dyn Deployable) -> Result<()> {
        self.push(app).await?;
        let states = self.await_running(app, self.running.timeout).await?;
        info!(app = app.name(), states = %describe(&states), "running");
        self.confirm_buildpack(app, &self.buildpack_version)
    }

    pub async fn restart(&self, app: &dyn Deployable) -> Result<()> {
        app.restart().await?;
        self.await_running(app, self.running.timeout).await?;
        Ok(())
    }

    /// Stop, then wait for the app's shutdown `message`.
    pub async fn stop_gracefully(
        &self,
        app: &dyn Deployable,
        message: &str,
        timeout: Duration,
    ) -> Result<()> {
        app.stop().await?;
        self.wait_for_log(app, message, timeout).await
    }

    /// Wait until `needle` appears in the ANSI-stripped output.
    pub async fn wait_for_log(
        &self,
        app: &dyn Deployable,
        needle: &str,
        timeout: Duration,
    ) -> Result<()> {
        let description = format!("{:?} in output of {}", needle, app.name());
        self.logs
            .with_timeout(timeout)
            .until(&description, || async move {
                let text = app.output().ansi_stripped();
                Ok(if text.contains(needle) {
                    Probe::Ready(())
                } else {
                    Probe::Pending(last_line(&text))
                })
            })
            .await
    }

    /// Wait until `pattern` matches the ANSI-stripped output.
    pub async fn wait_for_log_match(
        &self,
        app: &dyn Deployable,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<String> {
        let description = format!("/{}/ in output of {}", pattern, app.name());
        self.logs
            .with_timeout(timeout)
            .until(&description, || async move {
                let text = app.output().ansi_stripped();
                Ok(match pattern.find(&text) {
                    Some(m) => Probe::Ready(m.as_str().to_string()),
                    None => Probe::Pending(last_line(&text)),
                })
            })
            .await
    }

    /// The push must fail, and each diagnostic must then show up in the output.
    pub async fn expect_push_failure(
        &self,
        app: &dyn Deployable,
        diagnostics: &[&str],
    ) -> Result<()> {
        match app.push().await {
            Ok(()) => {
                return Err(HarnessError::UnexpectedSuccess {
                    app: app.name().to_string(),
                })
            }
            Err(e) => info!(app = app.name(), error = %e, "push failed as expected"),
        }
        for diagnostic in diagnostics {
            match self.wait_for_log(app, diagnostic, self.logs.timeout).await {
                Ok(()) => {}
                Err(e) if e.is_timeout() => {
                    return Err(HarnessError::MissingDiagnostic {
                        app: app.name().to_string(),
                        missing: diagnostic.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("<no output>")
        .to_string()
}
