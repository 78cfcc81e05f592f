//! Application handles: one pushed fixture app and everything needed to
//! drive it through the platform CLI.

mod naming;

pub use naming::NameGenerator;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::fixture::{Fixture, WorkingCopy};
use crate::http::{HttpProbe, HttpResponse};
use crate::output::LogBuffer;
use crate::process::{BackgroundProcess, CommandRunner, Invocation};

/// Per-instance state as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Flapping,
    Down,
    Unknown(String),
}

impl InstanceState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STARTING" => Self::Starting,
            "RUNNING" => Self::Running,
            "CRASHED" => Self::Crashed,
            "FLAPPING" => Self::Flapping,
            "DOWN" => Self::Down,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Crashed => write!(f, "CRASHED"),
            Self::Flapping => write!(f, "FLAPPING"),
            Self::Down => write!(f, "DOWN"),
            Self::Unknown(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    state: String,
}

#[derive(Debug, Deserialize)]
struct PlatformErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    description: String,
}

/// Parse a `/v2/apps/<guid>/instances` body, ordered by instance index.
///
/// An app that has not finished staging reports no instances yet.
pub fn parse_instances(body: &str) -> Result<Vec<InstanceState>> {
    if let Ok(entries) = serde_json::from_str::<HashMap<String, InstanceEntry>>(body) {
        let mut indexed: Vec<(u32, InstanceState)> = entries
            .into_iter()
            .map(|(k, v)| (k.parse().unwrap_or(u32::MAX), InstanceState::parse(&v.state)))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        return Ok(indexed.into_iter().map(|(_, s)| s).collect());
    }
    let error: PlatformErrorBody = serde_json::from_str(body)?;
    if error.error_code == "CF-NotStaged" {
        return Ok(Vec::new());
    }
    Err(HarnessError::PlatformResponse(format!(
        "{}: {}",
        error.error_code, error.description
    )))
}

#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    routes: Vec<SummaryRoute>,
}

#[derive(Debug, Deserialize)]
struct SummaryRoute {
    host: String,
    #[serde(default)]
    path: String,
    domain: SummaryDomain,
}

#[derive(Debug, Deserialize)]
struct SummaryDomain {
    name: String,
}

/// Base URL of the first route in a `/v2/apps/<guid>/summary` body.
pub fn parse_route_url(body: &str) -> Result<String> {
    let summary: Summary = serde_json::from_str(body)?;
    let route = summary
        .routes
        .first()
        .ok_or_else(|| HarnessError::PlatformResponse("application has no routes".into()))?;
    let host = if route.host.is_empty() {
        route.domain.name.clone()
    } else {
        format!("{}.{}", route.host, route.domain.name)
    };
    Ok(format!("http://{}{}", host, route.path))
}

/// Push-time settings. Mutated only by the owning scenario before push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSettings {
    pub memory: Option<String>,
    pub disk: Option<String>,
    pub stack: Option<String>,
    pub buildpacks: Vec<String>,
    pub start_command: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// A fixture application on the platform.
pub struct App {
    name: String,
    path: PathBuf,
    working_copy: Option<WorkingCopy>,
    pub settings: AppSettings,
    output: LogBuffer,
    runner: Arc<dyn CommandRunner>,
    http: HttpProbe,
    log_stream: Mutex<Option<BackgroundProcess>>,
    guid: Mutex<Option<String>>,
    destroyed: AtomicBool,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("settings", &self.settings)
            .finish()
    }
}

impl App {
    /// Handle for `fixture`, named uniquely by `names`.
    pub fn new(
        fixture: &Fixture,
        names: &NameGenerator,
        runner: Arc<dyn CommandRunner>,
        http: HttpProbe,
    ) -> Self {
        Self {
            name: names.unique(fixture.name()),
            path: fixture.path().to_path_buf(),
            working_copy: None,
            settings: AppSettings::default(),
            output: LogBuffer::new(),
            runner,
            http,
            log_stream: Mutex::new(None),
            guid: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Handle for a working copy; the copy lives as long as the handle.
    pub fn from_working_copy(
        copy: WorkingCopy,
        names: &NameGenerator,
        runner: Arc<dyn CommandRunner>,
        http: HttpProbe,
    ) -> Self {
        let mut app = Self::new(&copy.as_fixture(), names, runner, http);
        app.working_copy = Some(copy);
        app
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Captured `cf logs` output for this app.
    pub fn output(&self) -> &LogBuffer {
        &self.output
    }

    pub fn working_copy(&self) -> Option<&WorkingCopy> {
        self.working_copy.as_ref()
    }

    pub fn working_copy_mut(&mut self) -> Option<&mut WorkingCopy> {
        self.working_copy.as_mut()
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.settings.env.insert(key.into(), value.into());
        self
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The runner every `cf` call for this app goes through.
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// Mark destroyed without touching the platform. True if it was live.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(HarnessError::Destroyed(self.name.clone()));
        }
        Ok(())
    }

    /// Arguments for `cf push`; the app is created stopped so env can be set first.
    pub fn push_args(&self) -> Vec<String> {
        let mut args = vec![
            "push".to_string(),
            self.name.clone(),
            "--no-start".to_string(),
            "-p".to_string(),
            self.path.display().to_string(),
        ];
        let manifest = self.path.join("manifest.yml");
        if manifest.is_file() {
            args.push("-f".into());
            args.push(manifest.display().to_string());
        }
        let s = &self.settings;
        if let Some(stack) = &s.stack {
            args.push("-s".into());
            args.push(stack.clone());
        }
        for bp in &s.buildpacks {
            args.push("-b".into());
            args.push(bp.clone());
        }
        if let Some(memory) = &s.memory {
            args.push("-m".into());
            args.push(memory.clone());
        }
        if let Some(disk) = &s.disk {
            args.push("-k".into());
            args.push(disk.clone());
        }
        if let Some(command) = &s.start_command {
            args.push("-c".into());
            args.push(command.clone());
        }
        args
    }

    async fn cf(&self, args: Vec<String>) -> Result<String> {
        let output = self.runner.run_checked(&Invocation::cf(args)).await?;
        Ok(output.stdout)
    }

    /// Create, configure, and start the app. Non-zero exit at any step is an error.
    pub async fn push(&self) -> Result<()> {
        self.ensure_live()?;
        if let Some(copy) = &self.working_copy {
            copy.check_resolved()?;
        }
        info!(app = %self.name, path = %self.path.display(), "pushing");
        self.cf(self.push_args()).await?;
        for (key, value) in &self.settings.env {
            self.cf(vec![
                "set-env".into(),
                self.name.clone(),
                key.clone(),
                value.clone(),
            ])
            .await?;
        }
        self.ensure_log_stream().await?;
        self.cf(vec!["start".into(), self.name.clone()]).await?;
        Ok(())
    }

    async fn ensure_log_stream(&self) -> Result<()> {
        let streaming = self
            .log_stream
            .lock()
            .as_mut()
            .is_some_and(|process| process.is_running());
        if streaming {
            return Ok(());
        }
        let process = self
            .runner
            .spawn_streaming(&Invocation::cf(["logs", self.name.as_str()]), self.output.clone())
            .await?;
        *self.log_stream.lock() = Some(process);
        Ok(())
    }

    pub async fn guid(&self) -> Result<String> {
        let cached = self.guid.lock().clone();
        if let Some(guid) = cached {
            return Ok(guid);
        }
        let stdout = self
            .cf(vec!["app".into(), self.name.clone(), "--guid".into()])
            .await?;
        let guid = stdout.trim().to_string();
        if guid.is_empty() {
            return Err(HarnessError::PlatformResponse(format!(
                "no guid for {}",
                self.name
            )));
        }
        *self.guid.lock() = Some(guid.clone());
        Ok(guid)
    }

    pub async fn instance_states(&self) -> Result<Vec<InstanceState>> {
        self.ensure_live()?;
        let guid = self.guid().await?;
        let body = self
            .cf(vec!["curl".into(), format!("/v2/apps/{}/instances", guid)])
            .await?;
        parse_instances(&body)
    }

    pub async fn restart(&self) -> Result<()> {
        self.ensure_live()?;
        self.cf(vec!["restart".into(), self.name.clone()]).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_live()?;
        self.cf(vec!["stop".into(), self.name.clone()]).await?;
        Ok(())
    }

    /// Restage in place, e.g. after binding a service.
    pub async fn restage(&self) -> Result<()> {
        self.ensure_live()?;
        self.ensure_log_stream().await?;
        self.cf(vec!["restage".into(), self.name.clone()]).await?;
        Ok(())
    }

    /// `cf run-task`; the task's output arrives on the log stream.
    pub async fn run_task(&self, command: &str) -> Result<()> {
        self.ensure_live()?;
        self.cf(vec!["run-task".into(), self.name.clone(), command.to_string()])
            .await?;
        Ok(())
    }

    /// Paths under `path` in the running container.
    pub async fn files(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_live()?;
        let output = self
            .runner
            .run_checked(&Invocation::cf([
                "ssh".to_string(),
                self.name.clone(),
                "-c".to_string(),
                format!("find {}", path),
            ]))
            .await?;
        Ok(output.lines())
    }

    /// Save the app's droplet to `dest`.
    pub async fn download_droplet(&self, dest: &Path) -> Result<()> {
        self.ensure_live()?;
        let guid = self.guid().await?;
        self.cf(vec![
            "curl".into(),
            format!("/v2/apps/{}/droplet/download", guid),
            "--output".into(),
            dest.display().to_string(),
        ])
        .await?;
        Ok(())
    }

    /// Base URL of the app's first route.
    pub async fn url(&self, path: &str) -> Result<String> {
        let guid = self.guid().await?;
        let body = self
            .cf(vec!["curl".into(), format!("/v2/apps/{}/summary", guid)])
            .await?;
        Ok(format!("{}{}", parse_route_url(&body)?, path))
    }

    pub async fn get(&self, path: &str, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        self.ensure_live()?;
        let url = self.url(path).await?;
        self.http.get(&url, headers).await
    }

    /// Body of `GET path`; 4xx/5xx is an error.
    pub async fn get_body(&self, path: &str) -> Result<String> {
        self.ensure_live()?;
        let url = self.url(path).await?;
        self.http.get_body(&url).await
    }

    /// `cf logs <app> --recent`, for failure diagnostics.
    pub async fn recent_logs(&self) -> Result<String> {
        let output = self
            .runner
            .run(&Invocation::cf(["logs", self.name.as_str(), "--recent"]))
            .await?;
        Ok(output.stdout)
    }

    /// Stop the log stream and delete the app with its routes. Idempotent.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!(app = %self.name, "already destroyed");
            return Ok(());
        }
        let stream = self.log_stream.lock().take();
        if let Some(mut process) = stream {
            process.stop().await;
        }
        info!(app = %self.name, "deleting");
        let result = self
            .runner
            .run_checked(&Invocation::cf(["delete", "-f", "-r", self.name.as_str()]))
            .await;
        if let Err(e) = &result {
            warn!(app = %self.name, error = %e, "delete failed");
        }
        result.map(|_| ())
    }
}

/// Destroy `app` if there is one.
pub async fn destroy_app(app: Option<&App>) -> Result<()> {
    match app {
        Some(app) => app.destroy().await,
        None => Ok(()),
    }
}
