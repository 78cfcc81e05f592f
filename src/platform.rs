//! Platform-wide operations that are not tied to a single application.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use serde::Deserialize;
use tracing::{debug, info};

use crate::buildpack::manifest::parse_loose_version;
use crate::error::{HarnessError, Result};
use crate::fixture::copy_dir;
use crate::process::{CommandRunner, Invocation};

/// Platform features gated on the cloud controller API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCapability {
    Tasks,
    MultiBuildpack,
    Symlinks,
    StackAssociation,
}

impl ApiCapability {
    /// First API version with the capability.
    pub fn min_version(self) -> &'static str {
        match self {
            Self::Tasks => "2.75.0",
            Self::MultiBuildpack => "2.90.0",
            Self::Symlinks => "2.103.0",
            Self::StackAssociation => "2.113.0",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Info {
    api_version: String,
}

/// `cf` operations on platform-scoped resources.
#[derive(Clone)]
pub struct Platform {
    runner: Arc<dyn CommandRunner>,
}

impl Platform {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// Register `file` as `name`, replacing the bits if it already exists.
    pub async fn create_or_update_buildpack(
        &self,
        name: &str,
        file: &Path,
        stack: Option<&str>,
    ) -> Result<()> {
        let file_arg = file.display().to_string();
        let create = Invocation::cf(["create-buildpack", name, file_arg.as_str(), "100", "--enable"]);
        let output = self.runner.run(&create).await?;
        if output.success() {
            info!(buildpack = name, "created buildpack");
        } else {
            let text = format!("{}{}", output.stdout, output.stderr);
            let duplicate = ["already exists", "already taken", "already in use"]
                .iter()
                .any(|m| text.contains(m));
            if !duplicate {
                output.check(&create)?;
            }
            debug!(buildpack = name, "buildpack exists, updating");
        }

        let mut update = Invocation::cf(["update-buildpack", name, "-p", file_arg.as_str(), "--enable"]);
        if let Some(stack) = stack.filter(|s| !s.is_empty()) {
            update = update.args(["-s", stack]);
        }
        self.runner.run_checked(&update).await?;
        info!(buildpack = name, file = %file.display(), "installed buildpack");
        Ok(())
    }

    pub async fn delete_buildpack(&self, name: &str) -> Result<()> {
        self.runner
            .run_checked(&Invocation::cf(["delete-buildpack", "-f", name]))
            .await?;
        info!(buildpack = name, "deleted buildpack");
        Ok(())
    }

    pub async fn delete_orphaned_routes(&self) -> Result<()> {
        self.runner
            .run_checked(&Invocation::cf(["delete-orphaned-routes", "-f"]))
            .await?;
        Ok(())
    }

    /// Cloud controller API version.
    pub async fn api_version(&self) -> Result<Version> {
        let output = self
            .runner
            .run_checked(&Invocation::cf(["curl", "/v2/info"]))
            .await?;
        let info: Info = serde_json::from_str(&output.stdout)?;
        parse_loose_version(&info.api_version).ok_or_else(|| {
            HarnessError::PlatformResponse(format!("unparseable api version {}", info.api_version))
        })
    }

    /// Whether the API is at least `version`.
    pub async fn api_at_least(&self, version: &str) -> Result<bool> {
        let required = parse_loose_version(version)
            .ok_or_else(|| HarnessError::config(format!("bad api version {}", version)))?;
        Ok(self.api_version().await? >= required)
    }

    pub async fn supports(&self, capability: ApiCapability) -> Result<bool> {
        self.api_at_least(capability.min_version()).await
    }

    /// `cf create-user-provided-service <name> -p <credentials>`.
    pub async fn create_user_provided_service(
        &self,
        name: &str,
        credentials: &serde_json::Value,
    ) -> Result<()> {
        let creds = credentials.to_string();
        self.runner
            .run_checked(&Invocation::cf(["cups", name, "-p", creds.as_str()]))
            .await?;
        info!(service = name, "created user-provided service");
        Ok(())
    }

    pub async fn bind_service(&self, app: &str, service: &str) -> Result<()> {
        self.runner
            .run_checked(&Invocation::cf(["bind-service", app, service]))
            .await?;
        Ok(())
    }

    pub async fn delete_service(&self, name: &str) -> Result<()> {
        self.runner
            .run_checked(&Invocation::cf(["delete-service", "-f", name]))
            .await?;
        Ok(())
    }
}

/// Directory holding the operator's `cf` login, from `CF_HOME` or `HOME`.
pub fn cf_home_source() -> Option<PathBuf> {
    std::env::var_os("CF_HOME")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

/// Copy `<source>/.cf` into `dest/.cf` so a worker's CLI state is private.
///
/// Returns the directory to export as `CF_HOME`.
pub fn copy_cf_home(source: &Path, dest: &Path) -> Result<PathBuf> {
    let from = source.join(".cf");
    if !from.is_dir() {
        return Err(HarnessError::setup(format!(
            "no cf configuration at {} (run `cf login` first)",
            from.display()
        )));
    }
    copy_dir(&from, &dest.join(".cf"))?;
    Ok(dest.to_path_buf())
}
