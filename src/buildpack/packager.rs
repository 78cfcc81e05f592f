//! Producing a uniquely versioned buildpack archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::PackagedBuildpack;
use crate::config::SuiteConfig;
use crate::error::{HarnessError, Result};
use crate::process::{CommandRunner, Invocation};

/// Builds an installable archive from a buildpack source tree.
#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(&self, source_dir: &Path, stack: &str, cached: bool)
        -> Result<PackagedBuildpack>;
}

/// `<base>.<YYYYmmddHHMMSS>` so repeated runs never collide on the platform.
pub fn stamp_version(base: &str) -> String {
    format!("{}.{}", base.trim(), Utc::now().format("%Y%m%d%H%M%S"))
}

/// Restores the original `VERSION` file when packaging ends, however it ends.
struct VersionRestore {
    path: PathBuf,
    original: Option<String>,
}

impl Drop for VersionRestore {
    fn drop(&mut self) {
        let result = match &self.original {
            Some(content) => std::fs::write(&self.path, content),
            None => std::fs::remove_file(&self.path),
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to restore VERSION");
        }
    }
}

/// Packages with the `buildpack-packager` CLI.
pub struct CliPackager {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl CliPackager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            program: "buildpack-packager".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

fn find_archive(dir: &Path, version: &str) -> Result<PathBuf> {
    let suffix = format!("v{}.zip", version);
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&suffix));
        if matches {
            found.push(path);
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(HarnessError::setup(format!(
            "packager produced no archive ending in {} in {}",
            suffix,
            dir.display()
        ))),
        _ => Err(HarnessError::setup(format!(
            "packager produced several archives ending in {}: {:?}",
            suffix, found
        ))),
    }
}

#[async_trait]
impl Packager for CliPackager {
    async fn package(
        &self,
        source_dir: &Path,
        stack: &str,
        cached: bool,
    ) -> Result<PackagedBuildpack> {
        let version_path = source_dir.join("VERSION");
        let original = match std::fs::read_to_string(&version_path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let base = original.as_deref().unwrap_or("0.0.0").trim().to_string();
        let version = stamp_version(&base);

        let _restore = VersionRestore {
            path: version_path.clone(),
            original,
        };
        std::fs::write(&version_path, &version)?;

        info!(dir = %source_dir.display(), %version, stack, cached, "packaging buildpack");
        let invocation = Invocation::new(&self.program)
            .arg("build")
            .arg(format!("--cached={}", cached))
            .arg(format!("--stack={}", stack))
            .current_dir(source_dir);
        self.runner
            .run_checked(&invocation)
            .await
            .map_err(|e| HarnessError::setup(format!("packaging failed: {}", e)))?;

        let file = find_archive(source_dir, &version)?;
        PackagedBuildpack::packaged(file, version)
    }
}

/// Adopt the configured pre-built archive, or package the source tree.
pub async fn resolve(config: &SuiteConfig, packager: &dyn Packager) -> Result<PackagedBuildpack> {
    if let Some(prebuilt) = &config.prebuilt {
        if prebuilt.version.is_empty() {
            return Err(HarnessError::config(
                "a pre-built buildpack archive needs its version",
            ));
        }
        info!(file = %prebuilt.file.display(), version = %prebuilt.version, "using pre-built buildpack");
        return PackagedBuildpack::adopt(&prebuilt.file, &prebuilt.version);
    }
    let dir = config.buildpack_dir.as_deref().ok_or_else(|| {
        HarnessError::config("setting $BUILDPACK_DIR is required")
    })?;
    packager.package(dir, &config.stack, config.cached).await
}
