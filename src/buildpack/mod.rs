//! Packaged buildpack artifacts.
//!
//! A suite run works against exactly one archive: either one handed in from
//! outside, or one packaged from the buildpack source tree at setup. The
//! archive's identity is serialized into the worker hand-off, so it is a plain
//! serde type.

pub mod manifest;
mod packager;

pub use manifest::{find_matching_version, BuildpackManifest, ManifestDependency};
pub use packager::{resolve, stamp_version, CliPackager, Packager};

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{HarnessError, Result};

/// Where the archive came from. Only packaged archives are ours to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    Prebuilt,
    Packaged,
}

/// A buildpack archive ready to install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedBuildpack {
    pub file: PathBuf,
    pub version: String,
    /// Hex SHA-256 of the archive at hand-off time.
    pub sha256: String,
    pub origin: ArtifactOrigin,
}

impl PackagedBuildpack {
    /// Record an existing archive without touching it.
    pub fn adopt(file: impl Into<PathBuf>, version: impl Into<String>) -> Result<Self> {
        let file = file.into();
        if !file.is_file() {
            return Err(HarnessError::setup(format!(
                "buildpack archive {} does not exist",
                file.display()
            )));
        }
        let sha256 = digest_file(&file)?;
        Ok(Self {
            file,
            version: version.into(),
            sha256,
            origin: ArtifactOrigin::Prebuilt,
        })
    }

    pub(crate) fn packaged(file: PathBuf, version: String) -> Result<Self> {
        let sha256 = digest_file(&file)?;
        Ok(Self {
            file,
            version,
            sha256,
            origin: ArtifactOrigin::Packaged,
        })
    }

    /// Fail if the archive changed since it was recorded.
    pub fn verify(&self) -> Result<()> {
        let actual = digest_file(&self.file)?;
        if actual != self.sha256 {
            return Err(HarnessError::setup(format!(
                "buildpack archive {} changed after hand-off (expected {}, found {})",
                self.file.display(),
                self.sha256,
                actual
            )));
        }
        Ok(())
    }

    /// Read the archive's `manifest.yml`.
    pub fn manifest(&self) -> Result<BuildpackManifest> {
        BuildpackManifest::from_archive(&self.file)
    }

    /// Delete the archive if this suite produced it. Missing files are fine.
    pub fn remove(&self) -> Result<()> {
        if self.origin == ArtifactOrigin::Prebuilt {
            info!(file = %self.file.display(), "leaving pre-built buildpack in place");
            return Ok(());
        }
        match std::fs::remove_file(&self.file) {
            Ok(()) => {
                info!(file = %self.file.display(), "removed packaged buildpack");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %self.file.display(), "packaged buildpack already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Hex SHA-256 of a file, streamed.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
