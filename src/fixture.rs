//! Fixture applications and private working copies.
//!
//! Fixtures are shared, read-only template directories. A scenario that needs
//! to change one (templating a pinned version into `global.json`, editing an
//! `environment.yml` between pushes) copies it first and works on the copy,
//! which is deleted when dropped.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tempfile::TempDir;
use tracing::debug;

use crate::config::SuiteConfig;
use crate::error::{HarnessError, Result};

/// `<%= name %>`
pub fn template_token(var: &str) -> String {
    format!("<%= {} %>", var)
}

fn any_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"<%=\s*([A-Za-z0-9_]+)\s*%>").expect("token pattern is valid")
    })
}

/// First template token left in `content`, if any.
pub fn find_unresolved(content: &str) -> Option<String> {
    any_token()
        .find(content)
        .map(|m| m.as_str().to_string())
}

/// Directory containing the fixture applications.
#[derive(Debug, Clone)]
pub struct FixtureRoot {
    root: PathBuf,
}

impl FixtureRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &SuiteConfig) -> Result<Self> {
        config
            .fixtures_dir
            .clone()
            .map(Self::new)
            .ok_or_else(|| HarnessError::config("no fixtures directory configured"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fixture at `root/names[0]/names[1]/...`.
    pub fn get(&self, names: &[&str]) -> Result<Fixture> {
        let path = names.iter().fold(self.root.clone(), |p, n| p.join(n));
        Fixture::open(path)
    }
}

/// A read-only fixture directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    path: PathBuf,
}

impl Fixture {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(HarnessError::FixtureNotFound(path));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component; used as the application name prefix.
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("app")
    }

    /// Copy into a fresh temporary directory.
    pub fn copy(&self) -> Result<WorkingCopy> {
        WorkingCopy::of(self)
    }
}

/// A private, mutable copy of a fixture. Removed on drop.
#[derive(Debug)]
pub struct WorkingCopy {
    _dir: TempDir,
    path: PathBuf,
    templated: Vec<PathBuf>,
}

impl WorkingCopy {
    pub fn of(fixture: &Fixture) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("stagehand-fixture-").tempdir()?;
        // Keep the fixture's own name so generated app names stay recognisable.
        let path = dir.path().join(fixture.name());
        copy_dir(fixture.path(), &path)?;
        debug!(from = %fixture.path().display(), to = %path.display(), "copied fixture");
        Ok(Self {
            _dir: dir,
            path,
            templated: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_fixture(&self) -> Fixture {
        Fixture {
            path: self.path.clone(),
        }
    }

    /// Replace every `<%= var %>` in `file` with `value`, verbatim.
    ///
    /// Naming a token the file does not contain is an error.
    pub fn replace_template(&mut self, file: &str, var: &str, value: &str) -> Result<&mut Self> {
        let target = self.path.join(file);
        let content = std::fs::read_to_string(&target)?;
        let token = template_token(var);
        if !content.contains(&token) {
            return Err(HarnessError::TemplateTokenMissing {
                token,
                path: target,
            });
        }
        std::fs::write(&target, content.replace(&token, value))?;
        if !self.templated.contains(&target) {
            self.templated.push(target);
        }
        Ok(self)
    }

    /// Plain substring edit, for scenarios that change a copy between pushes.
    pub fn replace_text(&self, file: &str, from: &str, to: &str) -> Result<()> {
        let target = self.path.join(file);
        let content = std::fs::read_to_string(&target)?;
        std::fs::write(&target, content.replacen(from, to, 1))?;
        Ok(())
    }

    /// Fail if any templated file still carries a token.
    pub fn check_resolved(&self) -> Result<()> {
        for path in &self.templated {
            let content = std::fs::read_to_string(path)?;
            if let Some(token) = find_unresolved(&content) {
                return Err(HarnessError::UnresolvedTemplate {
                    token,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Recursive copy; symlinks are recreated, not followed.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to)?;
    Ok(())
}
