//! Suite configuration loading from environment variables.
//!
//! All values are resolved once at suite start and treated as immutable for the
//! run. Invalid values fall back to defaults without crashing. An optional TOML
//! file named by `STAGEHAND_CONFIG` is applied first; environment variables
//! override it.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `CF_STACK` | cflinuxfs3 | Target platform stack |
//! | `BUILDPACK_DIR` | (none) | Buildpack source directory |
//! | `STAGEHAND_BUILDPACK_NAME` | from `BUILDPACK_DIR` | Language name (`nodejs`, `dotnet_core`) |
//! | `STAGEHAND_BUILDPACK_FILE` | (none) | Pre-built archive; skips packaging |
//! | `STAGEHAND_BUILDPACK_VERSION` | (none) | Version paired with the archive |
//! | `STAGEHAND_CACHED` | true | Cached vs uncached dependency mode |
//! | `STAGEHAND_MEMORY` | 256M | Default memory for pushed apps |
//! | `STAGEHAND_DISK` | 512M | Default disk for pushed apps |
//! | `STAGEHAND_FIXTURES_DIR` | `$BUILDPACK_DIR/fixtures` | Fixture root |
//! | `STAGEHAND_HANDOFF_DIR` | `$TMPDIR/stagehand-<run>` | Worker coordination dir |
//! | `STAGEHAND_RUN_ID` | `<name>-<stack>-<mode>-<source hash>` | Shared by setup, workers and teardown |
//! | `STAGEHAND_PUSH_TIMEOUT` | 60 | Running-state poll bound (secs) |
//! | `STAGEHAND_POLL_INTERVAL_MS` | 1000 | Poll interval (ms) |
//! | `STAGEHAND_SETUP_TIMEOUT` | 1800 | Wait for elected setup (secs) |
//! | `STAGEHAND_BROWSER` | false | Start headless chromedriver per worker |
//! | `STAGEHAND_STAGER_IMAGE` | `cloudfoundry/<stack>` | Local staging image |
//! | `STAGEHAND_PROXY_HOST` | 172.17.0.1 | Proxy address as seen from the staging container |
//! | `COMPOSER_GITHUB_OAUTH_TOKEN` | `GIT_TOKEN` | Registry token forwarded to apps |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A buildpack archive supplied from outside (e.g. CI already packaged it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrebuiltBuildpack {
    pub file: PathBuf,
    pub version: String,
}

/// All suite configuration.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub stack: String,
    pub buildpack_dir: Option<PathBuf>,
    /// Language name; the platform buildpack is registered as `<name>_buildpack`.
    pub buildpack_name: String,
    pub prebuilt: Option<PrebuiltBuildpack>,
    pub cached: bool,
    pub default_memory: String,
    pub default_disk: String,
    pub fixtures_dir: Option<PathBuf>,
    pub handoff_dir: PathBuf,
    pub run_id: String,
    pub push_timeout: Duration,
    pub poll_interval: Duration,
    pub setup_timeout: Duration,
    pub browser: bool,
    pub stager_image: String,
    /// Host the staging container uses to reach the recording proxy.
    pub proxy_host: String,
    pub composer_token: Option<String>,
}

/// Errors reading a TOML config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// On-disk overlay. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub stack: Option<String>,
    pub buildpack_dir: Option<PathBuf>,
    pub buildpack_name: Option<String>,
    pub buildpack_file: Option<PathBuf>,
    pub buildpack_version: Option<String>,
    pub cached: Option<bool>,
    pub memory: Option<String>,
    pub disk: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub push_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub setup_timeout_secs: Option<u64>,
    pub browser: Option<bool>,
    pub stager_image: Option<String>,
    pub proxy_host: Option<String>,
}

impl FileConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`true/false/1/0/yes/no`), returning `default` otherwise.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Derive the language name from a buildpack directory:
/// `dotnet-core-buildpack` becomes `dotnet_core`.
pub fn language_from_dir(dir: &Path) -> Option<String> {
    let base = dir.file_name()?.to_str()?;
    let base = base.strip_suffix("-buildpack").unwrap_or(base);
    let base = base.strip_suffix("_buildpack").unwrap_or(base);
    if base.is_empty() {
        return None;
    }
    Some(base.replace('-', "_"))
}

/// Run id shared by every process working on the same buildpack source, stack
/// and cache mode, so a later `stagehand teardown` finds the test binaries'
/// hand-off directory.
pub fn default_run_id(
    buildpack_name: &str,
    stack: &str,
    cached: bool,
    source: Option<&Path>,
) -> String {
    let mode = if cached { "cached" } else { "uncached" };
    let source = source
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf()))
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let digest = hex::encode(Sha256::digest(source.as_bytes()));
    format!("{}-{}-{}-{}", buildpack_name, stack, mode, &digest[..8])
}

/// Load configuration: TOML overlay (if `STAGEHAND_CONFIG` is set) then env.
pub fn load() -> Result<SuiteConfig, ConfigError> {
    let file = match non_empty_var("STAGEHAND_CONFIG") {
        Some(path) => FileConfig::from_toml_file(Path::new(&path))?,
        None => FileConfig::default(),
    };
    Ok(load_with(file))
}

/// Resolve configuration from a file overlay plus the process environment.
pub fn load_with(file: FileConfig) -> SuiteConfig {
    let stack = non_empty_var("CF_STACK")
        .or(file.stack)
        .unwrap_or_else(|| "cflinuxfs3".to_string());

    let buildpack_dir = non_empty_var("BUILDPACK_DIR")
        .map(PathBuf::from)
        .or(file.buildpack_dir);

    let buildpack_name = non_empty_var("STAGEHAND_BUILDPACK_NAME")
        .or(file.buildpack_name)
        .or_else(|| buildpack_dir.as_deref().and_then(language_from_dir))
        .unwrap_or_else(|| "test".to_string());

    let prebuilt_file = non_empty_var("STAGEHAND_BUILDPACK_FILE")
        .map(PathBuf::from)
        .or(file.buildpack_file);
    let prebuilt_version = non_empty_var("STAGEHAND_BUILDPACK_VERSION").or(file.buildpack_version);
    let prebuilt = match (prebuilt_file, prebuilt_version) {
        (Some(file), Some(version)) => Some(PrebuiltBuildpack { file, version }),
        (Some(file), None) => Some(PrebuiltBuildpack {
            file,
            version: String::new(),
        }),
        _ => None,
    };

    let cached = parse_bool("STAGEHAND_CACHED", file.cached.unwrap_or(true));
    let default_memory = non_empty_var("STAGEHAND_MEMORY")
        .or(file.memory)
        .unwrap_or_else(|| "256M".to_string());
    let default_disk = non_empty_var("STAGEHAND_DISK")
        .or(file.disk)
        .unwrap_or_else(|| "512M".to_string());

    let fixtures_dir = non_empty_var("STAGEHAND_FIXTURES_DIR")
        .map(PathBuf::from)
        .or(file.fixtures_dir)
        .or_else(|| buildpack_dir.as_ref().map(|d| d.join("fixtures")));

    let run_id = non_empty_var("STAGEHAND_RUN_ID").unwrap_or_else(|| {
        let source = buildpack_dir
            .as_deref()
            .or(prebuilt.as_ref().map(|p| p.file.as_path()));
        default_run_id(&buildpack_name, &stack, cached, source)
    });
    let handoff_dir = non_empty_var("STAGEHAND_HANDOFF_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(format!("stagehand-{}", run_id)));

    let push_secs = parse_u64("STAGEHAND_PUSH_TIMEOUT", file.push_timeout_secs.unwrap_or(60)).max(1);
    let poll_ms = parse_u64("STAGEHAND_POLL_INTERVAL_MS", file.poll_interval_ms.unwrap_or(1000)).max(10);
    let setup_secs =
        parse_u64("STAGEHAND_SETUP_TIMEOUT", file.setup_timeout_secs.unwrap_or(1800)).max(1);

    let browser = parse_bool("STAGEHAND_BROWSER", file.browser.unwrap_or(false));
    let stager_image = non_empty_var("STAGEHAND_STAGER_IMAGE")
        .or(file.stager_image)
        .unwrap_or_else(|| format!("cloudfoundry/{}", stack));

    let proxy_host = non_empty_var("STAGEHAND_PROXY_HOST")
        .or(file.proxy_host)
        .unwrap_or_else(|| "172.17.0.1".to_string());

    let composer_token =
        non_empty_var("COMPOSER_GITHUB_OAUTH_TOKEN").or_else(|| non_empty_var("GIT_TOKEN"));

    SuiteConfig {
        stack,
        buildpack_dir,
        buildpack_name,
        prebuilt,
        cached,
        default_memory,
        default_disk,
        fixtures_dir,
        handoff_dir,
        run_id,
        push_timeout: Duration::from_secs(push_secs),
        poll_interval: Duration::from_millis(poll_ms),
        setup_timeout: Duration::from_secs(setup_secs),
        browser,
        stager_image,
        proxy_host,
        composer_token,
    }
}

impl SuiteConfig {
    /// Name under which the buildpack is registered on the platform.
    pub fn platform_buildpack_name(&self) -> String {
        format!("{}_buildpack", self.buildpack_name)
    }

    /// Problems that make the suite unrunnable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match &self.prebuilt {
            Some(prebuilt) if prebuilt.version.is_empty() => problems.push(
                "STAGEHAND_BUILDPACK_FILE is set without STAGEHAND_BUILDPACK_VERSION".to_string(),
            ),
            Some(_) => {}
            None if self.buildpack_dir.is_none() => problems
                .push("setting $BUILDPACK_DIR is required when no pre-built archive is given".to_string()),
            None => {}
        }
        if self.fixtures_dir.is_none() {
            problems.push("no fixtures directory (set STAGEHAND_FIXTURES_DIR)".to_string());
        }
        problems
    }

    /// Key/value view used by `stagehand config show`.
    pub fn effective(&self) -> Vec<(&'static str, String)> {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        vec![
            ("CF_STACK", self.stack.clone()),
            ("BUILDPACK_DIR", path(&self.buildpack_dir)),
            ("STAGEHAND_BUILDPACK_NAME", self.buildpack_name.clone()),
            (
                "STAGEHAND_BUILDPACK_FILE",
                path(&self.prebuilt.as_ref().map(|p| p.file.clone())),
            ),
            (
                "STAGEHAND_BUILDPACK_VERSION",
                self.prebuilt
                    .as_ref()
                    .map(|p| p.version.clone())
                    .unwrap_or_default(),
            ),
            ("STAGEHAND_CACHED", self.cached.to_string()),
            ("STAGEHAND_MEMORY", self.default_memory.clone()),
            ("STAGEHAND_DISK", self.default_disk.clone()),
            ("STAGEHAND_FIXTURES_DIR", path(&self.fixtures_dir)),
            ("STAGEHAND_HANDOFF_DIR", self.handoff_dir.display().to_string()),
            ("STAGEHAND_RUN_ID", self.run_id.clone()),
            ("STAGEHAND_PUSH_TIMEOUT", self.push_timeout.as_secs().to_string()),
            (
                "STAGEHAND_POLL_INTERVAL_MS",
                self.poll_interval.as_millis().to_string(),
            ),
            ("STAGEHAND_SETUP_TIMEOUT", self.setup_timeout.as_secs().to_string()),
            ("STAGEHAND_BROWSER", self.browser.to_string()),
            ("STAGEHAND_STAGER_IMAGE", self.stager_image.clone()),
            ("STAGEHAND_PROXY_HOST", self.proxy_host.clone()),
        ]
    }
}
