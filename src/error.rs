//! Error types for the Stagehand harness.
//!
//! Platform interaction errors surface immediately. Only the explicit polls
//! in [`crate::poll`] retry, and only while the observed state is non-terminal.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors raised while driving buildpacks through the platform.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Suite setup failed: {0}")]
    Setup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Timeout after {elapsed:?} waiting for {description} (last observed: {last_observed})")]
    Timeout {
        description: String,
        elapsed: Duration,
        last_observed: String,
    },

    #[error("Wrong buildpack version: expected {expected}, found {found:?}")]
    BuildpackMismatch { expected: String, found: Vec<String> },

    #[error("Expected push of {app} to fail, but it succeeded")]
    UnexpectedSuccess { app: String },

    #[error("Expected diagnostic not found in output of {app}: {missing}")]
    MissingDiagnostic { app: String, missing: String },

    #[error("Template token `{token}` not found in {path}")]
    TemplateTokenMissing { token: String, path: PathBuf },

    #[error("Unresolved template token `{token}` in {path}")]
    UnresolvedTemplate { token: String, path: PathBuf },

    #[error("Fixture not found: {0}")]
    FixtureNotFound(PathBuf),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("No version of {dependency} satisfies {constraint}")]
    NoMatchingVersion { dependency: String, constraint: String },

    #[error("Staging did not complete: {0}")]
    StagingIncomplete(String),

    #[error("Unexpected network traffic: {0}")]
    TrafficViolation(String),

    #[error("Sensitive value found in droplet entry {entry}")]
    SecretLeaked { entry: String },

    #[error("Application {0} has already been destroyed")]
    Destroyed(String),

    #[error("Unexpected platform response: {0}")]
    PlatformResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl HarnessError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if this error must abort the whole suite.
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Config(_))
    }

    /// Returns true for bounded-poll expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
