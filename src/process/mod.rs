//! External command execution.
//!
//! Every platform interaction goes through a [`CommandRunner`]. The real
//! implementation is [`CliRunner`]; [`ScriptedRunner`] replays canned results
//! so the harness itself can be exercised without a platform.

mod cli;
mod scripted;

pub use cli::CliRunner;
pub use scripted::{ScriptedResponse, ScriptedRunner};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::output::LogBuffer;

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            timeout: None,
        }
    }

    /// Shorthand for a `cf` invocation.
    pub fn cf<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("cf").args(args)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into [`HarnessError::CommandFailed`].
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(HarnessError::CommandFailed {
            command: invocation.to_string(),
            exit_code: self.status,
            stderr,
        })
    }

    /// Stdout lines, trimmed, without blanks.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}

/// A long-running command whose output is being copied into a [`LogBuffer`].
///
/// The child is killed when the handle is stopped or dropped.
pub struct BackgroundProcess {
    description: String,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
}

impl BackgroundProcess {
    pub(crate) fn new(description: String, child: Child, pumps: Vec<JoinHandle<()>>) -> Self {
        Self {
            description,
            child: Some(child),
            pumps,
        }
    }

    /// A handle with nothing behind it; used by runners that do not spawn.
    pub fn detached(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            child: None,
            pumps: Vec::new(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the child and wait for the output pumps to drain.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(process = %self.description, error = %e, "kill failed (already exited?)");
            }
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is NOT an error here.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Spawn a long-running command, copying each output line into `sink`.
    async fn spawn_streaming(
        &self,
        invocation: &Invocation,
        sink: LogBuffer,
    ) -> Result<BackgroundProcess>;

    /// Run to completion on the calling thread, for `Drop` paths that cannot
    /// await. Timeouts are not enforced.
    fn run_blocking(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run to completion, treating a non-zero exit as an error.
    async fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.run(invocation).await?.check(invocation)
    }
}
