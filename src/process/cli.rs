//! Tokio-backed runner for real executables.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{BackgroundProcess, CommandOutput, CommandRunner, Invocation};
use crate::error::{HarnessError, Result};
use crate::output::LogBuffer;

/// Runs commands as child processes.
///
/// `base_env` is applied to every invocation; workers use it to point `cf`
/// at their private `CF_HOME`.
#[derive(Debug, Clone, Default)]
pub struct CliRunner {
    base_env: Vec<(String, String)>,
}

impl CliRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.push((key.into(), value.into()));
        self
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (k, v) in self.base_env.iter().chain(invocation.env.iter()) {
            cmd.env(k, v);
        }
        if let Some(dir) = &invocation.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn blocking_command(&self, invocation: &Invocation) -> std::process::Command {
        let mut cmd = std::process::Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (k, v) in self.base_env.iter().chain(invocation.env.iter()) {
            cmd.env(k, v);
        }
        if let Some(dir) = &invocation.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

fn captured(status: Option<i32>, stdout: &[u8], stderr: &[u8]) -> CommandOutput {
    CommandOutput {
        status,
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
    }
}

fn spawn_pump<R>(reader: R, sink: LogBuffer, label: String) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "stagehand::stream", source = %label, "{}", line);
            sink.push_line(&line);
        }
    })
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation, "running");
        let child = self
            .command(invocation)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let wait = child.wait_with_output();
        let output = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result?,
                Err(_) => {
                    // kill_on_drop reaps the child once the future is gone
                    return Err(HarnessError::Timeout {
                        description: invocation.to_string(),
                        elapsed: limit,
                        last_observed: "process still running".to_string(),
                    });
                }
            },
            None => wait.await?,
        };

        let result = captured(output.status.code(), &output.stdout, &output.stderr);
        for line in result.stdout.lines().chain(result.stderr.lines()) {
            debug!(target: "stagehand::output", command = %invocation.program, "{}", line);
        }
        debug!(command = %invocation, status = ?result.status, "finished");
        Ok(result)
    }

    fn run_blocking(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation, "running (blocking)");
        let output = self
            .blocking_command(invocation)
            .output()
            .map_err(|source| HarnessError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        Ok(captured(output.status.code(), &output.stdout, &output.stderr))
    }

    async fn spawn_streaming(
        &self,
        invocation: &Invocation,
        sink: LogBuffer,
    ) -> Result<BackgroundProcess> {
        debug!(command = %invocation, "streaming");
        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, sink.clone(), invocation.to_string()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, sink, invocation.to_string()));
        }
        Ok(BackgroundProcess::new(invocation.to_string(), child, pumps))
    }
}
