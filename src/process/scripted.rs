//! Replay runner used to exercise the harness without a platform.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackgroundProcess, CommandOutput, CommandRunner, Invocation};
use crate::error::Result;
use crate::output::LogBuffer;

/// Canned result for one invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub output: CommandOutput,
    /// Lines written to the sink when the invocation is streamed.
    pub stream_lines: Vec<String>,
}

impl ScriptedResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                status: Some(0),
                stdout: stdout.into(),
                stderr: String::new(),
            },
            stream_lines: Vec::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                status: Some(code),
                stdout: String::new(),
                stderr: stderr.into(),
            },
            stream_lines: Vec::new(),
        }
    }

    pub fn streaming<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            output: CommandOutput {
                status: Some(0),
                ..Default::default()
            },
            stream_lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

struct Rule {
    program: String,
    prefix: Vec<String>,
    responses: VecDeque<ScriptedResponse>,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        invocation.program == self.program && invocation.args.starts_with(&self.prefix)
    }

    /// Pop the next response; the last one repeats forever.
    fn next(&mut self) -> ScriptedResponse {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap_or_default()
        } else {
            self.responses.front().cloned().unwrap_or_default()
        }
    }
}

/// Runner that answers from a script and records every call.
///
/// Rules are matched by program name and argument prefix in registration
/// order. Unmatched invocations succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `response` for invocations of `program` whose args start with `prefix`.
    pub fn on(&self, program: &str, prefix: &[&str], response: ScriptedResponse) -> &Self {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        let mut rules = self.rules.lock();
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.program == program && r.prefix == prefix)
        {
            rule.responses.push_back(response);
        } else {
            rules.push(Rule {
                program: program.to_string(),
                prefix,
                responses: VecDeque::from([response]),
            });
        }
        self
    }

    /// Every invocation seen so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Invocations of `program` whose args start with `prefix`.
    pub fn calls_matching(&self, program: &str, prefix: &[&str]) -> Vec<Invocation> {
        self.calls
            .lock()
            .iter()
            .filter(|c| {
                c.program == program
                    && c.args.len() >= prefix.len()
                    && c.args.iter().zip(prefix).all(|(a, p)| a == p)
            })
            .cloned()
            .collect()
    }

    fn respond(&self, invocation: &Invocation) -> ScriptedResponse {
        self.calls.lock().push(invocation.clone());
        let mut rules = self.rules.lock();
        match rules.iter_mut().find(|r| r.matches(invocation)) {
            Some(rule) => rule.next(),
            None => ScriptedResponse::ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        Ok(self.respond(invocation).output)
    }

    fn run_blocking(&self, invocation: &Invocation) -> Result<CommandOutput> {
        Ok(self.respond(invocation).output)
    }

    async fn spawn_streaming(
        &self,
        invocation: &Invocation,
        sink: LogBuffer,
    ) -> Result<BackgroundProcess> {
        for line in self.respond(invocation).stream_lines {
            sink.push_line(&line);
        }
        Ok(BackgroundProcess::detached(invocation.to_string()))
    }
}
