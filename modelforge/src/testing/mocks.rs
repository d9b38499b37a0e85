//! Scripted process runner for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::process::{Invocation, ProcessOutput, ProcessRunner};

/// What a scripted program does when invoked.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    files: Vec<(String, Vec<u8>)>,
    delay: Option<Duration>,
}

impl ScriptedResponse {
    /// Exits with code zero and prints nothing.
    #[must_use]
    pub fn ok() -> Self {
        Self::exit(0)
    }

    /// Exits with `code`.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Terminated by a signal.
    #[must_use]
    pub fn killed() -> Self {
        Self::default()
    }

    /// Sets stdout.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Sets stderr.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Writes a file into the working directory, as the real program would.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.into(), content.into()));
        self
    }

    /// Takes this long; longer than the budget yields `Timeout`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A [`ProcessRunner`] that answers from a script instead of spawning.
///
/// Programs are matched by exact name or by file name, so `./test_model`
/// matches a rule for `test_model`. Unscripted programs fail to spawn.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, ScriptedResponse)>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    /// Creates a runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `program`. Later rules for the same program win.
    #[must_use]
    pub fn on(self, program: impl Into<String>, response: ScriptedResponse) -> Self {
        self.rules.lock().push((program.into(), response));
        self
    }

    /// Every invocation so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Invocations of one program.
    #[must_use]
    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls
            .lock()
            .iter()
            .filter(|i| matches_program(program, &i.program))
            .cloned()
            .collect()
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn response_for(&self, invocation: &Invocation) -> Option<ScriptedResponse> {
        self.rules
            .lock()
            .iter()
            .rev()
            .find(|(program, _)| matches_program(program, &invocation.program))
            .map(|(_, response)| response.clone())
    }
}

fn matches_program(rule: &str, program: &str) -> bool {
    rule == program || Path::new(program).file_name().is_some_and(|n| n == rule)
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput, PipelineError> {
        self.calls.lock().push(invocation.clone());

        let Some(response) = self.response_for(invocation) else {
            return Err(PipelineError::Spawn {
                command: invocation.command_line(),
                reason: "program not scripted".to_string(),
            });
        };

        if let Some(delay) = response.delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(PipelineError::Timeout {
                    command: invocation.command_line(),
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
            tokio::time::sleep(delay).await;
        }

        for (name, content) in &response.files {
            let path = invocation.cwd.join(name);
            std::fs::write(&path, content).map_err(|e| PipelineError::write_error(&path, &e))?;
        }

        Ok(ProcessOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            duration_ms: response.delay.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        })
    }
}
