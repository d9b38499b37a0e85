//! The process runner seam.

use super::timeout::{run_with_timeout, TimedResult};
use super::{Invocation, ProcessOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Spawns external processes.
///
/// Every external tool the pipeline touches goes through this trait, so tests
/// can substitute a scripted or mocked runner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync + Debug {
    /// Runs an invocation to completion, bounded by `timeout`.
    ///
    /// A non-zero exit code is not an error at this level; callers decide
    /// what it means.
    ///
    /// # Errors
    ///
    /// Returns `Spawn` if the process cannot be started and `Timeout` if it
    /// had to be killed.
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput, PipelineError>;
}

/// Runs processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput, PipelineError> {
        let command_line = invocation.command_line();
        let mut std_command = std::process::Command::new(invocation.resolved_program());
        std_command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout reaches everything the command started.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut std_command, 0);
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| PipelineError::Spawn {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!(command = %command_line, cwd = %invocation.cwd.display(), pid = ?pid, "Spawned process");

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        // The budget covers the pipes too: a grandchild holding them open counts.
        let collected = run_with_timeout(timeout, async {
            tokio::try_join!(child.wait(), read_pipe(stdout_pipe), read_pipe(stderr_pipe))
        })
        .await;

        let (status, stdout, stderr) = match collected {
            TimedResult::Ok(collected) => collected,
            TimedResult::Err(e) => return Err(PipelineError::Io(e)),
            TimedResult::Timeout => {
                warn!(command = %command_line, timeout_secs = timeout.as_secs_f64(), "Killing process group after timeout");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(command = %command_line, error = %e, "Process already gone");
                }
                return Err(PipelineError::Timeout {
                    command: command_line,
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
        };
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        debug!(command = %command_line, exit_code = ?status.code(), duration_ms, "Process finished");
        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration_ms,
        })
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Sends `SIGKILL` to the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pgid = pid, error = %e, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
