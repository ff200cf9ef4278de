//! Tool runner backed by real child processes.

use super::{ToolError, ToolInvocation, ToolOutput, ToolRunner};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs tools with `tokio::process`, capturing stdout and stderr.
///
/// On cancellation the child gets SIGTERM, then SIGKILL once `kill_grace`
/// has elapsed. Children are also killed if the running future is dropped.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    async fn terminate(&self, child: &mut Child, program: &str) {
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to {} (pid {}): {}", program, pid, e);
            }
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(_) => {
                    info!("{} (pid {}) exited after SIGTERM", program, pid);
                    return;
                }
                Err(_) => warn!("{} (pid {}) ignored SIGTERM, killing", program, pid),
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", program, e);
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        debug!("Running {}", invocation);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        // Drain pipes concurrently so a chatty tool never blocks on a full pipe.
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ToolError::Io {
                program: invocation.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                self.terminate(&mut child, &invocation.program).await;
                return Err(ToolError::Cancelled {
                    program: invocation.program.clone(),
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        debug!("{} exited with {:?}", invocation.program, status.code());

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

async fn read_stream<R>(stream: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
