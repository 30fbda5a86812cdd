// Injected subprocess capability.
//
// The catalog and session never touch `tokio::process` directly; they go
// through `ProcessRunner` so orchestration logic is testable without real
// subprocesses. `TokioProcessRunner` is the production implementation.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Fully collected output of a process run to completion.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Exit code; `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Handle to a process whose output is streamed line by line.
///
/// The stdout/stderr channels close at pipe EOF; `exit` resolves with the
/// exit code afterwards. Sending on `stop` kills the process.
pub struct SpawnedProcess {
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
    pub stop: oneshot::Sender<()>,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion, capturing stdout and stderr fully.
    async fn run_capture(&self, program: &Path, args: &[String])
        -> std::io::Result<CapturedOutput>;

    /// Spawn with stdout/stderr forwarded line by line as they arrive.
    async fn spawn_streaming(&self, program: &Path, args: &[String])
        -> std::io::Result<SpawnedProcess>;
}

/// Production runner backed by `tokio::process`.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run_capture(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<CapturedOutput> {
        debug!(program = %program.display(), ?args, "running process to completion");
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CapturedOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn_streaming(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<SpawnedProcess> {
        debug!(program = %program.display(), ?args, "spawning streaming process");
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout_pipe = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "failed to capture stdout")
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "failed to capture stderr")
        })?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(error) => {
                        warn!(%error, "failed to wait for child process");
                        None
                    }
                },
                _ = &mut stop_rx => {
                    if let Err(error) = child.kill().await {
                        warn!(%error, "failed to kill child process");
                    }
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            stop: stop_tx,
        })
    }
}
