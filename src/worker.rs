//! Phase workers: the external agents that produce each phase's output.
//!
//! A worker gets the phase, the assembled input and a working directory and
//! returns free text. Every worker error is retried with backoff up to the
//! configured bound before the phase is declared failed.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::{FlowError, FlowResult};
use crate::flow_config::RetryPolicy;
use crate::phase::PhaseKind;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transient: the worker could not be reached or died.
    #[error("worker unreachable: {0}")]
    Unreachable(String),
    /// The worker ran and declined to produce output.
    #[error("worker refused: {0}")]
    Refused(String),
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(
        &self,
        phase: PhaseKind,
        input: &str,
        workdir: &Path,
    ) -> Result<String, WorkerError>;
}

/// Runs an external command per phase, input on stdin, output on stdout.
///
/// The child is killed if the invocation is dropped, which is how
/// cancellation reaches the subprocess.
pub struct CommandWorker {
    command: String,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(
        &self,
        phase: PhaseKind,
        input: &str,
        workdir: &Path,
    ) -> Result<String, WorkerError> {
        tracing::debug!(command = %self.command, %phase, workdir = %workdir.display(), "spawning worker");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("FORGEFLOW_PHASE", phase.as_str())
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::Unreachable(format!("failed to spawn {}: {}", self.command, e))
            })?;

        // Feed stdin from a separate task so a chatty child can't deadlock us.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_string();
            tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkerError::Unreachable(format!("worker I/O failed: {}", e)))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The child may legitimately exit without reading all of stdin.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => {
                    return Err(WorkerError::Unreachable(format!(
                        "failed to write worker input: {}",
                        e
                    )));
                }
                Err(e) => return Err(WorkerError::Unreachable(e.to_string())),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::Refused(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err(WorkerError::Refused(format!(
                "{} produced no output",
                self.command
            )));
        }
        Ok(stdout)
    }
}

/// Invoke `worker`, retrying with exponential backoff until it succeeds,
/// the attempts are exhausted, or `cancel` fires.
pub async fn invoke_with_retry(
    worker: &dyn Worker,
    phase: PhaseKind,
    input: &str,
    workdir: &Path,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> FlowResult<String> {
    let max_attempts = policy.max_attempts.max(1);
    let cancelled = |attempts: u32| FlowError::WorkerFailure {
        phase,
        attempts,
        message: "cancelled".to_string(),
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(attempt)),
            r = worker.execute(phase, input, workdir) => r,
        };

        let err = match result {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };
        if attempt >= max_attempts {
            tracing::error!(%phase, attempt, "worker failed, giving up: {}", err);
            return Err(FlowError::WorkerFailure {
                phase,
                attempts: attempt,
                message: err.to_string(),
            });
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!(%phase, attempt, delay_ms = delay.as_millis() as u64, "worker failed, retrying: {}", err);
        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(attempt)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
