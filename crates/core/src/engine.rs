//! The render engine seam and the process-backed engine shipped with renderq.
//!
//! [`ProcessRenderEngine`] launches an external renderer, writes the
//! [`RenderInvocation`] to its stdin as one JSON document and reads
//! newline-delimited events from its stdout:
//!
//! ```text
//! {"type":"progress","stage":"rendering","value":0.5,"renderedFrames":30,"encodedFrames":0,"totalFrames":60}
//! {"type":"error","message":"Composition not found","stack":null}
//! ```

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::job::{RenderProgress, RenderRequest};
use crate::queue::RenderJobQueue;

/// Everything an engine needs to produce one job's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInvocation {
    pub job_id: String,
    pub request: RenderRequest,
    pub output_path: PathBuf,
    pub scratch_dir: PathBuf,
    /// Base URL of the local asset server, when one is running.
    pub serve_url: Option<String>,
}

/// Forwards engine progress into the job record.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: RenderJobQueue,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(queue: RenderJobQueue, job_id: impl Into<String>) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
        }
    }

    pub fn report(&self, progress: RenderProgress) {
        self.queue.report_progress(&self.job_id, progress);
    }
}

#[async_trait]
pub trait RenderEngine: Send + Sync + 'static {
    /// Renders until done, failed or `cancel` fires. Implementations must
    /// return promptly (with [`EngineError::Cancelled`]) once cancelled.
    async fn render(
        &self,
        invocation: RenderInvocation,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineEvent {
    Progress(RenderProgress),
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessRenderEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessRenderEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl RenderEngine for ProcessRenderEngine {
    async fn render(
        &self,
        invocation: RenderInvocation,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let job_id = invocation.job_id.clone();
        let payload = serde_json::to_vec(&invocation)
            .map_err(|err| EngineError::failed(format!("failed to encode render invocation: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&invocation.request.common().env_variables)
            .current_dir(&invocation.scratch_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::Crashed(format!(
                    "failed to start render engine {}: {err}",
                    self.program.display()
                ))
            })?;

        // Written from its own task so an engine that never drains stdin cannot
        // hold up stdout handling or cancellation.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let job_id = job_id.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    warn!(job_id = %job_id, error = %err, "Failed to send invocation to render engine");
                }
                // Dropping stdin closes it so the engine sees EOF.
            })
        });
        let _stdin_guard = stdin_task.map(AbortOnDrop);

        let stderr_task = child.stderr.take().map(|stderr| {
            let job_id = job_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "render_engine_stderr", job_id = %job_id, "{}", line);
                }
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Crashed("render engine stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut reported_error = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(job_id = %job_id, error = %err, "Failed to kill render engine");
                    }
                    return Err(EngineError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => match serde_json::from_str::<EngineEvent>(&line) {
                    Ok(EngineEvent::Progress(update)) => progress.report(update),
                    Ok(EngineEvent::Error { message, stack }) => {
                        reported_error = Some(EngineError::Failed { message, stack });
                    }
                    Err(_) => debug!(target: "render_engine_stdout", job_id = %job_id, "{}", line),
                },
                Ok(None) => break,
                Err(err) => {
                    return Err(EngineError::Crashed(format!(
                        "failed to read render engine output: {err}"
                    )))
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(job_id = %job_id, error = %err, "Failed to kill render engine");
                }
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|err| EngineError::Crashed(format!("failed to wait for render engine: {err}")))?,
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if let Some(error) = reported_error {
            return Err(error);
        }
        if !status.success() {
            return Err(EngineError::Crashed(format!(
                "render engine exited with status {status}"
            )));
        }
        Ok(())
    }
}
