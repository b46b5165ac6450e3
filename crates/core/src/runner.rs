//! Dispatch loop that turns admitted jobs into engine calls.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{ProgressReporter, RenderEngine, RenderInvocation};
use crate::error::EngineError;
use crate::job::{JobError, JobStatus};
use crate::queue::{AdmittedJob, JobOutcome, RenderJobQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// Wall-clock bound on one engine call.
    pub job_timeout: Option<Duration>,
    pub serve_url: Option<String>,
}

#[derive(Clone)]
pub struct JobRunner {
    queue: RenderJobQueue,
    engine: Arc<dyn RenderEngine>,
    settings: Arc<RunnerSettings>,
}

impl JobRunner {
    pub fn new(queue: RenderJobQueue, engine: Arc<dyn RenderEngine>, settings: RunnerSettings) -> Self {
        Self {
            queue,
            engine,
            settings: Arc::new(settings),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Admits jobs while slots are free; on shutdown cancels running jobs and
    /// waits for them to settle.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut executions = JoinSet::new();
        info!("Render job runner started");

        loop {
            while let Some(job) = self.queue.admit_next() {
                let runner = self.clone();
                executions.spawn(async move { runner.execute(job).await });
            }
            while executions.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.work_available() => {}
            }
        }

        for job in self.queue.list_jobs() {
            if job.status == JobStatus::Running {
                if let Err(err) = self.queue.cancel_job(&job.id).await {
                    warn!(job_id = %job.id, error = %err, "Failed to cancel job during shutdown");
                }
            }
        }
        while executions.join_next().await.is_some() {}
        info!("Render job runner stopped");
    }

    async fn execute(self, job: AdmittedJob) {
        let id = job.id.clone();
        let task = tokio::spawn(self.clone().render_job(job));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(job_id = %id, error = %join_err, "Render task panicked");
                JobOutcome::Failed(JobError {
                    message: "render task panicked".to_string(),
                    stack: None,
                })
            }
        };
        self.queue.finish(&id, outcome).await;
    }

    async fn render_job(self, job: AdmittedJob) -> JobOutcome {
        let AdmittedJob {
            id,
            request,
            cancel_token,
        } = job;
        if cancel_token.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let output_path = self.settings.output_dir.join(request.out_name());
        match prepare_output_location(&output_path).await {
            Ok(true) => {
                info!(job_id = %id, path = %output_path.display(), "Removed existing output before rendering");
                self.queue.mark_output_deleted(&id);
            }
            Ok(false) => {}
            Err(err) => {
                return failed(format!(
                    "failed to prepare output location {}: {err}",
                    output_path.display()
                ))
            }
        }

        let scratch_dir = self.settings.scratch_dir.join(&id);
        if let Err(err) = tokio::fs::create_dir_all(&scratch_dir).await {
            return failed(format!(
                "failed to create scratch directory {}: {err}",
                scratch_dir.display()
            ));
        }
        let scratch_for_cleanup = scratch_dir.clone();
        let registered = self
            .queue
            .register_cleanup(
                &id,
                "remove scratch directory",
                Box::new(move || Box::pin(remove_scratch_dir(scratch_for_cleanup))),
            )
            .await;
        if let Err(err) = registered {
            return failed(err.to_string());
        }

        let invocation = RenderInvocation {
            job_id: id.clone(),
            request,
            output_path,
            scratch_dir,
            serve_url: self.settings.serve_url.clone(),
        };
        let reporter = ProgressReporter::new(self.queue.clone(), &id);
        info!(job_id = %id, "Render started");

        let render = self
            .engine
            .render(invocation, reporter, cancel_token.clone());
        let result = match self.settings.job_timeout {
            Some(limit) => tokio::time::timeout(limit, render)
                .await
                .unwrap_or(Err(EngineError::TimedOut(limit.as_millis() as u64))),
            None => render.await,
        };

        if cancel_token.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        match result {
            Ok(()) => JobOutcome::Succeeded,
            Err(EngineError::Cancelled) => JobOutcome::Cancelled,
            Err(EngineError::Failed { message, stack }) => {
                warn!(job_id = %id, error = %message, "Render failed");
                JobOutcome::Failed(JobError { message, stack })
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "Render failed");
                failed(err.to_string())
            }
        }
    }
}

fn failed(message: String) -> JobOutcome {
    JobOutcome::Failed(JobError {
        message,
        stack: None,
    })
}

/// Ensures the parent exists and removes a previous output. Returns whether
/// something was deleted.
async fn prepare_output_location(path: &Path) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            tokio::fs::remove_dir_all(path).await?;
            Ok(true)
        }
        Ok(_) => {
            tokio::fs::remove_file(path).await?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

async fn remove_scratch_dir(path: PathBuf) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("failed to remove scratch directory {}", path.display()))),
    }
}
