//! In-memory registry of render jobs.
//!
//! [`RenderJobQueue`] is the only place job state changes. Records live in a
//! `DashMap`; FIFO admission and the running-set bookkeeping live behind a
//! separate mutex that is always taken before any record shard and never held
//! across an `.await`. Cleanup actions are collected under the record lock and
//! executed after every lock has been released.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{JobError, JobSnapshot, JobStatus, RenderProgress, RenderRequest};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;
type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Change notifications for observers such as the studio UI.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobUpdated { job: JobSnapshot },
    JobRemoved { id: String },
}

/// How an execution ended, as reported by the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    Failed(JobError),
    Cancelled,
}

/// A job the runner has been allowed to start.
#[derive(Debug, Clone)]
pub struct AdmittedJob {
    pub id: String,
    pub request: RenderRequest,
    pub cancel_token: CancellationToken,
}

#[derive(Default)]
struct CleanupList {
    pending: Vec<(String, CleanupAction)>,
    executed: usize,
    /// Set once the job reached a terminal state or was removed; later
    /// registrations run immediately.
    sealed: bool,
    /// Failures of the runner's terminal pass, handed to a `remove_job`
    /// that cancelled the running job.
    runner_failures: Vec<String>,
}

impl CleanupList {
    fn take_pending(&mut self) -> Vec<(String, CleanupAction)> {
        let actions = std::mem::take(&mut self.pending);
        self.executed += actions.len();
        actions
    }
}

/// A job's cleanup list plus a flag raised once its terminal pass has
/// finished running.
struct JobCleanup {
    list: Mutex<CleanupList>,
    drained: watch::Sender<bool>,
}

impl JobCleanup {
    fn new() -> Self {
        Self {
            list: Mutex::new(CleanupList::default()),
            drained: watch::channel(false).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CleanupList> {
        self.list
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn wait_drained(&self) {
        let mut rx = self.drained.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

/// Raises `drained` even if the pass is dropped midway.
struct DrainedOnDrop<'a>(&'a watch::Sender<bool>);

impl Drop for DrainedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

struct JobEntry {
    seq: u64,
    request: RenderRequest,
    status: JobStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    progress: Option<RenderProgress>,
    error: Option<JobError>,
    deleted_output_location: bool,
    cancel_token: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
    cleanup: Arc<JobCleanup>,
}

impl JobEntry {
    fn snapshot(&self, id: &str) -> JobSnapshot {
        JobSnapshot {
            id: id.to_string(),
            kind: self.request.kind(),
            status: self.status,
            composition_id: self.request.composition_id().to_string(),
            out_name: self.request.out_name().to_string(),
            request: self.request.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress.clone(),
            error: self.error.clone(),
            deleted_output_location: self.deleted_output_location,
        }
    }

    fn enter_terminal(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.status_tx.send_replace(status);
    }
}

struct Admission {
    pending: VecDeque<String>,
    running: HashSet<String>,
    max_concurrency: usize,
}

struct QueueInner {
    jobs: DashMap<String, JobEntry>,
    admission: Mutex<Admission>,
    next_seq: AtomicU64,
    work_available: Notify,
    events: broadcast::Sender<QueueEvent>,
    id_generator: IdGenerator,
}

/// Cheaply cloneable handle to one job registry.
#[derive(Clone)]
pub struct RenderJobQueue {
    inner: Arc<QueueInner>,
}

impl RenderJobQueue {
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_id_generator(max_concurrency, || Uuid::new_v4().to_string())
    }

    pub fn with_id_generator<F>(max_concurrency: usize, id_generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                jobs: DashMap::new(),
                admission: Mutex::new(Admission {
                    pending: VecDeque::new(),
                    running: HashSet::new(),
                    max_concurrency: max_concurrency.max(1),
                }),
                next_seq: AtomicU64::new(0),
                work_available: Notify::new(),
                events,
                id_generator: Box::new(id_generator),
            }),
        }
    }

    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.inner
            .admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn publish_snapshot(&self, id: &str) {
        if let Some(job) = self.get_job(id) {
            self.publish(QueueEvent::JobUpdated { job });
        }
    }

    /// Creates an `idle` job and wakes the runner. Never waits for execution.
    pub fn add_job(&self, request: RenderRequest) -> Result<String, QueueError> {
        request.validate()?;

        let mut admission = self.admission();
        let id = match self.insert_idle(request.clone()) {
            Ok(id) => id,
            Err(QueueError::DuplicateId(first)) => {
                warn!(job_id = %first, "Job id collision; regenerating once");
                self.insert_idle(request)?
            }
            Err(err) => return Err(err),
        };
        admission.pending.push_back(id.clone());
        drop(admission);

        info!(job_id = %id, "Render job queued");
        self.publish_snapshot(&id);
        self.inner.work_available.notify_one();
        Ok(id)
    }

    fn insert_idle(&self, request: RenderRequest) -> Result<String, QueueError> {
        let id = (self.inner.id_generator)();
        match self.inner.jobs.entry(id.clone()) {
            Entry::Occupied(_) => Err(QueueError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let (status_tx, _) = watch::channel(JobStatus::Idle);
                slot.insert(JobEntry {
                    seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    request,
                    status: JobStatus::Idle,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    progress: None,
                    error: None,
                    deleted_output_location: false,
                    cancel_token: CancellationToken::new(),
                    status_tx,
                    cleanup: Arc::new(JobCleanup::new()),
                });
                Ok(id)
            }
        }
    }

    pub fn get_job(&self, id: &str) -> Option<JobSnapshot> {
        self.inner.jobs.get(id).map(|entry| entry.snapshot(id))
    }

    /// Snapshots of every job in submission order.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<(u64, JobSnapshot)> = self
            .inner
            .jobs
            .iter()
            .map(|entry| (entry.seq, entry.snapshot(entry.key())))
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.admission().max_concurrency
    }

    pub fn running_count(&self) -> usize {
        self.admission().running.len()
    }

    /// Only affects future admissions; running jobs are never preempted.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let max_concurrency = max_concurrency.max(1);
        self.admission().max_concurrency = max_concurrency;
        info!(max_concurrency, "Render concurrency updated");
        self.inner.work_available.notify_one();
    }

    /// Resolves when new work may be admissible (submission, freed slot,
    /// concurrency change).
    pub async fn work_available(&self) {
        self.inner.work_available.notified().await;
    }

    /// Moves the oldest `idle` job to `running` if a slot is free.
    pub fn admit_next(&self) -> Option<AdmittedJob> {
        let admitted = {
            let mut admission = self.admission();
            if admission.running.len() >= admission.max_concurrency {
                return None;
            }

            let mut admitted = None;
            while let Some(id) = admission.pending.pop_front() {
                let Some(mut entry) = self.inner.jobs.get_mut(&id) else {
                    continue;
                };
                if entry.status != JobStatus::Idle {
                    continue;
                }
                entry.status = JobStatus::Running;
                entry.started_at = Some(Utc::now());
                entry.progress = Some(RenderProgress::preparing());
                entry.status_tx.send_replace(JobStatus::Running);
                admitted = Some(AdmittedJob {
                    id: id.clone(),
                    request: entry.request.clone(),
                    cancel_token: entry.cancel_token.clone(),
                });
                drop(entry);
                admission.running.insert(id);
                break;
            }
            admitted
        }?;

        debug!(job_id = %admitted.id, "Render job admitted");
        self.publish_snapshot(&admitted.id);
        Some(admitted)
    }

    /// Triggers the job's cancellation token. Idle jobs become `cancelled`
    /// immediately; running jobs are cancelled by the runner at its next
    /// checkpoint; terminal jobs are left untouched.
    pub async fn cancel_job(&self, id: &str) -> Result<(), QueueError> {
        let failures = self.cancel_and_cleanup(id).await?;
        log_cleanup_failures(id, &failures);
        Ok(())
    }

    async fn cancel_and_cleanup(&self, id: &str) -> Result<Vec<String>, QueueError> {
        let cleanup = {
            let mut admission = self.admission();
            let mut entry = self
                .inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
            entry.cancel_token.cancel();
            if entry.status != JobStatus::Idle {
                return Ok(Vec::new());
            }
            admission.pending.retain(|pending| pending != id);
            entry.enter_terminal(JobStatus::Cancelled);
            entry.cleanup.clone()
        };

        info!(job_id = %id, "Idle render job cancelled");
        self.publish_snapshot(id);
        Ok(run_terminal_cleanup(id, &cleanup, false).await)
    }

    /// Cancels the job if needed (waiting for a running execution to stop),
    /// runs every cleanup action that has not run yet and deletes the record.
    /// Returns only after every registered action has finished.
    pub async fn remove_job(&self, id: &str) -> Result<(), QueueError> {
        let (status, cleanup) = self
            .inner
            .jobs
            .get(id)
            .map(|entry| (entry.status, entry.cleanup.clone()))
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;

        let mut failures = Vec::new();
        if !status.is_terminal() {
            failures = self.cancel_and_cleanup(id).await?;
            self.wait_for_terminal(id).await?;
        }
        cleanup.wait_drained().await;
        if !status.is_terminal() {
            failures.append(&mut cleanup.lock().runner_failures);
        }

        let Some((_, entry)) = self.inner.jobs.remove(id) else {
            return Err(QueueError::JobNotFound(id.to_string()));
        };
        failures.extend(run_terminal_cleanup(id, &entry.cleanup, false).await);

        info!(job_id = %id, "Render job removed");
        self.publish(QueueEvent::JobRemoved { id: id.to_string() });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(QueueError::CleanupFailure {
                job_id: id.to_string(),
                failures,
            })
        }
    }

    /// Waits until the job is in a terminal state and returns that state.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<JobStatus, QueueError> {
        let mut rx = self
            .inner
            .jobs
            .get(id)
            .map(|entry| entry.status_tx.subscribe())
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        let status = rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|status| *status)
            .map_err(|_| QueueError::JobNotFound(id.to_string()))?;
        Ok(status)
    }

    pub fn report_progress(&self, id: &str, progress: RenderProgress) {
        let updated = match self.inner.jobs.get_mut(id) {
            Some(mut entry) if entry.status == JobStatus::Running => {
                entry.progress = Some(progress);
                true
            }
            _ => false,
        };
        if updated {
            self.publish_snapshot(id);
        }
    }

    pub fn mark_output_deleted(&self, id: &str) {
        if let Some(mut entry) = self.inner.jobs.get_mut(id) {
            entry.deleted_output_location = true;
        }
    }

    /// Registers a release action for the job. If the job already reached a
    /// terminal state the action runs right away.
    pub async fn register_cleanup(
        &self,
        id: &str,
        label: impl Into<String>,
        action: CleanupAction,
    ) -> Result<(), QueueError> {
        let label = label.into();
        let cleanup = match self.inner.jobs.get(id) {
            Some(entry) => entry.cleanup.clone(),
            None => {
                run_cleanup_action(id, &label, action).await.ok();
                return Err(QueueError::JobNotFound(id.to_string()));
            }
        };

        let run_now = {
            let mut list = cleanup.lock();
            if list.sealed {
                list.executed += 1;
                Some(action)
            } else {
                list.pending.push((label.clone(), action));
                None
            }
        };

        if let Some(action) = run_now {
            if let Err(failure) = run_cleanup_action(id, &label, action).await {
                log_cleanup_failures(id, &[failure]);
            }
        }
        Ok(())
    }

    /// Records the end of an execution, frees its slot and runs cleanups.
    /// Terminal states are absorbing: a second report is ignored.
    pub async fn finish(&self, id: &str, outcome: JobOutcome) {
        let cleanup = {
            let mut admission = self.admission();
            admission.running.remove(id);
            let Some(mut entry) = self.inner.jobs.get_mut(id) else {
                drop(admission);
                self.inner.work_available.notify_one();
                return;
            };
            if entry.status.is_terminal() {
                drop(entry);
                drop(admission);
                self.inner.work_available.notify_one();
                return;
            }
            match outcome {
                JobOutcome::Succeeded => entry.enter_terminal(JobStatus::Done),
                JobOutcome::Failed(error) => {
                    entry.error = Some(error);
                    entry.enter_terminal(JobStatus::Failed);
                }
                JobOutcome::Cancelled => entry.enter_terminal(JobStatus::Cancelled),
            }
            entry.cleanup.clone()
        };
        self.inner.work_available.notify_one();

        if let Some(job) = self.get_job(id) {
            info!(job_id = %id, status = ?job.status, "Render job finished");
            self.publish(QueueEvent::JobUpdated { job });
        }

        let failures = run_terminal_cleanup(id, &cleanup, true).await;
        log_cleanup_failures(id, &failures);
    }
}

/// Seals the list and runs whatever is pending. The pass that seals also
/// raises `drained` once its actions are done, after storing its failures
/// when `keep_failures` is set.
async fn run_terminal_cleanup(id: &str, cleanup: &JobCleanup, keep_failures: bool) -> Vec<String> {
    let (actions, first_pass) = {
        let mut list = cleanup.lock();
        let first_pass = !list.sealed;
        list.sealed = true;
        (list.take_pending(), first_pass)
    };
    let _drained = first_pass.then(|| DrainedOnDrop(&cleanup.drained));

    let mut failures = Vec::new();
    for (label, action) in actions {
        if let Err(failure) = run_cleanup_action(id, &label, action).await {
            failures.push(failure);
        }
    }
    if keep_failures && first_pass {
        cleanup.lock().runner_failures.extend(failures.iter().cloned());
    }
    failures
}

async fn run_cleanup_action(id: &str, label: &str, action: CleanupAction) -> Result<(), String> {
    debug!(job_id = %id, cleanup = %label, "Running cleanup action");
    action().await.map_err(|err| format!("{label}: {err:#}"))
}

fn log_cleanup_failures(id: &str, failures: &[String]) {
    for failure in failures {
        warn!(job_id = %id, error = %failure, "Cleanup action failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::fixtures;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> CleanupAction {
        let counter = counter.clone();
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
        })
    }

    fn failing_cleanup(message: &'static str) -> CleanupAction {
        Box::new(move || Box::pin(async move { Err(anyhow::anyhow!(message)) }))
    }

    #[test]
    fn add_job_creates_idle_record() {
        let queue = RenderJobQueue::new(1);
        let id = queue.add_job(fixtures::still("Main", 0)).expect("add job");

        let jobs = queue.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].status, JobStatus::Idle);
        assert_eq!(jobs[0].out_name, "Main-0.png");
        assert!(!jobs[0].deleted_output_location);
    }

    #[test]
    fn add_job_rejects_invalid_request() {
        let queue = RenderJobQueue::new(1);
        let mut request = fixtures::still("Main", 0);
        if let RenderRequest::Still(still) = &mut request {
            still.common.composition_id = String::new();
        }
        let err = queue.add_job(request).expect_err("empty composition id");
        assert!(matches!(err, QueueError::InvalidRequest(_)));
        assert!(queue.list_jobs().is_empty());
    }

    #[test]
    fn colliding_id_is_retried_once_then_surfaced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_gen = calls.clone();
        let queue = RenderJobQueue::with_id_generator(1, move || {
            calls_for_gen.fetch_add(1, Ordering::SeqCst);
            "fixed".to_string()
        });

        queue.add_job(fixtures::still("Main", 0)).expect("first add");
        let err = queue
            .add_job(fixtures::still("Main", 1))
            .expect_err("second add collides twice");

        assert!(matches!(err, QueueError::DuplicateId(ref id) if id == "fixed"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.list_jobs().len(), 1);
        assert_eq!(queue.list_jobs()[0].request, fixtures::still("Main", 0));
    }

    #[test]
    fn collision_recovers_when_regenerated_id_is_free() {
        let ids = Mutex::new(vec!["b", "a", "a"]);
        let queue = RenderJobQueue::with_id_generator(1, move || {
            ids.lock().unwrap().pop().unwrap_or("z").to_string()
        });

        assert_eq!(queue.add_job(fixtures::still("Main", 0)).unwrap(), "a");
        assert_eq!(queue.add_job(fixtures::still("Main", 1)).unwrap(), "b");
    }

    #[test]
    fn list_jobs_preserves_submission_order() {
        let queue = RenderJobQueue::new(1);
        let ids: Vec<String> = (0..10)
            .map(|frame| queue.add_job(fixtures::still("Main", frame)).unwrap())
            .collect();
        let listed: Vec<String> = queue.list_jobs().into_iter().map(|job| job.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn admission_is_fifo_and_respects_max_concurrency() {
        let queue = RenderJobQueue::new(2);
        let first = queue.add_job(fixtures::still("Main", 0)).unwrap();
        let second = queue.add_job(fixtures::still("Main", 1)).unwrap();
        let third = queue.add_job(fixtures::still("Main", 2)).unwrap();

        assert_eq!(queue.admit_next().unwrap().id, first);
        assert_eq!(queue.admit_next().unwrap().id, second);
        assert!(queue.admit_next().is_none());
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.get_job(&third).unwrap().status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn finishing_frees_slot_for_next_job() {
        let queue = RenderJobQueue::new(1);
        let first = queue.add_job(fixtures::still("Main", 0)).unwrap();
        let second = queue.add_job(fixtures::still("Main", 1)).unwrap();

        assert_eq!(queue.admit_next().unwrap().id, first);
        assert!(queue.admit_next().is_none());

        queue.finish(&first, JobOutcome::Succeeded).await;
        assert_eq!(queue.get_job(&first).unwrap().status, JobStatus::Done);
        assert_eq!(queue.admit_next().unwrap().id, second);
    }

    #[tokio::test]
    async fn lowering_concurrency_does_not_preempt_running_jobs() {
        let queue = RenderJobQueue::new(3);
        for frame in 0..4 {
            queue.add_job(fixtures::still("Main", frame)).unwrap();
        }
        let running: Vec<AdmittedJob> = std::iter::from_fn(|| queue.admit_next()).collect();
        assert_eq!(running.len(), 3);

        queue.set_max_concurrency(1);
        assert_eq!(queue.running_count(), 3);
        for job in &running {
            assert_eq!(queue.get_job(&job.id).unwrap().status, JobStatus::Running);
        }

        queue.finish(&running[0].id, JobOutcome::Succeeded).await;
        assert!(queue.admit_next().is_none(), "still above the new limit");
        queue.finish(&running[1].id, JobOutcome::Succeeded).await;
        queue.finish(&running[2].id, JobOutcome::Succeeded).await;
        assert!(queue.admit_next().is_some());
    }

    #[tokio::test]
    async fn cancelling_idle_job_skips_execution() {
        let queue = RenderJobQueue::new(1);
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();

        queue.cancel_job(&id).await.expect("cancel idle job");
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Cancelled);
        assert!(queue.admit_next().is_none());
    }

    #[tokio::test]
    async fn cancelling_running_job_signals_token_and_waits_for_runner() {
        let queue = RenderJobQueue::new(1);
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        let admitted = queue.admit_next().unwrap();

        queue.cancel_job(&id).await.expect("cancel running job");
        assert!(admitted.cancel_token.is_cancelled());
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Running);

        queue.finish(&id, JobOutcome::Cancelled).await;
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_harmless_on_terminal_jobs() {
        let queue = RenderJobQueue::new(1);
        let done = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();
        queue.finish(&done, JobOutcome::Succeeded).await;

        queue.cancel_job(&done).await.expect("cancel done job");
        queue.cancel_job(&done).await.expect("cancel done job twice");
        assert_eq!(queue.get_job(&done).unwrap().status, JobStatus::Done);

        let idle = queue.add_job(fixtures::still("Main", 1)).unwrap();
        queue.cancel_job(&idle).await.unwrap();
        queue.cancel_job(&idle).await.unwrap();
        assert_eq!(queue.get_job(&idle).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let queue = RenderJobQueue::new(1);
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();
        queue
            .finish(
                &id,
                JobOutcome::Failed(JobError {
                    message: "boom".to_string(),
                    stack: None,
                }),
            )
            .await;
        queue.finish(&id, JobOutcome::Succeeded).await;
        queue.report_progress(&id, RenderProgress::preparing());

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn unknown_ids_report_job_not_found() {
        let queue = RenderJobQueue::new(1);
        assert!(matches!(
            queue.cancel_job("missing").await,
            Err(QueueError::JobNotFound(_))
        ));
        assert!(matches!(
            queue.remove_job("missing").await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_runs_once_on_terminal_and_not_again_on_remove() {
        let queue = RenderJobQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();
        queue
            .register_cleanup(&id, "scratch", counting_cleanup(&counter))
            .await
            .unwrap();

        queue.finish(&id, JobOutcome::Succeeded).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        queue.remove_job(&id).await.expect("remove finished job");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(queue.get_job(&id).is_none());
    }

    #[tokio::test]
    async fn cleanup_registered_after_cancel_runs_exactly_once() {
        let queue = RenderJobQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();

        queue.cancel_job(&id).await.unwrap();
        queue
            .register_cleanup(&id, "late", counting_cleanup(&counter))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        queue.finish(&id, JobOutcome::Cancelled).await;
        queue
            .register_cleanup(&id, "after-terminal", counting_cleanup(&counter))
            .await
            .unwrap();
        queue.remove_job(&id).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_running_job_cancels_and_awaits_termination() {
        let queue = RenderJobQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        let admitted = queue.admit_next().unwrap();
        queue
            .register_cleanup(&id, "scratch", counting_cleanup(&counter))
            .await
            .unwrap();

        let runner_queue = queue.clone();
        let runner = tokio::spawn(async move {
            admitted.cancel_token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            runner_queue.finish(&admitted.id, JobOutcome::Cancelled).await;
        });

        queue.remove_job(&id).await.expect("remove running job");
        runner.await.unwrap();

        assert!(queue.get_job(&id).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_running_job_waits_for_runner_cleanups_and_reports_failures() {
        let queue = RenderJobQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        let admitted = queue.admit_next().unwrap();

        let slow_counter = counter.clone();
        queue
            .register_cleanup(
                &id,
                "slow release",
                Box::new(move || {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        slow_counter.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    })
                }),
            )
            .await
            .unwrap();
        queue
            .register_cleanup(&id, "unmount", failing_cleanup("device busy"))
            .await
            .unwrap();

        let runner_queue = queue.clone();
        let runner = tokio::spawn(async move {
            admitted.cancel_token.cancelled().await;
            runner_queue.finish(&admitted.id, JobOutcome::Cancelled).await;
        });

        let err = queue.remove_job(&id).await.expect_err("runner cleanup failed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        match err {
            QueueError::CleanupFailure { job_id, failures } => {
                assert_eq!(job_id, id);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("device busy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(queue.get_job(&id).is_none());
        runner.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_failures_on_runner_termination_do_not_block_removal() {
        let queue = RenderJobQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();
        queue
            .register_cleanup(&id, "first", failing_cleanup("disk gone"))
            .await
            .unwrap();
        queue
            .register_cleanup(&id, "second", counting_cleanup(&counter))
            .await
            .unwrap();

        queue.finish(&id, JobOutcome::Cancelled).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        queue.remove_job(&id).await.expect("nothing left to clean up");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(queue.get_job(&id).is_none());
    }

    #[tokio::test]
    async fn remove_aggregates_failures_of_cleanups_it_ran() {
        let queue = RenderJobQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue
            .register_cleanup(&id, "first", failing_cleanup("disk gone"))
            .await
            .unwrap();
        queue
            .register_cleanup(&id, "second", counting_cleanup(&counter))
            .await
            .unwrap();
        queue
            .register_cleanup(&id, "third", failing_cleanup("still gone"))
            .await
            .unwrap();

        let err = queue.remove_job(&id).await.expect_err("cleanup failures");
        match err {
            QueueError::CleanupFailure { job_id, failures } => {
                assert_eq!(job_id, id);
                assert_eq!(failures.len(), 2);
                assert!(failures[0].contains("disk gone"));
                assert!(failures[1].contains("still gone"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(queue.get_job(&id).is_none());
    }

    #[tokio::test]
    async fn events_are_published_for_transitions() {
        let queue = RenderJobQueue::new(1);
        let mut events = queue.subscribe();
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();
        queue.finish(&id, JobOutcome::Succeeded).await;
        queue.remove_job(&id).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                QueueEvent::JobUpdated { job } => statuses.push(format!("{:?}", job.status)),
                QueueEvent::JobRemoved { id: removed } => {
                    assert_eq!(removed, id);
                    statuses.push("Removed".to_string());
                }
            }
        }
        assert_eq!(statuses, vec!["Idle", "Running", "Done", "Removed"]);
    }

    #[tokio::test]
    async fn wait_for_terminal_returns_final_status() {
        let queue = RenderJobQueue::new(1);
        let id = queue.add_job(fixtures::still("Main", 0)).unwrap();
        queue.admit_next().unwrap();

        let waiter = {
            let queue = queue.clone();
            let id = id.clone();
            tokio::spawn(async move { queue.wait_for_terminal(&id).await })
        };
        tokio::task::yield_now().await;
        queue.finish(&id, JobOutcome::Succeeded).await;

        assert_eq!(waiter.await.unwrap().unwrap(), JobStatus::Done);
    }
}
