use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use babel_core::summary::QueueSummary;
use babel_core::types::{BatchJob, JobId, JobPriority, JobStatus, TransitionError};
use babel_job_store::{JobStore, JobStoreError};
use babel_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};
use babel_observe::time::unix_time_ms;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::events::QueueEvent;
use crate::worker::{JobContext, JobProcessor};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue config: {0}")]
    InvalidConfig(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {status:?}, operation requires {required:?}")]
    WrongStatus {
        job_id: JobId,
        status: JobStatus,
        required: JobStatus,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    /// Delay before a failed job with retries left is requeued.
    pub retry_delay: Duration,
    /// Fallback poll interval for the coordinator loop; normal operation is
    /// driven by wakeups.
    pub poll_interval: Duration,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_concurrent_jobs == 0 {
            return Err(QueueError::InvalidConfig(
                "max_concurrent_jobs must be > 0".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "event_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub running: bool,
    pub paused: bool,
    pub pending_jobs: usize,
    pub inflight_jobs: usize,
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub jobs_added_total: Counter,
    pub jobs_completed_total: Counter,
    pub jobs_failed_total: Counter,
    pub jobs_cancelled_total: Counter,
    pub retries_total: Counter,
    pub pending_jobs: Gauge,
    pub inflight_jobs: Gauge,
    pub inflight_jobs_high_water: Gauge,
    pub job_duration: DurationAgg,
}

struct QueueState {
    jobs: HashMap<JobId, BatchJob>,
    cancel_flags: HashMap<JobId, Arc<AtomicBool>>,
    pause_flags: HashMap<JobId, Arc<AtomicBool>>,
    // Arrival order, for deterministic ties within a priority.
    arrival: HashMap<JobId, u64>,
}

struct Core {
    cfg: QueueConfig,
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    state: Mutex<QueueState>,
    running: AtomicBool,
    paused: AtomicBool,
    inflight: AtomicUsize,
    // Auto-retries sleeping out their delay; the queue is not empty while
    // one is outstanding.
    pending_retries: AtomicUsize,
    arrival_seq: AtomicU64,
    queue_empty_emitted: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
    wake: Notify,
    metrics: Arc<QueueMetrics>,
}

/// Priority job queue backed by a [`JobStore`].
///
/// A single coordinator task dispatches pending jobs, highest priority and
/// earliest arrival first, keeping at most `max_concurrent_jobs` in flight.
/// Every status transition is persisted before the queue acts on it, so a
/// restart recovers all submitted work.
pub struct BatchQueue {
    core: Arc<Core>,
    coordinator: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatchQueue {
    /// Build the queue and recover persisted jobs. Jobs interrupted mid-run
    /// by a crash are marked failed so they can be retried.
    pub fn new(
        cfg: QueueConfig,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<Self, QueueError> {
        cfg.validate()?;
        let (events, _) = broadcast::channel(cfg.event_capacity);

        let mut jobs = HashMap::new();
        let mut arrival = HashMap::new();
        let mut seq = 0u64;
        let now = unix_time_ms();
        let mut recovered = store.all()?;
        recovered.sort_by_key(|j| (j.created_at_ms, j.id.clone()));
        for mut job in recovered {
            if matches!(job.status, JobStatus::Preparing | JobStatus::Processing) {
                job.transition(
                    JobStatus::Failed,
                    Some("interrupted by shutdown".to_string()),
                    now,
                )?;
                if let Err(err) = store.update(&job) {
                    warn!(
                        event = "store_write_failed",
                        job_id = %job.id,
                        error = %err,
                        "failed to persist recovered job"
                    );
                }
                info!(
                    event = "job_recovered_as_failed",
                    job_id = %job.id,
                    "job was in flight at shutdown, marked failed"
                );
            }
            arrival.insert(job.id.clone(), seq);
            seq += 1;
            jobs.insert(job.id.clone(), job);
        }

        let core = Arc::new(Core {
            cfg,
            store,
            processor,
            state: Mutex::new(QueueState {
                jobs,
                cancel_flags: HashMap::new(),
                pause_flags: HashMap::new(),
                arrival,
            }),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            pending_retries: AtomicUsize::new(0),
            arrival_seq: AtomicU64::new(seq),
            // Armed by the first submission; a queue that starts empty does
            // not announce itself.
            queue_empty_emitted: AtomicBool::new(true),
            events,
            wake: Notify::new(),
            metrics: Arc::new(QueueMetrics::default()),
        });

        Ok(Self {
            core,
            coordinator: Mutex::new(None),
        })
    }

    /// Start the coordinator loop. Idempotent.
    pub fn start(&self) {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = self.core.clone();
        let handle = tokio::spawn(async move { coordinator_loop(core).await });
        *lock(&self.coordinator) = Some(handle);
        info!(event = "queue_started", "queue started");
    }

    /// Stop dispatching and wait for the coordinator to exit. Jobs already
    /// in flight keep running.
    pub async fn stop(&self) {
        self.core.running.store(false, Ordering::SeqCst);
        self.core.wake.notify_one();
        let handle = lock(&self.coordinator).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(event = "queue_stopped", "queue stopped");
    }

    /// Pause dispatch of new jobs; in-flight jobs are unaffected.
    pub fn pause(&self) {
        self.core.paused.store(true, Ordering::SeqCst);
        info!(event = "queue_paused", "queue paused");
    }

    pub fn resume(&self) {
        self.core.paused.store(false, Ordering::SeqCst);
        self.core.wake.notify_one();
        info!(event = "queue_resumed", "queue resumed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.core.metrics.clone()
    }

    /// Create and enqueue a job. The id is assigned here.
    pub fn add_job(&self, name: &str, priority: JobPriority) -> Result<JobId, QueueError> {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = JobId(format!("job_{}", &uuid[..12]));
        let job = BatchJob::new(id.clone(), name, priority, unix_time_ms());
        self.submit(job)?;
        Ok(id)
    }

    pub fn add_jobs(
        &self,
        jobs: impl IntoIterator<Item = (String, JobPriority)>,
    ) -> Result<Vec<JobId>, QueueError> {
        jobs.into_iter()
            .map(|(name, priority)| self.add_job(&name, priority))
            .collect()
    }

    /// Enqueue a caller-built pending job (e.g. with metadata or a custom
    /// retry budget already set).
    pub fn submit(&self, job: BatchJob) -> Result<(), QueueError> {
        if job.status != JobStatus::Pending {
            return Err(QueueError::WrongStatus {
                job_id: job.id.clone(),
                status: job.status,
                required: JobStatus::Pending,
            });
        }
        self.core.store.add(&job)?;
        {
            let mut state = lock(&self.core.state);
            let seq = self.core.arrival_seq.fetch_add(1, Ordering::Relaxed);
            state.arrival.insert(job.id.clone(), seq);
            state.jobs.insert(job.id.clone(), job.clone());
        }
        self.core.queue_empty_emitted.store(false, Ordering::Relaxed);
        self.core.metrics.jobs_added_total.inc();
        self.core.wake.notify_one();
        info!(
            event = "job_added",
            job_id = %job.id,
            priority = ?job.priority,
            name = %job.name,
            "job added"
        );
        Ok(())
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<BatchJob> {
        lock(&self.core.state).jobs.get(job_id).cloned()
    }

    /// All jobs, sorted by creation time then id.
    pub fn jobs(&self) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = lock(&self.core.state).jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at_ms, j.id.clone()));
        jobs
    }

    /// Pending jobs in dispatch order.
    pub fn pending(&self) -> Vec<BatchJob> {
        let state = lock(&self.core.state);
        let mut jobs: Vec<BatchJob> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| {
            (
                std::cmp::Reverse(j.priority),
                state.arrival.get(&j.id).copied().unwrap_or(u64::MAX),
            )
        });
        jobs
    }

    /// Jobs claimed or currently processing.
    pub fn in_flight(&self) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = lock(&self.core.state)
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Preparing | JobStatus::Processing))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at_ms, j.id.clone()));
        jobs
    }

    /// Remove a job that has not started. In-flight jobs must be cancelled
    /// instead.
    pub fn remove_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        {
            let mut state = lock(&self.core.state);
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
            if job.status != JobStatus::Pending {
                return Err(QueueError::WrongStatus {
                    job_id: job_id.clone(),
                    status: job.status,
                    required: JobStatus::Pending,
                });
            }
            state.jobs.remove(job_id);
            state.arrival.remove(job_id);
        }
        self.core.store.remove(job_id)?;
        info!(event = "job_removed", job_id = %job_id, "job removed");
        Ok(())
    }

    /// Requeue a failed job, consuming one retry. Rejects jobs in any other
    /// status; paused jobs go through [`resume_job`](Self::resume_job).
    pub fn retry_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        retry_inner(&self.core, job_id)
    }

    /// Change the priority of a pending job.
    pub fn set_priority(&self, job_id: &JobId, priority: JobPriority) -> Result<(), QueueError> {
        let job = {
            let mut state = lock(&self.core.state);
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
            if job.status != JobStatus::Pending {
                return Err(QueueError::WrongStatus {
                    job_id: job_id.clone(),
                    status: job.status,
                    required: JobStatus::Pending,
                });
            }
            job.priority = priority;
            job.updated_at_ms = unix_time_ms();
            job.clone()
        };
        persist(&self.core, &job);
        self.core.wake.notify_one();
        Ok(())
    }

    /// Request cooperative pause of a processing job. The processor observes
    /// the flag at its next unit boundary and returns; the job lands in
    /// `Paused` instead of a terminal state.
    pub fn pause_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        let state = lock(&self.core.state);
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::WrongStatus {
                job_id: job_id.clone(),
                status: job.status,
                required: JobStatus::Processing,
            });
        }
        if let Some(flag) = state.pause_flags.get(job_id) {
            flag.store(true, Ordering::Relaxed);
        }
        info!(event = "job_pause_requested", job_id = %job_id, "pause requested");
        Ok(())
    }

    /// Put a paused job back in the pending queue. Does not consume a retry.
    pub fn resume_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        let job = {
            let mut state = lock(&self.core.state);
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
            if job.status != JobStatus::Paused {
                return Err(QueueError::WrongStatus {
                    job_id: job_id.clone(),
                    status: job.status,
                    required: JobStatus::Paused,
                });
            }
            job.transition(JobStatus::Pending, None, unix_time_ms())?;
            job.clone()
        };
        persist(&self.core, &job);
        self.core.queue_empty_emitted.store(false, Ordering::Relaxed);
        self.core.wake.notify_one();
        info!(event = "job_resumed", job_id = %job_id, "job resumed");
        Ok(())
    }

    /// Request cooperative cancellation of a processing job. The processor
    /// observes the flag at its next unit boundary.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        let state = lock(&self.core.state);
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::WrongStatus {
                job_id: job_id.clone(),
                status: job.status,
                required: JobStatus::Processing,
            });
        }
        if let Some(flag) = state.cancel_flags.get(job_id) {
            flag.store(true, Ordering::Relaxed);
        }
        info!(event = "job_cancel_requested", job_id = %job_id, "cancel requested");
        Ok(())
    }

    /// Drop completed and cancelled jobs from memory and the store.
    pub fn clear_completed(&self) -> Result<usize, QueueError> {
        let removed_ids: Vec<JobId> = {
            let mut state = lock(&self.core.state);
            let ids: Vec<JobId> = state
                .jobs
                .iter()
                .filter(|(_, j)| j.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                state.jobs.remove(id);
                state.arrival.remove(id);
            }
            ids
        };
        self.core.store.clear_completed()?;
        info!(
            event = "completed_cleared",
            removed = removed_ids.len(),
            "cleared terminal jobs"
        );
        Ok(removed_ids.len())
    }

    pub fn summary(&self) -> QueueSummary {
        let state = lock(&self.core.state);
        QueueSummary::from_jobs(state.jobs.values(), unix_time_ms())
    }

    pub fn status(&self) -> QueueStatus {
        let pending = lock(&self.core.state)
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count();
        QueueStatus {
            running: self.core.running.load(Ordering::SeqCst),
            paused: self.core.paused.load(Ordering::SeqCst),
            pending_jobs: pending,
            inflight_jobs: self.core.inflight.load(Ordering::SeqCst),
        }
    }
}

async fn coordinator_loop(core: Arc<Core>) {
    loop {
        if !core.running.load(Ordering::SeqCst) {
            break;
        }
        if core.paused.load(Ordering::SeqCst) {
            wait_for_wake(&core).await;
            continue;
        }

        while core.inflight.load(Ordering::SeqCst) < core.cfg.max_concurrent_jobs {
            let Some(job_id) = claim_next_pending(&core) else {
                break;
            };
            dispatch(&core, job_id);
        }

        maybe_emit_queue_empty(&core);
        wait_for_wake(&core).await;
    }
}

async fn wait_for_wake(core: &Arc<Core>) {
    tokio::select! {
        _ = core.wake.notified() => {}
        _ = tokio::time::sleep(core.cfg.poll_interval) => {}
    }
}

/// Pick the next pending job, highest priority first and earliest arrival
/// within a priority, and move it to Preparing so it cannot be claimed twice.
fn claim_next_pending(core: &Arc<Core>) -> Option<JobId> {
    let claimed = {
        let mut state = lock(&core.state);
        let job_id = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| {
                (
                    std::cmp::Reverse(j.priority),
                    state.arrival.get(&j.id).copied().unwrap_or(u64::MAX),
                )
            })
            .map(|j| j.id.clone())?;
        let job = state.jobs.get_mut(&job_id)?;
        if job
            .transition(JobStatus::Preparing, None, unix_time_ms())
            .is_err()
        {
            return None;
        }
        job.clone()
    };
    persist(core, &claimed);
    Some(claimed.id)
}

fn maybe_emit_queue_empty(core: &Arc<Core>) {
    let pending = lock(&core.state)
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Pending)
        .count();
    core.metrics.pending_jobs.set(pending as u64);
    if pending == 0
        && core.inflight.load(Ordering::SeqCst) == 0
        && core.pending_retries.load(Ordering::SeqCst) == 0
        && !core.queue_empty_emitted.swap(true, Ordering::SeqCst)
    {
        let _ = core.events.send(QueueEvent::QueueEmpty);
        info!(event = "queue_empty", "queue drained");
    }
}

fn dispatch(core: &Arc<Core>, job_id: JobId) {
    core.inflight.fetch_add(1, Ordering::SeqCst);
    let now = core.metrics.inflight_jobs.add(1);
    core.metrics.inflight_jobs_high_water.max(now);
    let core = core.clone();
    tokio::spawn(async move {
        if let Err(err) = run_job(&core, &job_id).await {
            warn!(event = "job_dispatch_error", job_id = %job_id, error = %err, "dispatch failed");
        }
        core.inflight.fetch_sub(1, Ordering::SeqCst);
        core.metrics.inflight_jobs.sub(1);
        core.wake.notify_one();
    });
}

async fn run_job(core: &Arc<Core>, job_id: &JobId) -> Result<(), QueueError> {
    let _timer = ScopedTimer::new(&core.metrics.job_duration);
    let now = unix_time_ms();
    let (job_snapshot, cancel_flag, pause_flag) = {
        let mut state = lock(&core.state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        job.transition(JobStatus::Processing, None, now)?;
        let snapshot = job.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let pause = Arc::new(AtomicBool::new(false));
        state.cancel_flags.insert(job_id.clone(), cancel.clone());
        state.pause_flags.insert(job_id.clone(), pause.clone());
        (snapshot, cancel, pause)
    };
    persist(core, &job_snapshot);
    let _ = core.events.send(QueueEvent::JobStarted {
        job_id: job_id.clone(),
    });
    info!(event = "job_started", job_id = %job_id, "job started");

    let ctx = JobContext::new(
        job_id.clone(),
        cancel_flag.clone(),
        pause_flag.clone(),
        core.events.clone(),
    );
    let result = core.processor.run(&job_snapshot, ctx).await;

    let now = unix_time_ms();
    let mut will_retry = false;
    let final_job = {
        let mut state = lock(&core.state);
        state.cancel_flags.remove(job_id);
        state.pause_flags.remove(job_id);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        if cancel_flag.load(Ordering::Relaxed) {
            job.transition(JobStatus::Cancelled, None, now)?;
        } else {
            match &result {
                // Cancel outranks pause; a real failure outranks both.
                Ok(()) if pause_flag.load(Ordering::Relaxed) => {
                    job.transition(JobStatus::Paused, None, now)?
                }
                Ok(()) => job.transition(JobStatus::Completed, None, now)?,
                Err(err) => {
                    job.transition(JobStatus::Failed, Some(err.message.clone()), now)?;
                    will_retry = job.can_retry();
                }
            }
        }
        job.clone()
    };
    persist(core, &final_job);

    match final_job.status {
        JobStatus::Paused => {
            info!(event = "job_paused", job_id = %job_id, "job paused");
        }
        JobStatus::Cancelled => {
            core.metrics.jobs_cancelled_total.inc();
            let _ = core.events.send(QueueEvent::JobCancelled {
                job_id: job_id.clone(),
            });
            info!(event = "job_cancelled", job_id = %job_id, "job cancelled");
        }
        JobStatus::Completed => {
            core.metrics.jobs_completed_total.inc();
            let _ = core.events.send(QueueEvent::JobCompleted {
                job_id: job_id.clone(),
            });
            info!(event = "job_completed", job_id = %job_id, "job completed");
        }
        JobStatus::Failed => {
            core.metrics.jobs_failed_total.inc();
            let error = final_job.error_message.clone().unwrap_or_default();
            let _ = core.events.send(QueueEvent::JobFailed {
                job_id: job_id.clone(),
                error: error.clone(),
                will_retry,
            });
            warn!(
                event = "job_failed",
                job_id = %job_id,
                error = %error,
                will_retry = will_retry,
                "job failed"
            );
            if will_retry {
                core.pending_retries.fetch_add(1, Ordering::SeqCst);
                let core = core.clone();
                let job_id = job_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(core.cfg.retry_delay).await;
                    if let Err(err) = retry_inner(&core, &job_id) {
                        warn!(
                            event = "job_auto_retry_failed",
                            job_id = %job_id,
                            error = %err,
                            "auto retry failed"
                        );
                    }
                    core.pending_retries.fetch_sub(1, Ordering::SeqCst);
                    core.wake.notify_one();
                });
            }
        }
        _ => {}
    }

    Ok(())
}

fn retry_inner(core: &Arc<Core>, job_id: &JobId) -> Result<(), QueueError> {
    let job = {
        let mut state = lock(&core.state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::WrongStatus {
                job_id: job_id.clone(),
                status: job.status,
                required: JobStatus::Failed,
            });
        }
        job.retry(unix_time_ms())?;
        job.clone()
    };
    persist(core, &job);
    core.queue_empty_emitted.store(false, Ordering::Relaxed);
    core.metrics.retries_total.inc();
    core.wake.notify_one();
    info!(
        event = "job_retried",
        job_id = %job_id,
        retry_count = job.retry_count,
        "job requeued"
    );
    Ok(())
}

// Store writes are best-effort; in-memory state stays authoritative until the
// next successful write.
fn persist(core: &Arc<Core>, job: &BatchJob) {
    if let Err(err) = core.store.update(job) {
        warn!(
            event = "store_write_failed",
            job_id = %job.id,
            status = ?job.status,
            error = %err,
            "failed to persist job"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
