use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use babel_core::types::{BatchJob, JobId};
use tokio::sync::broadcast;

use crate::events::QueueEvent;

/// A job-level failure surfaced by a processor. Drives the queue's automatic
/// retry while the job's retry budget lasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

/// Handle given to a running job. Carries the cooperative cancel and pause
/// flags and a progress reporting path back onto the queue's event channel.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<QueueEvent>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        cancelled: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        Self {
            job_id,
            cancelled,
            paused,
            events,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Processors must poll this at unit boundaries and return promptly once
    /// it reads true. The queue never interrupts a job mid-unit.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Like [`is_cancelled`](Self::is_cancelled), but the processor should
    /// return `Ok` with its partial work checkpointed; the job parks in
    /// `Paused` until resumed.
    pub fn is_pause_requested(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn report_progress(&self, percent: f64) {
        let _ = self.events.send(QueueEvent::JobProgress {
            job_id: self.job_id.clone(),
            percent,
        });
    }
}

/// Execution interface consumed by the queue. Wraps the whole translation of
/// one document; internally it typically drives a scheduler, a streaming
/// translator and a checkpoint manager.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn run(&self, job: &BatchJob, ctx: JobContext) -> Result<(), JobError>;
}
