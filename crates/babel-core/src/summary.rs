use serde::{Deserialize, Serialize};

use crate::types::{BatchJob, JobStatus};

/// Aggregate view over a set of jobs (queued, in flight, and stored).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total_jobs: u64,
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub paused_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,

    pub total_chunks: u64,
    pub completed_chunks: u64,

    pub total_cost_usd: f64,
    pub estimated_remaining_secs: f64,
}

impl QueueSummary {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a BatchJob>, now_ms: u64) -> Self {
        let mut summary = QueueSummary::default();
        for job in jobs {
            summary.total_jobs += 1;
            match job.status {
                JobStatus::Pending => summary.pending_jobs += 1,
                JobStatus::Preparing | JobStatus::Processing => summary.processing_jobs += 1,
                JobStatus::Paused => summary.paused_jobs += 1,
                JobStatus::Completed => summary.completed_jobs += 1,
                JobStatus::Failed => summary.failed_jobs += 1,
                JobStatus::Cancelled => summary.cancelled_jobs += 1,
            }

            summary.total_chunks += job.progress.total_chunks;
            summary.completed_chunks += job.progress.completed_chunks;
            summary.total_cost_usd += job.progress.cost_usd;
            if !job.status.is_terminal() {
                summary.estimated_remaining_secs += job.progress.estimated_remaining_secs(now_ms);
            }
        }
        summary
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.completed_chunks as f64 / self.total_chunks as f64) * 100.0
    }
}
