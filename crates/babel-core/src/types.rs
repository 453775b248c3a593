use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dispatch priority. Higher values are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Job lifecycle states.
///
/// Legal transitions:
/// - Pending -> Preparing -> Processing -> {Paused, Completed, Failed, Cancelled}
/// - Preparing -> Failed (claimed but interrupted before processing started)
/// - Paused -> Pending
/// - Failed -> Pending (retry only; Completed/Cancelled are absorbing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Preparing,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Preparing, Processing)
                | (Preparing, Failed)
                | (Processing, Paused)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Paused, Pending)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Preparing => "preparing",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal job transition {from} -> {to}")]
    Illegal { from: JobStatus, to: JobStatus },
    #[error("retries exhausted ({retry_count}/{max_retries})")]
    RetriesExhausted { retry_count: u32, max_retries: u32 },
}

/// Raw progress counters for one job.
///
/// Percentages, rates, and ETAs are always derived from these counters; they
/// are never stored alongside them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub failed_chunks: u64,
    pub current_chunk: u64,
    /// Unix milliseconds; set on the first Processing transition.
    pub started_at_ms: Option<u64>,
    /// Unix milliseconds; set on the terminal transition.
    pub completed_at_ms: Option<u64>,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl JobProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.completed_chunks as f64 / self.total_chunks as f64) * 100.0
    }

    pub fn elapsed_secs(&self, now_ms: u64) -> f64 {
        let Some(start) = self.started_at_ms else {
            return 0.0;
        };
        let end = self.completed_at_ms.unwrap_or(now_ms);
        end.saturating_sub(start) as f64 / 1000.0
    }

    pub fn chunks_per_minute(&self, now_ms: u64) -> f64 {
        let elapsed = self.elapsed_secs(now_ms);
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.completed_chunks as f64 / elapsed) * 60.0
    }

    pub fn estimated_remaining_secs(&self, now_ms: u64) -> f64 {
        if self.completed_chunks == 0 {
            return 0.0;
        }
        let per_chunk = self.elapsed_secs(now_ms) / self.completed_chunks as f64;
        let remaining = self.total_chunks.saturating_sub(self.completed_chunks);
        per_chunk * remaining as f64
    }
}

/// One unit of queued work: a document translation job.
///
/// Owned by the queue until terminal; all status mutation goes through
/// [`BatchJob::transition`] so the lifecycle DAG cannot be bypassed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobId,
    pub name: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub output_path: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl BatchJob {
    pub fn new(id: JobId, name: impl Into<String>, priority: JobPriority, now_ms: u64) -> Self {
        Self {
            id,
            name: name.into(),
            priority,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            output_path: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move the job to `next`, stamping timestamps and the error message.
    ///
    /// Rejects anything outside the lifecycle DAG.
    pub fn transition(
        &mut self,
        next: JobStatus,
        error: Option<String>,
        now_ms: u64,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at_ms = now_ms;

        if next == JobStatus::Processing && self.progress.started_at_ms.is_none() {
            self.progress.started_at_ms = Some(now_ms);
        }
        if matches!(
            next,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        ) {
            self.progress.completed_at_ms = Some(now_ms);
        }
        if next == JobStatus::Pending {
            // A retried or resumed job gets a fresh terminal stamp later.
            self.progress.completed_at_ms = None;
        }
        if let Some(err) = error {
            self.error_message = Some(err);
        }
        Ok(())
    }

    /// Requeue a failed job for another attempt.
    pub fn retry(&mut self, now_ms: u64) -> Result<(), TransitionError> {
        if !self.can_retry() {
            return Err(TransitionError::RetriesExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.transition(JobStatus::Pending, None, now_ms)?;
        self.retry_count += 1;
        self.error_message = None;
        Ok(())
    }

    /// Record chunk-level progress. Counters only; derived metrics come from
    /// [`JobProgress`].
    pub fn record_chunk(&mut self, completed: u64, failed: u64, current: u64, now_ms: u64) {
        self.progress.completed_chunks = completed;
        self.progress.failed_chunks = failed;
        self.progress.current_chunk = current;
        self.updated_at_ms = now_ms;
    }

    pub fn record_usage(&mut self, tokens: u64, cost_usd: f64, now_ms: u64) {
        self.progress.tokens_used = self.progress.tokens_used.saturating_add(tokens);
        self.progress.cost_usd += cost_usd;
        self.updated_at_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(JobPriority::Urgent > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn serde_round_trips_status() {
        let s = serde_json::to_string(&JobStatus::Preparing).unwrap();
        assert_eq!(s, "\"preparing\"");
        let back: JobStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, JobStatus::Preparing);
    }
}
