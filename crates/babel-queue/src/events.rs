use babel_core::types::JobId;

/// Lifecycle events emitted by the queue on a broadcast channel.
///
/// Observers subscribe via [`crate::queue::BatchQueue::subscribe`]; the queue
/// never blocks on slow subscribers, lagging receivers simply miss events.
/// `QueueEmpty` is edge-triggered: it fires once when the last in-flight job
/// finishes with nothing left to dispatch, and re-arms when new work arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobStarted {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        percent: f64,
    },
    JobCompleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        error: String,
        will_retry: bool,
    },
    JobCancelled {
        job_id: JobId,
    },
    QueueEmpty,
}
