use async_trait::async_trait;

use crate::scheduler::ScheduledTask;

/// A task failure surfaced by a processor. The scheduler treats every failure
/// as retryable until the task's retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TaskFailure {}

/// Execution interface for `babel-runtime`.
///
/// Supplied by the caller and wraps whatever does the actual work (an LLM
/// call, a page-translation step). Retries may duplicate side effects; the
/// processor must tolerate that.
#[async_trait]
pub trait TaskProcessor<P: Send + Sync + 'static>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn process(&self, task: &ScheduledTask<P>) -> Result<Self::Output, TaskFailure>;
}
