use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `BABEL_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for the scheduling core:
/// - Always include `job_id` on any job lifecycle event.
/// - Include `batch_id` on scheduler batch events and `task_id` on task outcomes.
/// - Include `checkpoint_id` on checkpoint create/resume/prune events.
/// - Include `chunk_index` on streaming events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("BABEL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
