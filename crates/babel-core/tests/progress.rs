use babel_core::summary::QueueSummary;
use babel_core::types::{BatchJob, JobId, JobPriority, JobProgress, JobStatus};

#[test]
fn percent_complete_is_derived() {
    let p = JobProgress {
        total_chunks: 20,
        completed_chunks: 5,
        ..JobProgress::default()
    };
    assert!((p.percent_complete() - 25.0).abs() < f64::EPSILON);

    let empty = JobProgress::default();
    assert_eq!(empty.percent_complete(), 0.0);
}

#[test]
fn eta_scales_with_completion_rate() {
    let p = JobProgress {
        total_chunks: 10,
        completed_chunks: 5,
        started_at_ms: Some(0),
        ..JobProgress::default()
    };
    // 5 chunks in 10s -> 2s per chunk -> 10s remaining.
    let eta = p.estimated_remaining_secs(10_000);
    assert!((eta - 10.0).abs() < 1e-9);
    assert!((p.chunks_per_minute(10_000) - 30.0).abs() < 1e-9);
}

#[test]
fn elapsed_freezes_at_completion() {
    let p = JobProgress {
        started_at_ms: Some(1_000),
        completed_at_ms: Some(4_000),
        ..JobProgress::default()
    };
    assert!((p.elapsed_secs(999_999) - 3.0).abs() < 1e-9);
}

#[test]
fn summary_counts_by_status() {
    let now = 5_000;
    let mut jobs = Vec::new();
    for (i, status) in [
        JobStatus::Pending,
        JobStatus::Pending,
        JobStatus::Completed,
        JobStatus::Failed,
    ]
    .iter()
    .enumerate()
    {
        let mut j = BatchJob::new(
            JobId(format!("j{i}")),
            format!("doc-{i}"),
            JobPriority::Normal,
            0,
        );
        j.status = *status;
        j.progress.total_chunks = 10;
        j.progress.completed_chunks = if *status == JobStatus::Completed { 10 } else { 2 };
        jobs.push(j);
    }

    let summary = QueueSummary::from_jobs(jobs.iter(), now);
    assert_eq!(summary.total_jobs, 4);
    assert_eq!(summary.pending_jobs, 2);
    assert_eq!(summary.completed_jobs, 1);
    assert_eq!(summary.failed_jobs, 1);
    assert_eq!(summary.total_chunks, 40);
    assert_eq!(summary.completed_chunks, 16);
    assert!((summary.percent_complete() - 40.0).abs() < 1e-9);
}
