#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! End-to-end demo: a queue of synthetic translation jobs driven through the
//! scheduler, the concurrency tuner and the checkpoint manager.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tracing::info;

use babel_checkpoint::{CheckpointConfig, CheckpointManager};
use babel_core::types::{BatchJob, ChunkId, JobPriority, TaskId};
use babel_job_store::fs::FsJobStore;
use babel_queue::events::QueueEvent;
use babel_queue::queue::{BatchQueue, QueueConfig};
use babel_queue::worker::{JobContext, JobError, JobProcessor};
use babel_runtime::processor::{TaskFailure, TaskProcessor};
use babel_runtime::scheduler::{
    BatchConfig, BatchStrategy, ScheduledTask, SmartBatchScheduler,
};
use babel_runtime::tuner::{AdaptiveConcurrencyTuner, TuningConfig};

#[derive(Debug, Parser)]
#[command(name = "babel-batch-demo")]
struct Args {
    /// Number of synthetic jobs to enqueue.
    #[arg(long, env = "BABEL_DEMO_JOBS", default_value_t = 4)]
    jobs: usize,

    /// Chunks per synthetic job.
    #[arg(long, env = "BABEL_DEMO_CHUNKS_PER_JOB", default_value_t = 24)]
    chunks_per_job: usize,

    /// Concurrent jobs dispatched by the queue.
    #[arg(long, env = "BABEL_MAX_CONCURRENT_JOBS", default_value_t = 2)]
    max_concurrent_jobs: usize,

    /// Root directory for the FS job store.
    #[arg(long, env = "BABEL_JOB_STORE_ROOT", default_value = "/tmp/babel/jobs")]
    store_root: PathBuf,

    /// Root directory for checkpoints.
    #[arg(
        long,
        env = "BABEL_CHECKPOINT_ROOT",
        default_value = "/tmp/babel/checkpoints"
    )]
    checkpoint_root: PathBuf,

    /// Probability that one synthetic chunk translation fails.
    #[arg(long, env = "BABEL_DEMO_FAIL_RATIO", default_value_t = 0.05)]
    fail_ratio: f64,

    /// Simulated per-chunk latency upper bound.
    #[arg(long, env = "BABEL_DEMO_CHUNK_LATENCY_MS", default_value_t = 20)]
    chunk_latency_ms: u64,
}

/// Pretends to translate one chunk: sleeps a little and fails at the
/// configured ratio.
struct SyntheticTranslator {
    fail_ratio: f64,
    latency_ms: u64,
}

#[async_trait]
impl TaskProcessor<String> for SyntheticTranslator {
    type Output = String;

    async fn process(&self, task: &ScheduledTask<String>) -> Result<String, TaskFailure> {
        let delay = rand::thread_rng().gen_range(1..=self.latency_ms.max(1));
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if rand::thread_rng().gen_bool(self.fail_ratio) {
            return Err(TaskFailure::new("synthetic provider error"));
        }
        Ok(format!("translated: {}", task.payload))
    }
}

/// Runs one job through the adaptive scheduler and writes its checkpoints.
struct DemoProcessor {
    checkpoints: Arc<CheckpointManager>,
    chunks_per_job: usize,
    fail_ratio: f64,
    chunk_latency_ms: u64,
}

#[async_trait]
impl JobProcessor for DemoProcessor {
    async fn run(&self, job: &BatchJob, ctx: JobContext) -> Result<(), JobError> {
        let chunk_ids: Vec<ChunkId> = (0..self.chunks_per_job)
            .map(|i| ChunkId(format!("{}_chunk_{i:04}", job.id)))
            .collect();

        let tuner = AdaptiveConcurrencyTuner::new(TuningConfig::default())
            .map_err(|e| JobError::new(e.to_string()))?;
        let scheduler = SmartBatchScheduler::new(
            BatchConfig {
                strategy: BatchStrategy::Adaptive,
                ..BatchConfig::default()
            },
            Arc::new(SyntheticTranslator {
                fail_ratio: self.fail_ratio,
                latency_ms: self.chunk_latency_ms,
            }),
            Some(Arc::new(Mutex::new(tuner))),
        )
        .map_err(|e| JobError::new(e.to_string()))?;

        scheduler.add_tasks(chunk_ids.iter().map(|c| {
            ScheduledTask::new(
                TaskId(c.0.clone()),
                job.priority,
                format!("source text for {c}"),
            )
        }));

        let outcome = scheduler
            .process_all()
            .await
            .map_err(|e| JobError::new(e.to_string()))?;

        if ctx.is_cancelled() {
            let completed: Vec<ChunkId> = outcome
                .completed
                .iter()
                .map(|(id, _)| ChunkId(id.0.clone()))
                .collect();
            let pending: Vec<ChunkId> = chunk_ids
                .iter()
                .filter(|c| !completed.iter().any(|d| d == *c))
                .cloned()
                .collect();
            self.checkpoints
                .cancel_job(&job.id, completed, pending, BTreeMap::new(), BTreeMap::new())
                .map_err(|e| JobError::new(e.to_string()))?;
            return Ok(());
        }

        if !outcome.permanently_failed.is_empty() {
            return Err(JobError::new(format!(
                "{} chunks failed permanently",
                outcome.permanently_failed.len()
            )));
        }

        let mut results = BTreeMap::new();
        let mut completed = Vec::with_capacity(outcome.completed.len());
        for (task_id, text) in outcome.completed {
            let chunk_id = ChunkId(task_id.0);
            results.insert(chunk_id.clone(), text);
            completed.push(chunk_id);
        }
        ctx.report_progress(100.0);
        self.checkpoints
            .mark_completed(&job.id, completed, results, BTreeMap::new())
            .map_err(|e| JobError::new(e.to_string()))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    babel_observe::logging::init_tracing();
    let args = Args::parse();

    let store = Arc::new(FsJobStore::open(&args.store_root)?);
    let checkpoints = Arc::new(CheckpointManager::new(
        &args.checkpoint_root,
        CheckpointConfig::default(),
    )?);
    let processor = Arc::new(DemoProcessor {
        checkpoints: checkpoints.clone(),
        chunks_per_job: args.chunks_per_job,
        fail_ratio: args.fail_ratio,
        chunk_latency_ms: args.chunk_latency_ms,
    });

    let queue = BatchQueue::new(
        QueueConfig {
            max_concurrent_jobs: args.max_concurrent_jobs,
            retry_delay: Duration::from_millis(500),
            ..QueueConfig::default()
        },
        store,
        processor,
    )?;

    let mut events = queue.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                QueueEvent::QueueEmpty => {
                    info!(event = "demo_queue_empty", "all jobs drained");
                    break;
                }
                other => info!(queue_event = ?other, "queue event"),
            }
        }
    });

    let priorities = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Urgent,
    ];
    for i in 0..args.jobs {
        let priority = priorities[i % priorities.len()];
        let id = queue.add_job(&format!("demo-document-{i}"), priority)?;
        info!(job_id = %id, priority = ?priority, "enqueued demo job");
    }

    queue.start();
    event_logger.await?;
    queue.stop().await;

    let summary = queue.summary();
    info!(
        total_jobs = summary.total_jobs,
        completed = summary.completed_jobs,
        failed = summary.failed_jobs,
        total_cost_usd = summary.total_cost_usd,
        "demo finished"
    );

    let stats = checkpoints.get_statistics()?;
    info!(
        checkpoints = stats.total_checkpoints,
        completion = stats.completion,
        bytes = stats.total_bytes,
        "checkpoint statistics"
    );

    Ok(())
}
