use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use babel_core::types::{JobPriority, TaskId};
use babel_observe::metrics::{Counter, DurationAgg};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::processor::{TaskFailure, TaskProcessor};
use crate::tuner::AdaptiveConcurrencyTuner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    Fixed,
    Dynamic,
    Adaptive,
    LatencyOptimized,
    ThroughputOptimized,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub strategy: BatchStrategy,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Fraction of the backoff delay used as symmetric jitter, in [0, 1).
    pub retry_jitter: f64,
    /// When false, batches are cut in plain arrival order.
    pub priority_enabled: bool,
    /// Bound on the trailing [`BatchResult`] history.
    pub history_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Adaptive,
            min_batch_size: 1,
            max_batch_size: 20,
            initial_batch_size: 5,
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_jitter: 0.2,
            priority_enabled: true,
            history_size: 50,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.min_batch_size >= 1, "min_batch_size must be >= 1");
        anyhow::ensure!(
            self.min_batch_size <= self.max_batch_size,
            "min_batch_size {} exceeds max_batch_size {}",
            self.min_batch_size,
            self.max_batch_size
        );
        anyhow::ensure!(
            (self.min_batch_size..=self.max_batch_size).contains(&self.initial_batch_size),
            "initial_batch_size {} outside [{}, {}]",
            self.initial_batch_size,
            self.min_batch_size,
            self.max_batch_size
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.retry_jitter),
            "retry_jitter must be in [0, 1)"
        );
        anyhow::ensure!(self.history_size >= 1, "history_size must be >= 1");
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScheduledTask<P> {
    pub task_id: TaskId,
    pub priority: JobPriority,
    pub retry_count: u32,
    pub payload: P,
}

impl<P> ScheduledTask<P> {
    pub fn new(task_id: TaskId, priority: JobPriority, payload: P) -> Self {
        Self {
            task_id,
            priority,
            retry_count: 0,
            payload,
        }
    }
}

/// Outcome of one executed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub batch_size: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl BatchResult {
    pub fn success_rate(&self) -> f64 {
        if self.batch_size == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.batch_size as f64
    }
}

/// Fully-drained run: every submitted task lands in exactly one of the two
/// buckets.
#[derive(Debug)]
pub struct SchedulerOutcome<T> {
    pub completed: Vec<(TaskId, T)>,
    pub permanently_failed: Vec<(TaskId, TaskFailure)>,
}

impl<T> SchedulerOutcome<T> {
    fn new() -> Self {
        Self {
            completed: Vec::new(),
            permanently_failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub total_completed: u64,
    pub total_failed_permanently: u64,
    pub batches_processed: u64,
    pub current_batch_size: usize,
    pub error_counts: HashMap<String, u64>,
}

#[derive(Default)]
struct StatsInner {
    total_completed: u64,
    total_failed_permanently: u64,
    batches_processed: u64,
    error_counts: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub tasks_completed_total: Counter,
    pub tasks_failed_total: Counter,
    pub retries_total: Counter,
    pub batches_total: Counter,
    pub batch_duration: DurationAgg,
}

/// Priority-aware batch scheduler with strategy-driven sizing and jittered
/// exponential retry backoff.
///
/// Tasks failing a batch are parked in a retry pool; once the pending list is
/// drained, the pool is replayed as retry rounds. Each retried task sleeps
/// its own backoff inside its execution slot, so one slow backoff never
/// delays the rest of the cohort.
pub struct SmartBatchScheduler<P, Proc>
where
    P: Send + Sync + 'static,
    Proc: TaskProcessor<P>,
{
    cfg: BatchConfig,
    processor: Arc<Proc>,
    tuner: Option<Arc<Mutex<AdaptiveConcurrencyTuner>>>,
    pending: Mutex<Vec<ScheduledTask<P>>>,
    retry_pool: Mutex<Vec<ScheduledTask<P>>>,
    history: Mutex<VecDeque<BatchResult>>,
    current_batch_size: AtomicUsize,
    prev_success_rate: Mutex<Option<f64>>,
    stopping: AtomicBool,
    stats: Mutex<StatsInner>,
    metrics: Arc<SchedulerMetrics>,
}

impl<P, Proc> SmartBatchScheduler<P, Proc>
where
    P: Send + Sync + 'static,
    Proc: TaskProcessor<P>,
{
    pub fn new(
        cfg: BatchConfig,
        processor: Arc<Proc>,
        tuner: Option<Arc<Mutex<AdaptiveConcurrencyTuner>>>,
    ) -> Result<Self> {
        cfg.validate()?;
        let initial = cfg.initial_batch_size;
        Ok(Self {
            cfg,
            processor,
            tuner,
            pending: Mutex::new(Vec::new()),
            retry_pool: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            current_batch_size: AtomicUsize::new(initial),
            prev_success_rate: Mutex::new(None),
            stopping: AtomicBool::new(false),
            stats: Mutex::new(StatsInner::default()),
            metrics: Arc::new(SchedulerMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    pub fn add_task(&self, task: ScheduledTask<P>) {
        lock(&self.pending).push(task);
    }

    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = ScheduledTask<P>>) {
        lock(&self.pending).extend(tasks);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_batch_size.load(Ordering::Relaxed)
    }

    /// Stop after the batch currently in flight. Remaining tasks stay queued.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    /// Trailing [`BatchResult`]s, oldest first, bounded by `history_size`.
    pub fn recent_batches(&self) -> Vec<BatchResult> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn reset(&self) {
        lock(&self.pending).clear();
        lock(&self.retry_pool).clear();
        lock(&self.history).clear();
        *lock(&self.prev_success_rate) = None;
        *lock(&self.stats) = StatsInner::default();
        self.current_batch_size
            .store(self.cfg.initial_batch_size, Ordering::Relaxed);
        self.stopping.store(false, Ordering::Relaxed);
        if let Some(tuner) = &self.tuner {
            lock(tuner).reset();
        }
    }

    pub fn get_statistics(&self) -> SchedulerStats {
        let inner = lock(&self.stats);
        SchedulerStats {
            total_completed: inner.total_completed,
            total_failed_permanently: inner.total_failed_permanently,
            batches_processed: inner.batches_processed,
            current_batch_size: self.current_batch_size(),
            error_counts: inner.error_counts.clone(),
        }
    }

    /// Run batches until the pending list and the retry pool are both empty
    /// (or `stop` is called). Every submitted task ends in exactly one
    /// outcome bucket.
    pub async fn process_all(&self) -> Result<SchedulerOutcome<Proc::Output>> {
        let mut outcome = SchedulerOutcome::new();

        loop {
            if self.stopping.load(Ordering::Relaxed) {
                break;
            }

            let batch = {
                let batch = self.next_pending_batch();
                if !batch.is_empty() {
                    batch
                } else {
                    // Pending drained. Replay the whole retry pool as one
                    // round; each task sleeps its own backoff concurrently.
                    let retries = std::mem::take(&mut *lock(&self.retry_pool));
                    if retries.is_empty() {
                        break;
                    }
                    retries
                }
            };

            let result = self.execute_batch(batch, &mut outcome).await?;
            self.adjust_batch_size(&result);
            {
                let mut history = lock(&self.history);
                history.push_back(result.clone());
                while history.len() > self.cfg.history_size {
                    history.pop_front();
                }
            }

            info!(
                event = "batch_completed",
                batch_size = result.batch_size,
                succeeded = result.succeeded,
                failed = result.failed,
                duration_ms = result.duration.as_millis() as u64,
                next_batch_size = self.current_batch_size(),
                "batch completed"
            );
        }

        Ok(outcome)
    }

    fn next_pending_batch(&self) -> Vec<ScheduledTask<P>> {
        let mut pending = lock(&self.pending);
        if self.cfg.priority_enabled {
            // Stable sort keeps arrival order within a priority.
            pending.sort_by_key(|t| std::cmp::Reverse(t.priority));
        }
        let n = self.current_batch_size().min(pending.len());
        pending.drain(..n).collect()
    }

    async fn execute_batch(
        &self,
        batch: Vec<ScheduledTask<P>>,
        outcome: &mut SchedulerOutcome<Proc::Output>,
    ) -> Result<BatchResult> {
        let batch_size = batch.len();
        let started = Instant::now();
        let mut joinset = JoinSet::new();

        for task in batch {
            let processor = self.processor.clone();
            let backoff = self.backoff_delay(task.retry_count);
            joinset.spawn(async move {
                if let Some(delay) = backoff {
                    tokio::time::sleep(delay).await;
                }
                let task_started = Instant::now();
                let res = processor.process(&task).await;
                (task, res, task_started.elapsed())
            });
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = joinset.join_next().await {
            let (mut task, res, latency) = joined.map_err(anyhow::Error::from)?;

            if let Some(tuner) = &self.tuner {
                lock(tuner).record_task_completion(latency, res.is_ok());
            }

            match res {
                Ok(output) => {
                    succeeded += 1;
                    lock(&self.stats).total_completed += 1;
                    self.metrics.tasks_completed_total.inc();
                    outcome.completed.push((task.task_id, output));
                }
                Err(failure) => {
                    failed += 1;
                    self.metrics.tasks_failed_total.inc();
                    task.retry_count += 1;
                    if task.retry_count <= self.cfg.max_retries {
                        self.metrics.retries_total.inc();
                        warn!(
                            event = "task_retry_queued",
                            task_id = %task.task_id,
                            retry_count = task.retry_count,
                            error = %failure,
                            "task failed, queued for retry"
                        );
                        lock(&self.retry_pool).push(task);
                    } else {
                        warn!(
                            event = "task_failed_permanently",
                            task_id = %task.task_id,
                            retry_count = task.retry_count,
                            error = %failure,
                            "task failed permanently"
                        );
                        let mut stats = lock(&self.stats);
                        stats.total_failed_permanently += 1;
                        *stats.error_counts.entry(failure.message.clone()).or_insert(0) += 1;
                        drop(stats);
                        outcome.permanently_failed.push((task.task_id, failure));
                    }
                }
            }
        }

        lock(&self.stats).batches_processed += 1;
        let duration = started.elapsed();
        self.metrics.batches_total.inc();
        self.metrics.batch_duration.record(duration);

        Ok(BatchResult {
            batch_size,
            succeeded,
            failed,
            duration,
        })
    }

    /// Exponential backoff with symmetric jitter. First attempts carry no
    /// delay.
    fn backoff_delay(&self, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 {
            return None;
        }
        let base = self.cfg.base_retry_delay.as_secs_f64();
        let exp = base * 2f64.powi(retry_count.min(30) as i32);
        let capped = exp.min(self.cfg.max_retry_delay.as_secs_f64());
        let jitter = self.cfg.retry_jitter;
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Some(Duration::from_secs_f64(capped * factor))
    }

    fn adjust_batch_size(&self, result: &BatchResult) {
        let (min, max) = (self.cfg.min_batch_size, self.cfg.max_batch_size);
        let current = self.current_batch_size();
        let next = match self.cfg.strategy {
            BatchStrategy::Fixed => current,
            BatchStrategy::LatencyOptimized => min,
            BatchStrategy::ThroughputOptimized => max,
            BatchStrategy::Dynamic => {
                let rate = result.success_rate();
                let mut prev = lock(&self.prev_success_rate);
                let next = match *prev {
                    Some(p) if rate < p * 0.8 => {
                        ((current as f64 * 0.75).floor() as usize).max(min)
                    }
                    Some(p) if rate > p => (current + 2).min(max),
                    _ => current,
                };
                *prev = Some(rate);
                next
            }
            BatchStrategy::Adaptive => match &self.tuner {
                Some(tuner) => lock(tuner).get_optimal_concurrency().clamp(min, max),
                None => current,
            },
        };
        self.current_batch_size.store(next, Ordering::Relaxed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
