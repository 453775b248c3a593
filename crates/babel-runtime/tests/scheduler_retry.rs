use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use babel_core::types::{JobPriority, TaskId};
use babel_runtime::processor::{TaskFailure, TaskProcessor};
use babel_runtime::scheduler::{
    BatchConfig, BatchStrategy, ScheduledTask, SmartBatchScheduler,
};

fn task(id: &str, priority: JobPriority) -> ScheduledTask<String> {
    ScheduledTask::new(TaskId(id.to_string()), priority, format!("payload {id}"))
}

fn fast_cfg(strategy: BatchStrategy, batch: usize, max_retries: u32) -> BatchConfig {
    BatchConfig {
        strategy,
        min_batch_size: 1,
        max_batch_size: 20,
        initial_batch_size: batch,
        max_retries,
        base_retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(10),
        retry_jitter: 0.0,
        ..BatchConfig::default()
    }
}

/// Fails each task a configured number of times, then succeeds.
struct FlakyProcessor {
    fail_times: u32,
    attempts: Mutex<HashMap<TaskId, u32>>,
}

impl FlakyProcessor {
    fn new(fail_times: u32) -> Self {
        Self {
            fail_times,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts_for(&self, id: &TaskId) -> u32 {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TaskProcessor<String> for FlakyProcessor {
    type Output = String;

    async fn process(&self, task: &ScheduledTask<String>) -> Result<String, TaskFailure> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(task.task_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.fail_times {
            Err(TaskFailure::new("transient upstream error"))
        } else {
            Ok(format!("done {}", task.task_id))
        }
    }
}

/// Records dispatch order.
struct RecordingProcessor {
    order: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl TaskProcessor<String> for RecordingProcessor {
    type Output = ();

    async fn process(&self, task: &ScheduledTask<String>) -> Result<(), TaskFailure> {
        self.order.lock().unwrap().push(task.task_id.clone());
        Ok(())
    }
}

/// Succeeds or fails by task priority, for driving batch-size adjustment.
struct PriorityGatedProcessor;

#[async_trait]
impl TaskProcessor<String> for PriorityGatedProcessor {
    type Output = ();

    async fn process(&self, task: &ScheduledTask<String>) -> Result<(), TaskFailure> {
        if task.priority == JobPriority::Low {
            Err(TaskFailure::new("rejected"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn flaky_tasks_eventually_complete() {
    let processor = Arc::new(FlakyProcessor::new(2));
    let scheduler =
        SmartBatchScheduler::new(fast_cfg(BatchStrategy::Fixed, 4, 3), processor.clone(), None)
            .unwrap();

    for i in 0..10 {
        scheduler.add_task(task(&format!("t{i}"), JobPriority::Normal));
    }

    let outcome = scheduler.process_all().await.unwrap();
    assert_eq!(outcome.completed.len(), 10);
    assert!(outcome.permanently_failed.is_empty());
    // Two failures then one success per task.
    assert_eq!(processor.attempts_for(&TaskId("t0".to_string())), 3);

    let stats = scheduler.get_statistics();
    assert_eq!(stats.total_completed, 10);
    assert_eq!(stats.total_failed_permanently, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn tasks_attempted_at_most_max_retries_plus_one() {
    let processor = Arc::new(FlakyProcessor::new(u32::MAX));
    let scheduler =
        SmartBatchScheduler::new(fast_cfg(BatchStrategy::Fixed, 4, 2), processor.clone(), None)
            .unwrap();

    for i in 0..4 {
        scheduler.add_task(task(&format!("t{i}"), JobPriority::Normal));
    }

    let outcome = scheduler.process_all().await.unwrap();
    assert!(outcome.completed.is_empty());
    assert_eq!(outcome.permanently_failed.len(), 4);
    for i in 0..4 {
        assert_eq!(processor.attempts_for(&TaskId(format!("t{i}"))), 3);
    }

    let stats = scheduler.get_statistics();
    assert_eq!(stats.total_failed_permanently, 4);
    assert_eq!(
        stats.error_counts.get("transient upstream error").copied(),
        Some(4)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn higher_priority_tasks_dispatch_first() {
    let processor = Arc::new(RecordingProcessor {
        order: Mutex::new(Vec::new()),
    });
    let cfg = BatchConfig {
        max_batch_size: 1,
        ..fast_cfg(BatchStrategy::Fixed, 1, 0)
    };
    let scheduler = SmartBatchScheduler::new(cfg, processor.clone(), None).unwrap();

    scheduler.add_task(task("low", JobPriority::Low));
    scheduler.add_task(task("urgent", JobPriority::Urgent));
    scheduler.add_task(task("normal", JobPriority::Normal));

    scheduler.process_all().await.unwrap();

    let order = processor.order.lock().unwrap().clone();
    let names: Vec<&str> = order.iter().map(|id| id.0.as_str()).collect();
    assert_eq!(names, vec!["urgent", "normal", "low"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_priority_preserves_arrival_order() {
    let processor = Arc::new(RecordingProcessor {
        order: Mutex::new(Vec::new()),
    });
    let cfg = BatchConfig {
        max_batch_size: 1,
        ..fast_cfg(BatchStrategy::Fixed, 1, 0)
    };
    let scheduler = SmartBatchScheduler::new(cfg, processor.clone(), None).unwrap();

    for i in 0..5 {
        scheduler.add_task(task(&format!("t{i}"), JobPriority::Normal));
    }
    scheduler.process_all().await.unwrap();

    let order = processor.order.lock().unwrap().clone();
    let names: Vec<String> = order.iter().map(|id| id.0.clone()).collect();
    assert_eq!(names, vec!["t0", "t1", "t2", "t3", "t4"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_strategy_shrinks_after_success_collapse() {
    let scheduler = SmartBatchScheduler::new(
        fast_cfg(BatchStrategy::Dynamic, 4, 0),
        Arc::new(PriorityGatedProcessor),
        None,
    )
    .unwrap();

    // First batch: four tasks that succeed. Second batch: four that fail.
    for i in 0..4 {
        scheduler.add_task(task(&format!("ok{i}"), JobPriority::High));
    }
    for i in 0..4 {
        scheduler.add_task(task(&format!("bad{i}"), JobPriority::Low));
    }

    let outcome = scheduler.process_all().await.unwrap();
    assert_eq!(outcome.completed.len(), 4);
    assert_eq!(outcome.permanently_failed.len(), 4);

    // Success rate fell from 1.0 to 0.0, so the size shrank by a quarter.
    assert_eq!(scheduler.get_statistics().current_batch_size, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn pinned_strategies_hold_their_bound() {
    let latency = SmartBatchScheduler::new(
        fast_cfg(BatchStrategy::LatencyOptimized, 5, 0),
        Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
        }),
        None,
    )
    .unwrap();
    latency.add_task(task("a", JobPriority::Normal));
    latency.process_all().await.unwrap();
    assert_eq!(latency.current_batch_size(), 1);

    let throughput = SmartBatchScheduler::new(
        fast_cfg(BatchStrategy::ThroughputOptimized, 5, 0),
        Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
        }),
        None,
    )
    .unwrap();
    throughput.add_task(task("a", JobPriority::Normal));
    throughput.process_all().await.unwrap();
    assert_eq!(throughput.current_batch_size(), 20);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_clears_queues_and_stats() {
    let scheduler = SmartBatchScheduler::new(
        fast_cfg(BatchStrategy::Fixed, 2, 0),
        Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
        }),
        None,
    )
    .unwrap();

    scheduler.add_tasks((0..3).map(|i| task(&format!("t{i}"), JobPriority::Normal)));
    assert_eq!(scheduler.pending_len(), 3);

    scheduler.reset();
    assert_eq!(scheduler.pending_len(), 0);
    let stats = scheduler.get_statistics();
    assert_eq!(stats.total_completed, 0);
    assert_eq!(stats.batches_processed, 0);
    assert_eq!(stats.current_batch_size, 2);

    let outcome = scheduler.process_all().await.unwrap();
    assert!(outcome.completed.is_empty());
}
