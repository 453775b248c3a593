use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use babel_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointManager, CheckpointType,
};
use babel_core::types::{ChunkId, JobId};

fn chunk_ids(range: std::ops::Range<usize>) -> Vec<ChunkId> {
    range.map(|i| ChunkId(format!("chunk_{i:04}"))).collect()
}

fn manager(root: &std::path::Path, interval: u32, cap: usize) -> CheckpointManager {
    CheckpointManager::new(
        root,
        CheckpointConfig {
            auto_checkpoint_interval: interval,
            max_checkpoints_per_job: cap,
            ..CheckpointConfig::default()
        },
    )
    .unwrap()
}

#[test]
fn auto_checkpoints_fire_on_interval_and_completion_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 5, 3);
    let job = JobId("job_interval".to_string());
    let all = chunk_ids(0..23);

    let mut results = BTreeMap::new();
    let mut auto_count = 0;
    for (i, chunk) in all.iter().enumerate() {
        results.insert(chunk.clone(), format!("translated {i}"));
        if mgr.should_checkpoint(&job) {
            auto_count += 1;
            mgr.create_checkpoint(
                &job,
                all[..=i].to_vec(),
                all[i + 1..].to_vec(),
                results.clone(),
                BTreeMap::new(),
                CheckpointType::Auto,
                None,
            )
            .unwrap();
        }
    }
    // 23 chunks at interval 5 fires after chunks 5, 10, 15 and 20.
    assert_eq!(auto_count, 4);

    mgr.mark_completed(&job, all.clone(), results, BTreeMap::new())
        .unwrap();

    let checkpoints = mgr.list_checkpoints(&job).unwrap();
    // Cap of 3 keeps the three newest autos plus the completion checkpoint.
    assert_eq!(checkpoints.len(), 4);
    let autos: Vec<&Checkpoint> = checkpoints
        .iter()
        .filter(|c| c.checkpoint_type == CheckpointType::Auto)
        .collect();
    assert_eq!(autos.len(), 3);
    assert_eq!(autos[0].completed_chunks.len(), 10);
    assert_eq!(autos[1].completed_chunks.len(), 15);
    assert_eq!(autos[2].completed_chunks.len(), 20);

    let completion = checkpoints.last().unwrap();
    assert_eq!(completion.checkpoint_type, CheckpointType::Completion);
    assert_eq!(completion.completed_chunks.len(), 23);
    assert!(completion.pending_chunks.is_empty());
    assert_eq!(completion.progress_percentage, 100.0);
}

#[test]
fn cancel_writes_manual_checkpoint_with_remaining_work() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("job_cancel".to_string());
    let all = chunk_ids(0..20);

    let mut results = BTreeMap::new();
    for chunk in &all[..10] {
        results.insert(chunk.clone(), "partial".to_string());
    }

    let checkpoint = mgr
        .cancel_job(
            &job,
            all[..10].to_vec(),
            all[10..].to_vec(),
            results,
            BTreeMap::new(),
        )
        .unwrap();

    assert_eq!(checkpoint.checkpoint_type, CheckpointType::Manual);
    assert_eq!(checkpoint.completed_chunks.len(), 10);
    assert_eq!(checkpoint.pending_chunks.len(), 10);
    assert_eq!(checkpoint.progress_percentage, 50.0);
    assert_eq!(
        checkpoint.error_info.as_ref().unwrap().get("reason"),
        Some(&"job cancelled".to_string())
    );
    assert_eq!(checkpoint.partial_results.len(), 10);
}

#[test]
fn resume_reconstructs_full_chunk_set_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("job_resume".to_string());
    let all = chunk_ids(0..12);

    mgr.create_checkpoint(
        &job,
        all[..7].to_vec(),
        all[7..].to_vec(),
        BTreeMap::new(),
        BTreeMap::new(),
        CheckpointType::Auto,
        None,
    )
    .unwrap();

    let resumed = mgr.resume_from_checkpoint(&job).unwrap().unwrap();
    let completed: BTreeSet<&ChunkId> = resumed.completed_chunks.iter().collect();
    let pending: BTreeSet<&ChunkId> = resumed.pending_chunks.iter().collect();
    assert!(completed.is_disjoint(&pending));

    let union: BTreeSet<&ChunkId> = completed.union(&pending).copied().collect();
    let expected: BTreeSet<&ChunkId> = all.iter().collect();
    assert_eq!(union, expected);
}

#[test]
fn overlapping_chunk_sets_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("job_overlap".to_string());
    let all = chunk_ids(0..4);

    let err = mgr
        .create_checkpoint(
            &job,
            all[..2].to_vec(),
            all[1..].to_vec(),
            BTreeMap::new(),
            BTreeMap::new(),
            CheckpointType::Auto,
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        babel_checkpoint::CheckpointError::ChunkOverlap(_)
    ));
}

#[test]
fn latest_checkpoint_returns_newest() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("job_latest".to_string());
    let all = chunk_ids(0..6);

    for done in [2usize, 4, 6] {
        mgr.create_checkpoint(
            &job,
            all[..done].to_vec(),
            all[done..].to_vec(),
            BTreeMap::new(),
            BTreeMap::new(),
            CheckpointType::Auto,
            None,
        )
        .unwrap();
    }

    let latest = mgr.get_latest_checkpoint(&job).unwrap().unwrap();
    assert_eq!(latest.completed_chunks.len(), 6);
}

#[test]
fn retention_sweep_spares_completion_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("job_retention".to_string());
    let all = chunk_ids(0..4);

    let old_auto = mgr
        .create_checkpoint(
            &job,
            all[..2].to_vec(),
            all[2..].to_vec(),
            BTreeMap::new(),
            BTreeMap::new(),
            CheckpointType::Auto,
            None,
        )
        .unwrap();
    let old_completion = mgr
        .mark_completed(&job, all.clone(), BTreeMap::new(), BTreeMap::new())
        .unwrap();

    // Backdate both documents a year and rewrite them in place.
    let year_ms = 365 * 24 * 60 * 60 * 1000;
    for cp in [&old_auto, &old_completion] {
        let mut doctored = cp.clone();
        doctored.timestamp = doctored.timestamp.saturating_sub(year_ms);
        mgr.put_checkpoint(&doctored).unwrap();
    }

    let deleted = mgr
        .cleanup_old_checkpoints(Some(Duration::from_secs(24 * 60 * 60)))
        .unwrap();
    assert_eq!(deleted, 1);

    let remaining = mgr.list_checkpoints(&job).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].checkpoint_type, CheckpointType::Completion);
}

#[test]
fn cleanup_job_can_keep_only_the_latest() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("job_cleanup".to_string());
    let all = chunk_ids(0..9);

    for done in [3usize, 6, 9] {
        mgr.create_checkpoint(
            &job,
            all[..done].to_vec(),
            all[done..].to_vec(),
            BTreeMap::new(),
            BTreeMap::new(),
            CheckpointType::Auto,
            None,
        )
        .unwrap();
    }

    let deleted = mgr.cleanup_job(&job, true).unwrap();
    assert_eq!(deleted, 2);
    let remaining = mgr.list_checkpoints(&job).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].completed_chunks.len(), 9);

    assert_eq!(mgr.cleanup_job(&job, false).unwrap(), 1);
    assert!(mgr.list_checkpoints(&job).unwrap().is_empty());
}

#[test]
fn statistics_count_types_across_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let all = chunk_ids(0..2);

    let job_a = JobId("job_a".to_string());
    mgr.create_checkpoint(
        &job_a,
        all[..1].to_vec(),
        all[1..].to_vec(),
        BTreeMap::new(),
        BTreeMap::new(),
        CheckpointType::Auto,
        None,
    )
    .unwrap();
    mgr.mark_completed(&job_a, all.clone(), BTreeMap::new(), BTreeMap::new())
        .unwrap();

    let job_b = JobId("job_b".to_string());
    mgr.cancel_job(&job_b, Vec::new(), all.clone(), BTreeMap::new(), BTreeMap::new())
        .unwrap();

    let stats = mgr.get_statistics().unwrap();
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.total_checkpoints, 3);
    assert_eq!(stats.auto, 1);
    assert_eq!(stats.completion, 1);
    assert_eq!(stats.manual, 1);
    assert!(stats.total_bytes > 0);
}

#[test]
fn path_escaping_job_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path(), 10, 5);
    let job = JobId("../escape".to_string());

    let err = mgr.list_checkpoints(&job).unwrap_err();
    assert!(matches!(err, babel_checkpoint::CheckpointError::InvalidJobId));
}
