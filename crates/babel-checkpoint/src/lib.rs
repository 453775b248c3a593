#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Durable checkpoint/resume for translation jobs.
//!
//! One JSON document per checkpoint under `<root>/<job_id>/<checkpoint_id>.json`,
//! written atomically. Completion checkpoints are permanent; automatic and
//! manual checkpoints are pruned FIFO per job.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use babel_core::types::{CheckpointId, ChunkId, JobId};
use babel_observe::time::unix_time_ms;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid job_id")]
    InvalidJobId,
    #[error("invalid checkpoint config: {0}")]
    InvalidConfig(String),
    #[error("completed and pending chunk sets overlap for job {0}")]
    ChunkOverlap(String),
    #[error("checkpoint not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Auto,
    Manual,
    PreFailure,
    Completion,
}

impl CheckpointType {
    /// Only automatic and manual checkpoints are subject to the per-job cap.
    fn prunable(self) -> bool {
        matches!(self, CheckpointType::Auto | CheckpointType::Manual)
    }
}

/// A durable snapshot of one job's progress, sufficient to resume without
/// reprocessing completed chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub job_id: JobId,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// Monotonic per-manager tiebreak for checkpoints created in the same
    /// millisecond.
    pub sequence: u64,
    pub checkpoint_type: CheckpointType,
    pub progress_percentage: f64,
    pub completed_chunks: Vec<ChunkId>,
    pub pending_chunks: Vec<ChunkId>,
    pub partial_results: BTreeMap<ChunkId, String>,
    pub job_metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Create an automatic checkpoint every N `should_checkpoint` calls.
    pub auto_checkpoint_interval: u32,
    /// Cap on prunable (auto/manual) checkpoints retained per job.
    pub max_checkpoints_per_job: usize,
    /// Age cutoff used by [`CheckpointManager::cleanup_old_checkpoints`]
    /// when no explicit window is given.
    pub retention: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            auto_checkpoint_interval: 10,
            max_checkpoints_per_job: 5,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.auto_checkpoint_interval == 0 {
            return Err(CheckpointError::InvalidConfig(
                "auto_checkpoint_interval must be > 0".into(),
            ));
        }
        if self.max_checkpoints_per_job == 0 {
            return Err(CheckpointError::InvalidConfig(
                "max_checkpoints_per_job must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointStats {
    pub total_checkpoints: usize,
    pub total_jobs: usize,
    pub auto: usize,
    pub manual: usize,
    pub pre_failure: usize,
    pub completion: usize,
    pub total_bytes: u64,
}

pub struct CheckpointManager {
    root: PathBuf,
    cfg: CheckpointConfig,
    chunk_counters: Mutex<HashMap<JobId, u32>>,
    sequence: AtomicU64,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, cfg: CheckpointConfig) -> Result<Self, CheckpointError> {
        cfg.validate()?;
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cfg,
            chunk_counters: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot the job's current chunk state to disk, then prune this job's
    /// prunable checkpoints down to the configured cap (oldest first).
    #[allow(clippy::too_many_arguments)]
    pub fn create_checkpoint(
        &self,
        job_id: &JobId,
        completed_chunks: Vec<ChunkId>,
        pending_chunks: Vec<ChunkId>,
        partial_results: BTreeMap<ChunkId, String>,
        job_metadata: BTreeMap<String, serde_json::Value>,
        checkpoint_type: CheckpointType,
        error_info: Option<BTreeMap<String, String>>,
    ) -> Result<Checkpoint, CheckpointError> {
        let completed_set: BTreeSet<&ChunkId> = completed_chunks.iter().collect();
        if pending_chunks.iter().any(|c| completed_set.contains(c)) {
            return Err(CheckpointError::ChunkOverlap(job_id.0.clone()));
        }

        let total = completed_chunks.len() + pending_chunks.len();
        let progress = if total == 0 {
            0.0
        } else {
            completed_chunks.len() as f64 / total as f64 * 100.0
        };

        let checkpoint = Checkpoint {
            checkpoint_id: self.generate_checkpoint_id(job_id),
            job_id: job_id.clone(),
            timestamp: unix_time_ms(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            checkpoint_type,
            progress_percentage: progress,
            completed_chunks,
            pending_chunks,
            partial_results,
            job_metadata,
            error_info,
        };

        self.put_checkpoint(&checkpoint)?;
        self.prune_job(job_id)?;

        info!(
            event = "checkpoint_created",
            job_id = %job_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            checkpoint_type = ?checkpoint.checkpoint_type,
            progress = checkpoint.progress_percentage,
            "created checkpoint"
        );

        Ok(checkpoint)
    }

    /// Persist an already-built checkpoint document verbatim (no pruning).
    pub fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(&checkpoint.job_id, &checkpoint.checkpoint_id)?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    /// Modulo counter deciding when an automatic checkpoint is due.
    ///
    /// Returns true and resets every `auto_checkpoint_interval` calls for the
    /// given job.
    pub fn should_checkpoint(&self, job_id: &JobId) -> bool {
        let mut counters = lock(&self.chunk_counters);
        let counter = counters.entry(job_id.clone()).or_insert(0);
        *counter += 1;
        if *counter >= self.cfg.auto_checkpoint_interval {
            *counter = 0;
            true
        } else {
            false
        }
    }

    pub fn get_checkpoint(
        &self,
        job_id: &JobId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(job_id, checkpoint_id)?;
        if !path.exists() {
            return Err(CheckpointError::NotFound(checkpoint_id.0.clone()));
        }
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All checkpoints for a job, oldest first.
    pub fn list_checkpoints(&self, job_id: &JobId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let dir = self.job_dir(job_id)?;
        let mut checkpoints = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(err) => return Err(CheckpointError::Io(err)),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(CheckpointError::Io).and_then(
                |bytes| -> Result<Checkpoint, CheckpointError> {
                    Ok(serde_json::from_slice(&bytes)?)
                },
            ) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    warn!(
                        event = "checkpoint_skip",
                        job_id = %job_id,
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable checkpoint"
                    );
                }
            }
        }

        checkpoints.sort_by_key(|c| (c.timestamp, c.sequence));
        Ok(checkpoints)
    }

    pub fn get_latest_checkpoint(
        &self,
        job_id: &JobId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.list_checkpoints(job_id)?.into_iter().next_back())
    }

    /// Latest checkpoint for the job, logged for the resume path. Pending
    /// chunks are a suffix of the original chunk order, so processing exactly
    /// `pending_chunks` after resume reconstructs the full set.
    pub fn resume_from_checkpoint(
        &self,
        job_id: &JobId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoint = self.get_latest_checkpoint(job_id)?;
        if let Some(cp) = &checkpoint {
            info!(
                event = "checkpoint_resume",
                job_id = %job_id,
                checkpoint_id = %cp.checkpoint_id,
                progress = cp.progress_percentage,
                completed = cp.completed_chunks.len(),
                pending = cp.pending_chunks.len(),
                "resuming from checkpoint"
            );
        }
        Ok(checkpoint)
    }

    /// Write the terminal checkpoint for a cancelled job and drop its
    /// in-memory counters. Partial results are kept for audit.
    pub fn cancel_job(
        &self,
        job_id: &JobId,
        completed_chunks: Vec<ChunkId>,
        pending_chunks: Vec<ChunkId>,
        partial_results: BTreeMap<ChunkId, String>,
        job_metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut error_info = BTreeMap::new();
        error_info.insert("reason".to_string(), "job cancelled".to_string());
        let checkpoint = self.create_checkpoint(
            job_id,
            completed_chunks,
            pending_chunks,
            partial_results,
            job_metadata,
            CheckpointType::Manual,
            Some(error_info),
        )?;
        lock(&self.chunk_counters).remove(job_id);
        Ok(checkpoint)
    }

    /// Write the completion checkpoint and drop in-memory counters.
    pub fn mark_completed(
        &self,
        job_id: &JobId,
        completed_chunks: Vec<ChunkId>,
        final_results: BTreeMap<ChunkId, String>,
        job_metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self.create_checkpoint(
            job_id,
            completed_chunks,
            Vec::new(),
            final_results,
            job_metadata,
            CheckpointType::Completion,
            None,
        )?;
        lock(&self.chunk_counters).remove(job_id);
        Ok(checkpoint)
    }

    /// Delete a job's checkpoints, optionally keeping the newest one.
    pub fn cleanup_job(&self, job_id: &JobId, keep_latest: bool) -> Result<usize, CheckpointError> {
        let checkpoints = self.list_checkpoints(job_id)?;
        let keep_from = if keep_latest {
            checkpoints.len().saturating_sub(1)
        } else {
            checkpoints.len()
        };

        let mut deleted = 0;
        for cp in &checkpoints[..keep_from] {
            self.delete_checkpoint_file(job_id, &cp.checkpoint_id)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Delete non-completion checkpoints older than `max_age` across all jobs.
    pub fn cleanup_old_checkpoints(
        &self,
        max_age: Option<Duration>,
    ) -> Result<usize, CheckpointError> {
        let max_age = max_age.unwrap_or(self.cfg.retention);
        let cutoff =
            unix_time_ms().saturating_sub(max_age.as_millis().min(u64::MAX as u128) as u64);

        let mut deleted = 0;
        for job_id in self.job_dirs()? {
            for cp in self.list_checkpoints(&job_id)? {
                if cp.timestamp < cutoff && cp.checkpoint_type != CheckpointType::Completion {
                    self.delete_checkpoint_file(&job_id, &cp.checkpoint_id)?;
                    deleted += 1;
                }
            }
        }

        if deleted > 0 {
            info!(
                event = "checkpoint_retention_sweep",
                deleted = deleted,
                "removed expired checkpoints"
            );
        }
        Ok(deleted)
    }

    pub fn get_statistics(&self) -> Result<CheckpointStats, CheckpointError> {
        let mut stats = CheckpointStats::default();
        for job_id in self.job_dirs()? {
            let checkpoints = self.list_checkpoints(&job_id)?;
            if checkpoints.is_empty() {
                continue;
            }
            stats.total_jobs += 1;
            for cp in &checkpoints {
                stats.total_checkpoints += 1;
                match cp.checkpoint_type {
                    CheckpointType::Auto => stats.auto += 1,
                    CheckpointType::Manual => stats.manual += 1,
                    CheckpointType::PreFailure => stats.pre_failure += 1,
                    CheckpointType::Completion => stats.completion += 1,
                }
                let path = self.checkpoint_path(&job_id, &cp.checkpoint_id)?;
                if let Ok(meta) = std::fs::metadata(path) {
                    stats.total_bytes += meta.len();
                }
            }
        }
        Ok(stats)
    }

    fn prune_job(&self, job_id: &JobId) -> Result<(), CheckpointError> {
        let prunable: Vec<Checkpoint> = self
            .list_checkpoints(job_id)?
            .into_iter()
            .filter(|c| c.checkpoint_type.prunable())
            .collect();

        if prunable.len() <= self.cfg.max_checkpoints_per_job {
            return Ok(());
        }

        let excess = prunable.len() - self.cfg.max_checkpoints_per_job;
        for cp in &prunable[..excess] {
            self.delete_checkpoint_file(job_id, &cp.checkpoint_id)?;
            info!(
                event = "checkpoint_pruned",
                job_id = %job_id,
                checkpoint_id = %cp.checkpoint_id,
                "pruned checkpoint over per-job cap"
            );
        }
        Ok(())
    }

    fn delete_checkpoint_file(
        &self,
        job_id: &JobId,
        checkpoint_id: &CheckpointId,
    ) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(job_id, checkpoint_id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CheckpointError::Io(err)),
        }
    }

    fn generate_checkpoint_id(&self, job_id: &JobId) -> CheckpointId {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        CheckpointId(format!("ckpt_{}_{}", job_id.0, &uuid[..12]))
    }

    fn job_dir(&self, job_id: &JobId) -> Result<PathBuf, CheckpointError> {
        if !validate_key_component(&job_id.0) {
            return Err(CheckpointError::InvalidJobId);
        }
        Ok(self.root.join(&job_id.0))
    }

    fn checkpoint_path(
        &self,
        job_id: &JobId,
        checkpoint_id: &CheckpointId,
    ) -> Result<PathBuf, CheckpointError> {
        if !validate_key_component(&checkpoint_id.0) {
            return Err(CheckpointError::InvalidJobId);
        }
        Ok(self
            .job_dir(job_id)?
            .join(format!("{}.json", checkpoint_id.0)))
    }

    fn job_dirs(&self) -> Result<Vec<JobId>, CheckpointError> {
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    jobs.push(JobId(name.to_string()));
                }
            }
        }
        jobs.sort();
        Ok(jobs)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn validate_key_component(value: &str) -> bool {
    if value.trim().is_empty() {
        return false;
    }
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    if value.contains("..") {
        return false;
    }
    true
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    tmp.set_file_name(format!("{file_name}.tmp.{}", std::process::id()));

    {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}
