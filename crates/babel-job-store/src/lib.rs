#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
pub mod mem;

use std::path::Path;

use babel_core::types::{BatchJob, JobId, JobStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("invalid job_id")]
    InvalidJobId,
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable job persistence consumed by the queue.
///
/// The queue treats writes as synchronous best-effort durable storage: a
/// failed write is logged and in-memory state stays authoritative until the
/// next successful write.
pub trait JobStore: Send + Sync + 'static {
    fn add(&self, job: &BatchJob) -> Result<(), JobStoreError>;
    fn update(&self, job: &BatchJob) -> Result<(), JobStoreError>;
    fn remove(&self, job_id: &JobId) -> Result<(), JobStoreError>;
    fn get(&self, job_id: &JobId) -> Result<Option<BatchJob>, JobStoreError>;
    fn all(&self) -> Result<Vec<BatchJob>, JobStoreError>;
    fn list_by_status(&self, status: JobStatus) -> Result<Vec<BatchJob>, JobStoreError>;
    /// Drops completed and cancelled jobs; returns how many were removed.
    fn clear_completed(&self) -> Result<usize, JobStoreError>;
}

pub(crate) fn validate_key_component(value: &str) -> bool {
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

pub(crate) fn validate_job_id(job_id: &JobId) -> bool {
    validate_key_component(job_id.0.as_str())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let suffix = format!("tmp.{}", std::process::id());
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

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
