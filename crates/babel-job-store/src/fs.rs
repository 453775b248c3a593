use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use babel_core::types::{BatchJob, JobId, JobStatus};
use tracing::warn;

use crate::{validate_job_id, write_atomic, JobStore, JobStoreError};

/// Filesystem job store: an in-memory index over one JSON document per job.
///
/// Layout: `<root>/jobs/<job_id>.json`. Every mutation rewrites only the
/// affected job's file (atomic tmp + rename), never the whole set, so a crash
/// mid-write cannot corrupt unrelated jobs.
#[derive(Debug)]
pub struct FsJobStore {
    root: PathBuf,
    index: Mutex<HashMap<JobId, BatchJob>>,
}

impl FsJobStore {
    /// Opens (or creates) a store rooted at `root`, loading every job file
    /// into the index. Unreadable files are skipped with a warning rather
    /// than failing the whole load.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let root = root.into();
        let jobs_dir = root.join("jobs");
        std::fs::create_dir_all(&jobs_dir)?;

        let mut index = HashMap::new();
        for entry in std::fs::read_dir(&jobs_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_job(&path) {
                Ok(job) => {
                    index.insert(job.id.clone(), job);
                }
                Err(err) => {
                    warn!(
                        event = "job_store_skip",
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable job file"
                    );
                }
            }
        }

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_path(&self, job_id: &JobId) -> Result<PathBuf, JobStoreError> {
        if !validate_job_id(job_id) {
            return Err(JobStoreError::InvalidJobId);
        }
        Ok(self.root.join("jobs").join(format!("{}.json", job_id.0)))
    }

    fn read_job(path: &Path) -> Result<BatchJob, JobStoreError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn persist(&self, job: &BatchJob) -> Result<(), JobStoreError> {
        let path = self.job_path(&job.id)?;
        let bytes = serde_json::to_vec_pretty(job)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, BatchJob>> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl JobStore for FsJobStore {
    fn add(&self, job: &BatchJob) -> Result<(), JobStoreError> {
        self.persist(job)?;
        self.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update(&self, job: &BatchJob) -> Result<(), JobStoreError> {
        if !self.lock().contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id.0.clone()));
        }
        self.persist(job)?;
        self.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn remove(&self, job_id: &JobId) -> Result<(), JobStoreError> {
        let path = self.job_path(job_id)?;
        if self.lock().remove(job_id).is_none() {
            return Err(JobStoreError::NotFound(job_id.0.clone()));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(JobStoreError::Io(err)),
        }
    }

    fn get(&self, job_id: &JobId) -> Result<Option<BatchJob>, JobStoreError> {
        if !validate_job_id(job_id) {
            return Err(JobStoreError::InvalidJobId);
        }
        Ok(self.lock().get(job_id).cloned())
    }

    fn all(&self) -> Result<Vec<BatchJob>, JobStoreError> {
        let mut jobs: Vec<BatchJob> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<BatchJob>, JobStoreError> {
        let mut jobs: Vec<BatchJob> = self
            .lock()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn clear_completed(&self) -> Result<usize, JobStoreError> {
        let to_remove: Vec<JobId> = self
            .lock()
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| j.id.clone())
            .collect();
        for job_id in &to_remove {
            self.remove(job_id)?;
        }
        Ok(to_remove.len())
    }
}
