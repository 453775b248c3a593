use std::collections::HashMap;
use std::sync::Mutex;

use babel_core::types::{BatchJob, JobId, JobStatus};

use crate::{JobStore, JobStoreError};

/// In-memory store for tests and ephemeral queues.
#[derive(Debug, Default)]
pub struct MemJobStore {
    jobs: Mutex<HashMap<JobId, BatchJob>>,
}

impl MemJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, BatchJob>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl JobStore for MemJobStore {
    fn add(&self, job: &BatchJob) -> Result<(), JobStoreError> {
        self.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update(&self, job: &BatchJob) -> Result<(), JobStoreError> {
        let mut jobs = self.lock();
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id.0.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn remove(&self, job_id: &JobId) -> Result<(), JobStoreError> {
        if self.lock().remove(job_id).is_none() {
            return Err(JobStoreError::NotFound(job_id.0.clone()));
        }
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<BatchJob>, JobStoreError> {
        Ok(self.lock().get(job_id).cloned())
    }

    fn all(&self) -> Result<Vec<BatchJob>, JobStoreError> {
        let mut jobs: Vec<BatchJob> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<BatchJob>, JobStoreError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|j| j.status == status)
            .collect())
    }

    fn clear_completed(&self) -> Result<usize, JobStoreError> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !j.status.is_terminal());
        Ok(before - jobs.len())
    }
}
