//! Persistence for the job pool: `jobs.json`, a JSON array of job records.
//!
//! Every write serializes the whole pool once and swaps it into place
//! atomically. Pool edits are read-modify-write against the scheduler's
//! copy, under one mutex, so concurrent operator actions cannot lose
//! updates.

use std::path::PathBuf;

use tokio::fs;
use tokio::sync::Mutex;

use crate::admin::job::{fresh_id, Job};
use crate::admin::scheduler::Scheduler;
use crate::error::{Error, Result};

pub struct JobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Read the pool. A missing file is an empty pool.
    pub async fn load(&self) -> Result<Vec<Job>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Overwrite the pool on disk.
    pub async fn save(&self, jobs: &[Job]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(jobs).await
    }

    /// Assign a fresh id to `job`, prepend it to the scheduler's pool, and
    /// persist. Returns the new id.
    pub async fn add_job(&self, scheduler: &Scheduler, mut job: Job) -> Result<String> {
        if job.unbounded() {
            return Err(Error::UnboundedJob);
        }
        let _guard = self.lock.lock().await;
        let mut jobs = scheduler.jobs().await?;
        job.id = fresh_id();
        let id = job.id.clone();
        jobs.insert(0, job);
        scheduler.set_jobs(jobs.clone()).await?;
        self.write(&jobs).await?;
        Ok(id)
    }

    /// Replace the pool record with the same id and persist. Running
    /// instances keep their launch-time copies.
    pub async fn modify_job(&self, scheduler: &Scheduler, job: Job) -> Result<()> {
        if job.unbounded() {
            return Err(Error::UnboundedJob);
        }
        let _guard = self.lock.lock().await;
        let mut jobs = scheduler.jobs().await?;
        let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) else {
            return Err(Error::JobCopyFailure(format!("job id not found: {}", job.id)));
        };
        *slot = job;
        scheduler.set_jobs(jobs.clone()).await?;
        self.write(&jobs).await
    }

    /// Remove the record with `id` and persist.
    pub async fn delete_job(&self, scheduler: &Scheduler, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut jobs = scheduler.jobs().await?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(Error::JobCopyFailure(format!("job id not found: {}", id)));
        }
        scheduler.set_jobs(jobs.clone()).await?;
        self.write(&jobs).await
    }

    async fn read(&self) -> Result<Vec<Job>> {
        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&contents).map_err(|e| Error::JobCopyFailure(e.to_string()))
    }

    async fn write(&self, jobs: &[Job]) -> Result<()> {
        let encoded =
            serde_json::to_vec_pretty(jobs).map_err(|e| Error::JobCopyFailure(e.to_string()))?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, &encoded).await?;
        fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}
