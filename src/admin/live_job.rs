use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::admin::job::Job;
use crate::admin::live_task::LiveTask;
use crate::admin::notify::ChangeNotifier;
use crate::error::Result;
use crate::proto::master::{MasterJob, MasterSession};

/// A running or finished instance of a job: the tasks attempted so far, in
/// order, and the first error if one stopped the run.
pub struct LiveJob {
    job: Job,
    master_job: Arc<MasterJob>,
    tasks: RwLock<Vec<Arc<LiveTask>>>,
    tasks_note: ChangeNotifier,
    error: RwLock<Option<String>>,
}

impl std::fmt::Debug for LiveJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveJob")
            .field("job", &self.job)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl LiveJob {
    /// Deep-copy `job`, start it on the session, and run its tasks in
    /// sequence until one fails or all succeed.
    pub async fn spawn(session: &MasterSession, job: &Job) -> Result<Arc<LiveJob>> {
        let master_job = Arc::new(session.start_job().await?);
        let live = Arc::new(LiveJob {
            job: job.clone(),
            master_job,
            tasks: RwLock::new(Vec::new()),
            tasks_note: ChangeNotifier::new(),
            error: RwLock::new(None),
        });
        let runner = live.clone();
        tokio::spawn(async move { runner.run().await });
        Ok(live)
    }

    async fn run(self: Arc<Self>) {
        for task in self.job.tasks.clone() {
            let live_task = LiveTask::spawn(self.master_job.clone(), &task);
            self.tasks.write().unwrap().push(live_task.clone());
            self.tasks_note.notify();

            live_task.wait(None).await;
            if let Some(err) = live_task.error() {
                self.finish(Some(format!("task error: {}", err))).await;
                return;
            }
        }
        self.finish(None).await;
    }

    async fn finish(&self, error: Option<String>) {
        self.master_job.close().await;
        if error.is_some() {
            *self.error.write().unwrap() = error;
        }
        self.tasks_note.close();
    }

    /// The job definition this run was created from. Never changes, even
    /// if the operator replaces the pool entry.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn running(&self) -> bool {
        !self.tasks_note.closed()
    }

    /// Ends the job. Takes effect once the current task notices its
    /// sub-link has gone away.
    pub fn cancel(&self) {
        let master_job = self.master_job.clone();
        tokio::spawn(async move { master_job.close().await });
    }

    /// Number of tasks started so far (not the number defined).
    pub fn task_count(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    /// Tasks in `[start, end)`; `task_count` gives a safe limit.
    pub fn tasks(&self, start: usize, end: usize) -> Vec<Arc<LiveTask>> {
        self.tasks.read().unwrap()[start..end].to_vec()
    }

    /// Wait for another task to start (true) or the job to finish (false).
    pub async fn wait_tasks(&self, last_seen: usize, cancel: Option<&CancellationToken>) -> bool {
        self.tasks_note.wait(last_seen as u64, cancel).await
    }

    /// Wait until the job has finished.
    pub async fn wait(&self, cancel: Option<&CancellationToken>) {
        self.tasks_note.wait_close(cancel).await;
    }

    /// The error that stopped the job, if any.
    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap().clone()
    }
}
