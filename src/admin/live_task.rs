use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admin::notify::ChangeNotifier;
use crate::proto::link::LogEntry;
use crate::proto::master::MasterJob;
use crate::tasks::TaskSpec;

/// Log entries buffered between a running task and its observers. A full
/// buffer blocks the producer; log lines are never dropped.
const LOG_BUFFER: usize = 64;

#[derive(Default)]
struct Outcome {
    error: Option<String>,
    end_time: Option<DateTime<Utc>>,
}

/// A running or finished instance of one task: its log so far and, once
/// finished, its result. Only the owning job appends; observers read
/// stable prefixes.
pub struct LiveTask {
    task: TaskSpec,
    start_time: DateTime<Utc>,
    log: RwLock<Vec<LogEntry>>,
    log_note: ChangeNotifier,
    outcome: RwLock<Outcome>,
}

impl LiveTask {
    /// Start `task` on `job` and return a handle observing the run.
    pub fn spawn(job: Arc<MasterJob>, task: &TaskSpec) -> Arc<LiveTask> {
        let live = Arc::new(LiveTask {
            task: task.clone(),
            start_time: Utc::now(),
            log: RwLock::new(Vec::new()),
            log_note: ChangeNotifier::new(),
            outcome: RwLock::new(Outcome::default()),
        });

        let (log_tx, mut log_rx) = mpsc::channel(LOG_BUFFER);
        let appender = live.clone();
        tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                appender.log.write().unwrap().push(entry);
                appender.log_note.notify();
            }
            appender.log_note.close();
        });

        let runner = live.clone();
        // The extra sender keeps the log stream open until the outcome is
        // recorded, so observers woken by close always see the error.
        let hold_open = log_tx.clone();
        tokio::spawn(async move {
            let result = job.run(&runner.task, Some(log_tx)).await;
            {
                let mut outcome = runner.outcome.write().unwrap();
                outcome.error = result.err().map(|e| e.to_string());
                outcome.end_time = Some(Utc::now());
            }
            drop(hold_open);
        });

        live
    }

    /// The task definition this run was created from. Never changes, even
    /// if the operator edits the pool.
    pub fn task(&self) -> &TaskSpec {
        &self.task
    }

    pub fn running(&self) -> bool {
        !self.log_note.closed()
    }

    pub fn log_size(&self) -> usize {
        self.log.read().unwrap().len()
    }

    /// Log entries in `[start, end)`. The range must be within bounds;
    /// `log_size` gives a safe limit.
    pub fn log_entries(&self, start: usize, end: usize) -> Vec<LogEntry> {
        self.log.read().unwrap()[start..end].to_vec()
    }

    /// Wait for the log to grow past `last_seen` entries. Returns false
    /// once the task finished or the wait was cancelled first.
    pub async fn wait_log(&self, last_seen: usize, cancel: Option<&CancellationToken>) -> bool {
        self.log_note.wait(last_seen as u64, cancel).await
    }

    /// Wait until the task has finished.
    pub async fn wait(&self, cancel: Option<&CancellationToken>) {
        self.log_note.wait_close(cancel).await;
    }

    pub fn error(&self) -> Option<String> {
        self.outcome.read().unwrap().error.clone()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// None while the task is still running.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.outcome.read().unwrap().end_time
    }
}
