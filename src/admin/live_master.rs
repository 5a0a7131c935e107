use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::admin::job::Job;
use crate::admin::live_job::LiveJob;
use crate::admin::notify::ChangeNotifier;
use crate::error::{Error, Result};
use crate::proto::link::SlaveInfo;
use crate::proto::master::MasterSession;

struct JobRequest {
    job: Job,
    resp: oneshot::Sender<Result<Arc<LiveJob>>>,
}

/// One connected slave, as the admin surface sees it.
///
/// New-job requests flow through a single-consumer mailbox, so launches
/// serialize and cannot race a shutdown. `shutdown` drains (running jobs
/// finish, new ones are refused); `cancel` cuts the connection.
pub struct LiveMaster {
    session: Arc<MasterSession>,
    drain: CancellationToken,
    requests: mpsc::Sender<JobRequest>,
    jobs: RwLock<Vec<Arc<LiveJob>>>,
    jobs_note: ChangeNotifier,
}

impl LiveMaster {
    pub fn spawn(session: MasterSession) -> Arc<LiveMaster> {
        let (req_tx, req_rx) = mpsc::channel(1);
        let live = Arc::new(LiveMaster {
            session: Arc::new(session),
            drain: CancellationToken::new(),
            requests: req_tx,
            jobs: RwLock::new(Vec::new()),
            jobs_note: ChangeNotifier::new(),
        });

        // Connection death drains the master.
        let watcher = live.clone();
        tokio::spawn(async move {
            watcher.session.wait().await;
            watcher.shutdown();
        });

        let runner = live.clone();
        tokio::spawn(async move { runner.run(req_rx).await });
        live
    }

    async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<JobRequest>) {
        loop {
            // Checked separately so a queue of pending launches cannot
            // delay a shutdown.
            if self.drain.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.drain.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let result = LiveJob::spawn(&self.session, &request.job).await;
                    if let Ok(job) = &result {
                        self.jobs.write().unwrap().push(job.clone());
                        self.jobs_note.notify();
                    }
                    let _ = request.resp.send(result);
                }
            }
        }

        // Draining: let running jobs finish before tearing down.
        let jobs: Vec<_> = self.jobs.read().unwrap().clone();
        for job in jobs {
            job.wait(None).await;
        }
        self.jobs_note.close();
        self.session.close().await;
    }

    pub fn slave_info(&self) -> SlaveInfo {
        self.session.slave_info().clone()
    }

    /// False once the master is draining or closed.
    pub fn accepting(&self) -> bool {
        !self.drain.is_cancelled()
    }

    /// False once the master has fully disconnected.
    pub fn running(&self) -> bool {
        !self.jobs_note.closed()
    }

    /// Graceful shutdown: running jobs complete, new ones are refused.
    pub fn shutdown(&self) {
        self.drain.cancel();
    }

    /// Abrupt shutdown: the connection is closed; running jobs fail on
    /// their next use of it.
    pub fn cancel(&self) {
        let session = self.session.clone();
        tokio::spawn(async move { session.close().await });
    }

    /// Queue a job to run on this master.
    pub async fn run_job(&self, job: &Job) -> Result<Arc<LiveJob>> {
        if !self.accepting() {
            return Err(Error::NotAccepting);
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        let request = JobRequest {
            job: job.clone(),
            resp: resp_tx,
        };
        tokio::select! {
            sent = self.requests.send(request) => {
                if sent.is_err() {
                    return Err(Error::NotAccepting);
                }
            }
            _ = self.drain.cancelled() => return Err(Error::NotAccepting),
        }
        resp_rx.await.map_err(|_| Error::NotAccepting)?
    }

    /// Number of jobs ever started on this master.
    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// Jobs in `[start, end)`; `job_count` gives a safe limit.
    pub fn jobs(&self, start: usize, end: usize) -> Vec<Arc<LiveJob>> {
        self.jobs.read().unwrap()[start..end].to_vec()
    }

    /// Wait for another job to start (true) or the master to close (false).
    pub async fn wait_jobs(&self, last_seen: usize, cancel: Option<&CancellationToken>) -> bool {
        self.jobs_note.wait(last_seen as u64, cancel).await
    }

    /// Wait until the master has fully disconnected.
    pub async fn wait(&self, cancel: Option<&CancellationToken>) {
        self.jobs_note.wait_close(cancel).await;
    }
}
