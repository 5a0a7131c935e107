//! Master side of a master/slave connection.
//!
//! The stack, bottom to top: TCP stream → framed link → root multiplexer
//! (keepalive + session) → session multiplexer (info + one sub-link per
//! job) → per-job multiplexer (one sub-link per task) → per-task
//! multiplexer (status, data, log).

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::proto::link::{FramedLink, LogEntry, ObjectLink, Payload, SlaveInfo};
use crate::proto::mux::{Multiplexer, SubLink};
use crate::proto::{auth, keepalive};
use crate::tasks::{TaskChannel, TaskSpec};

pub struct MasterSession {
    session_mux: Multiplexer,
    root: Arc<Multiplexer>,
    info: SlaveInfo,
    dead: CancellationToken,
}

impl std::fmt::Debug for MasterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSession")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl MasterSession {
    /// Authenticate a freshly accepted slave connection and set up the
    /// protocol stack on it.
    pub async fn establish(
        mut stream: TcpStream,
        password: &str,
        config: &LinkConfig,
    ) -> Result<Self> {
        auth::authenticate_master(&mut stream, password, config).await?;
        Self::establish_preauth(stream, config).await
    }

    /// Stack setup without the handshake. Used where authentication already
    /// happened out of band (and by loopback tests).
    pub async fn establish_preauth(stream: TcpStream, config: &LinkConfig) -> Result<Self> {
        let link: Arc<dyn ObjectLink> = Arc::new(FramedLink::new(stream));
        let root = Arc::new(Multiplexer::connector(link));
        let result = Self::build(root.clone(), config).await;
        if result.is_err() {
            root.close().await;
        }
        result
    }

    async fn build(root: Arc<Multiplexer>, config: &LinkConfig) -> Result<Self> {
        let session = Arc::new(keepalive::connect(&root, config).await?);
        let session_mux = Multiplexer::connector(session);

        let info_link = session_mux.connect().await?;
        let info = match info_link.receive().await? {
            Payload::Info(info) => info,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid slave info: {:?}",
                    other
                )))
            }
        };

        // The slave leaves the info sub-link open; its death doubles as a
        // connection-death signal independent of the keepalive.
        let dead = CancellationToken::new();
        let watcher_root = root.clone();
        let watcher_dead = dead.clone();
        tokio::spawn(async move {
            let _ = info_link.receive().await;
            watcher_root.close().await;
            watcher_dead.cancel();
        });

        Ok(Self {
            session_mux,
            root,
            info,
            dead,
        })
    }

    pub fn slave_info(&self) -> &SlaveInfo {
        &self.info
    }

    /// Open a new job on the slave. Multiple jobs may run at once.
    pub async fn start_job(&self) -> Result<MasterJob> {
        let job_link = self.session_mux.connect().await?;
        Ok(MasterJob {
            mux: Multiplexer::connector(Arc::new(job_link)),
        })
    }

    /// Blocks until the remote end disconnects or the session is closed.
    pub async fn wait(&self) {
        self.dead.cancelled().await;
    }

    /// Terminates the connection. Running jobs and tasks fail when they
    /// next touch the remote end. Safe to call more than once.
    pub async fn close(&self) {
        self.root.close().await;
        self.dead.cancel();
    }
}

/// Master half of one job: runs tasks over dedicated sub-links.
pub struct MasterJob {
    mux: Multiplexer,
}

impl MasterJob {
    /// Run one task in the context of this job, blocking until both halves
    /// finish. Concurrent invocations each get their own sub-link.
    ///
    /// Slave-side log lines are forwarded to `log` as they arrive; pass
    /// `None` to discard them. The sink should be drained continually, or
    /// the task will block once it fills.
    pub async fn run(&self, task: &TaskSpec, log: Option<mpsc::Sender<LogEntry>>) -> Result<()> {
        let task_link = self.mux.connect().await?;
        let task_mux = Multiplexer::connector(Arc::new(task_link));
        let result = run_task(&task_mux, task, log).await;
        task_mux.close().await;
        result
    }

    /// Ends the job. Graceful if no tasks are running; otherwise their
    /// sub-links are cut and both halves handle the failure.
    pub async fn close(&self) {
        self.mux.close().await;
    }
}

async fn run_task(
    task_mux: &Multiplexer,
    task: &TaskSpec,
    log: Option<mpsc::Sender<LogEntry>>,
) -> Result<()> {
    // Opening order is part of the protocol: status, data, log.
    let status = task_mux.connect().await?;
    let data = Arc::new(task_mux.connect().await?);
    let log_link = task_mux.connect().await?;

    let sink = log.clone();
    let log_pump = tokio::spawn(async move {
        loop {
            match log_link.receive().await {
                Ok(Payload::Str(message)) => {
                    if let Some(sink) = &sink {
                        let _ = sink
                            .send(LogEntry {
                                from_master: false,
                                message,
                            })
                            .await;
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    data.send(Payload::Task(task.clone())).await?;
    let local = task
        .run_master(&TaskChannel::master(data.clone(), log))
        .await;
    let _ = data.close().await;
    let _ = log_pump.await;

    let remote = read_status(&status).await;
    match local {
        Err(err) => Err(err),
        Ok(()) => remote,
    }
}

async fn read_status(status: &SubLink) -> Result<()> {
    let value = status.receive().await?;
    // Final ack: lets the other end fully disconnect.
    let _ = status.send(Payload::Nil).await;
    match value {
        Payload::Nil => Ok(()),
        Payload::Str(err) => Err(Error::TaskRemoteFailure(err)),
        other => Err(Error::ProtocolViolation(format!(
            "invalid status: {:?}",
            other
        ))),
    }
}
