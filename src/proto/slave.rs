//! Slave side of a master/slave connection: the accept-side mirror of
//! [`super::master`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::proto::link::{FramedLink, ObjectLink, Payload, SlaveInfo};
use crate::proto::mux::{Multiplexer, SubLink};
use crate::proto::{auth, keepalive};
use crate::tasks::TaskChannel;

pub struct SlaveSession {
    session_mux: Multiplexer,
    root: Arc<Multiplexer>,
    // Held open on purpose: the master polls this sub-link to notice when
    // the connection dies.
    _info_link: Arc<SubLink>,
}

impl std::fmt::Debug for SlaveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveSession").finish_non_exhaustive()
    }
}

impl SlaveSession {
    /// Authenticate against the master and set up the protocol stack.
    pub async fn establish(
        mut stream: TcpStream,
        password: &str,
        config: &LinkConfig,
    ) -> Result<Self> {
        auth::authenticate_slave(&mut stream, password, config).await?;
        Self::establish_preauth(stream, config).await
    }

    /// Stack setup without the handshake (loopback tests).
    pub async fn establish_preauth(stream: TcpStream, config: &LinkConfig) -> Result<Self> {
        Self::establish_preauth_with_info(stream, config, SlaveInfo::current()).await
    }

    /// Like [`Self::establish_preauth`], but reporting `info` instead of
    /// the real capabilities of this process.
    pub async fn establish_preauth_with_info(
        stream: TcpStream,
        config: &LinkConfig,
        info: SlaveInfo,
    ) -> Result<Self> {
        let link: Arc<dyn ObjectLink> = Arc::new(FramedLink::new(stream));
        let root = Arc::new(Multiplexer::listener(link));
        let result = Self::build(root.clone(), config, info).await;
        if result.is_err() {
            root.close().await;
        }
        result
    }

    async fn build(root: Arc<Multiplexer>, config: &LinkConfig, info: SlaveInfo) -> Result<Self> {
        let session = Arc::new(keepalive::accept(&root, config).await?);
        let session_mux = Multiplexer::listener(session);

        let info_link = Arc::new(session_mux.accept().await?);
        info_link.send(Payload::Info(info)).await?;

        Ok(Self {
            session_mux,
            root,
            _info_link: info_link,
        })
    }

    /// Wait for the master to start the next job. Fails once the
    /// connection is gone.
    pub async fn next_job(&self) -> Result<SlaveJob> {
        let job_link = self.session_mux.accept().await?;
        Ok(SlaveJob {
            mux: Multiplexer::listener(Arc::new(job_link)),
        })
    }

    pub async fn close(&self) {
        self.root.close().await;
    }
}

/// Slave half of one job: a stream of tasks from the master.
pub struct SlaveJob {
    mux: Multiplexer,
}

impl SlaveJob {
    /// Accept and run tasks until the master closes the job. Each task runs
    /// concurrently with `root` as its working area.
    pub async fn run_tasks(&self, root: &Path) {
        let mut handles = Vec::new();
        while let Ok(task_link) = self.mux.accept().await {
            let root = root.to_path_buf();
            handles.push(tokio::spawn(run_task(root, task_link)));
        }
        self.mux.close().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_task(root: PathBuf, task_link: SubLink) {
    let task_mux = Multiplexer::listener(Arc::new(task_link));
    if let Err(err) = serve_task(&root, &task_mux).await {
        tracing::debug!(error = %err, "task ended abnormally");
    }
    task_mux.close().await;
}

async fn serve_task(root: &Path, task_mux: &Multiplexer) -> Result<()> {
    // Accept order mirrors the master's opening order: status, data, log.
    let status = task_mux.accept().await?;
    let data = Arc::new(task_mux.accept().await?);
    let log_link = Arc::new(task_mux.accept().await?);

    let task = match data.receive().await? {
        Payload::Task(task) => task,
        other => {
            return Err(Error::ProtocolViolation(format!(
                "invalid task value: {:?}",
                other
            )))
        }
    };

    let ch = TaskChannel::slave(data.clone(), log_link.clone());
    let run_err = task.run_slave(root, &ch).await.err();
    let _ = log_link.close().await;
    let _ = data.close().await;

    match &run_err {
        Some(err) => {
            let _ = status.send(Payload::Str(err.to_string())).await;
        }
        None => {
            let _ = status.send(Payload::Nil).await;
        }
    }
    // Block for the master's final ack so the status is not lost in the
    // teardown of the task sub-links.
    let _ = status.receive().await;
    Ok(())
}
