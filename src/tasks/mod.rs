//! Units of work. A task has a master half and a slave half; the halves
//! talk over a dedicated data sub-link and log through the task's log
//! sub-link. EOF on the data sub-link means "die now" for both halves.

pub mod file_transfer;
pub mod run_program;
pub mod terminate;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use file_transfer::FileTransfer;
pub use run_program::RunProgram;
pub use terminate::Terminate;

use crate::error::Result;
use crate::proto::link::{LogEntry, ObjectLink, Payload};
use crate::proto::mux::SubLink;

/// Payloads larger than this are split into chunks on the wire.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

/// The closed set of task kinds. Serialized both on the wire (bincode) and
/// in the job pool (JSON, as `{"FileTransfer": {...}}` and friends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskSpec {
    FileTransfer(FileTransfer),
    RunProgram(RunProgram),
    Terminate(Terminate),
}

impl TaskSpec {
    pub async fn run_master(&self, ch: &TaskChannel) -> Result<()> {
        match self {
            TaskSpec::FileTransfer(task) => task.run_master(ch).await,
            TaskSpec::RunProgram(task) => task.run_master(ch).await,
            TaskSpec::Terminate(task) => task.run_master(ch).await,
        }
    }

    pub async fn run_slave(&self, root: &Path, ch: &TaskChannel) -> Result<()> {
        match self {
            TaskSpec::FileTransfer(task) => task.run_slave(root, ch).await,
            TaskSpec::RunProgram(task) => task.run_slave(root, ch).await,
            TaskSpec::Terminate(task) => task.run_slave(root, ch).await,
        }
    }
}

#[derive(Clone)]
enum LogSink {
    /// Master side: feed the admin-owned log channel, if any.
    Master(Option<mpsc::Sender<LogEntry>>),
    /// Slave side: forward over the task's log sub-link.
    Slave(Arc<SubLink>),
}

/// What a task half holds while running: the data sub-link plus the
/// side-appropriate way to emit log lines.
#[derive(Clone)]
pub struct TaskChannel {
    data: Arc<SubLink>,
    log: LogSink,
}

impl TaskChannel {
    pub(crate) fn master(data: Arc<SubLink>, log: Option<mpsc::Sender<LogEntry>>) -> Self {
        Self {
            data,
            log: LogSink::Master(log),
        }
    }

    pub(crate) fn slave(data: Arc<SubLink>, log: Arc<SubLink>) -> Self {
        Self {
            data,
            log: LogSink::Slave(log),
        }
    }

    /// Send a message to the other half.
    pub async fn send(&self, msg: Payload) -> Result<()> {
        self.data.send(msg).await
    }

    /// Receive the next message from the other half. Fails with an EOF
    /// error once the other half is done.
    pub async fn receive(&self) -> Result<Payload> {
        self.data.receive().await
    }

    /// Record a log line. Log delivery is best-effort and never fails the
    /// task.
    pub async fn log(&self, message: impl Into<String>) {
        let message = message.into();
        match &self.log {
            LogSink::Master(Some(sink)) => {
                let _ = sink
                    .send(LogEntry {
                        from_master: true,
                        message,
                    })
                    .await;
            }
            LogSink::Master(None) => {}
            LogSink::Slave(link) => {
                let _ = link.send(Payload::Str(message)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_json_uses_one_field_per_kind() {
        let task = TaskSpec::FileTransfer(FileTransfer {
            to_slave: true,
            master_path: "/tmp/a".into(),
            slave_path: "b".into(),
        });
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.starts_with("{\"FileTransfer\":"));

        let back: TaskSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);

        let exit: TaskSpec = serde_json::from_str("{\"Terminate\":{}}").unwrap();
        assert_eq!(exit, TaskSpec::Terminate(Terminate {}));
    }

    #[test]
    fn unknown_task_kind_is_rejected() {
        assert!(serde_json::from_str::<TaskSpec>("{\"Reboot\":{}}").is_err());
    }
}
