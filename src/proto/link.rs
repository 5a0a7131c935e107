use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::tasks::TaskSpec;

/// Upper bound on a single frame body. Anything larger is treated as a
/// protocol violation rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// One line of logged output from either end of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub from_master: bool,
    pub message: String,
}

/// Capability record a slave reports right after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub num_cpu: u32,
    pub max_procs: u32,
    pub os: String,
    pub arch: String,
}

impl SlaveInfo {
    /// Capabilities of the current process.
    pub fn current() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            num_cpu: cpus,
            max_procs: cpus,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// The closed set of values that may travel over a link.
///
/// Every layer of the stack speaks this union; receiving a variant a layer
/// does not expect is a protocol violation there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Frame(Frame),
    Info(SlaveInfo),
    Task(TaskSpec),
    Log(LogEntry),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
    Nil,
}

/// Multiplexer frame: routes a payload to a sub-link, or manages the
/// sub-link's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: i64,
    pub new: bool,
    pub close: bool,
    pub close_ack: bool,
    pub payload: Option<Box<Payload>>,
}

impl Frame {
    pub fn open(id: i64) -> Self {
        Self {
            id,
            new: true,
            close: false,
            close_ack: false,
            payload: None,
        }
    }

    pub fn shut(id: i64) -> Self {
        Self {
            id,
            new: false,
            close: true,
            close_ack: false,
            payload: None,
        }
    }

    pub fn shut_ack(id: i64) -> Self {
        Self {
            id,
            new: false,
            close: false,
            close_ack: true,
            payload: None,
        }
    }

    pub fn data(id: i64, payload: Payload) -> Self {
        Self {
            id,
            new: false,
            close: false,
            close_ack: false,
            payload: Some(Box::new(payload)),
        }
    }
}

/// A bidirectional, typed object stream.
///
/// `send` and `receive` may be called concurrently with each other; each
/// direction is serialized internally. After `close`, both directions fail
/// terminally.
#[async_trait]
pub trait ObjectLink: Send + Sync + 'static {
    async fn send(&self, value: Payload) -> Result<()>;
    async fn receive(&self) -> Result<Payload>;
    async fn close(&self) -> Result<()>;
}

/// Root of the stack: length-prefixed bincode frames over a TCP stream.
pub struct FramedLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl FramedLink {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    fn dead(err: std::io::Error) -> Error {
        Error::LinkDead(err.to_string())
    }
}

#[async_trait]
impl ObjectLink for FramedLink {
    async fn send(&self, value: Payload) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::LinkDead("link closed".into()));
        }
        let body =
            bincode::serialize(&value).map_err(|e| Error::ProtocolViolation(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .map_err(Self::dead)?;
        writer.write_all(&body).await.map_err(Self::dead)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Payload> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::LinkDead("link closed".into()));
        }
        let mut reader = self.reader.lock().await;
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(Self::dead)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::ProtocolViolation(format!(
                "frame of {} bytes exceeds limit",
                len
            )));
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(Self::dead)?;
        bincode::deserialize(&body).map_err(|e| Error::ProtocolViolation(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.writer.lock().await.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (FramedLink, FramedLink) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        });
        (
            FramedLink::new(client.unwrap()),
            FramedLink::new(server.unwrap()),
        )
    }

    #[tokio::test]
    async fn sends_typed_values_across_a_socket() {
        let (a, b) = loopback_pair().await;

        a.send(Payload::Str("hello".into())).await.unwrap();
        a.send(Payload::Frame(Frame::data(3, Payload::Int(42))))
            .await
            .unwrap();

        assert_eq!(b.receive().await.unwrap(), Payload::Str("hello".into()));
        match b.receive().await.unwrap() {
            Payload::Frame(f) => {
                assert_eq!(f.id, 3);
                assert_eq!(f.payload, Some(Box::new(Payload::Int(42))));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_fails_both_directions() {
        let (a, b) = loopback_pair().await;
        a.close().await.unwrap();
        assert!(a.send(Payload::Nil).await.is_err());
        assert!(a.receive().await.is_err());
        // The peer observes end of stream as a dead link.
        assert!(b.receive().await.is_err());
    }
}
