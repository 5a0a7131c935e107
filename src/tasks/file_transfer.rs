use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::proto::link::Payload;
use crate::tasks::{TaskChannel, TRANSFER_CHUNK};

/// Copies one file between master and slave, in either direction.
///
/// The sender announces the total length, then streams chunks. The receiver
/// writes to a sibling temp path and renames into place only after the
/// length checks out, so a dead connection never leaves a truncated file at
/// the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub to_slave: bool,
    pub master_path: String,
    pub slave_path: String,
}

impl FileTransfer {
    pub(crate) async fn run_master(&self, ch: &TaskChannel) -> Result<()> {
        let path = Path::new(&self.master_path);
        if self.to_slave {
            send_file(path, ch).await
        } else {
            receive_file(path, ch).await
        }
    }

    pub(crate) async fn run_slave(&self, root: &Path, ch: &TaskChannel) -> Result<()> {
        let path = root.join(&self.slave_path);
        if self.to_slave {
            receive_file(&path, ch).await
        } else {
            send_file(&path, ch).await
        }
    }
}

async fn send_file(path: &Path, ch: &TaskChannel) -> Result<()> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    ch.log(format!("sending file of length {}", len)).await;
    ch.send(Payload::Int(len as i64)).await?;

    let mut buf = vec![0u8; TRANSFER_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        ch.send(Payload::Bytes(buf[..n].to_vec())).await?;
    }
}

async fn receive_file(path: &Path, ch: &TaskChannel) -> Result<()> {
    let temp = sibling_temp_path(path);
    let result = receive_into(&temp, path, ch).await;
    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}

async fn receive_into(temp: &Path, dest: &Path, ch: &TaskChannel) -> Result<()> {
    let mut file = fs::File::create(temp).await?;

    let size = match ch.receive().await? {
        Payload::Int(n) if n >= 0 => n as u64,
        other => {
            return Err(Error::ProtocolViolation(format!(
                "invalid file size: {:?}",
                other
            )))
        }
    };
    ch.log(format!("receiving file of length {}", size)).await;

    let mut written = 0u64;
    loop {
        match ch.receive().await {
            Ok(Payload::Bytes(chunk)) => {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            Ok(other) => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid file data: {:?}",
                    other
                )))
            }
            // Sender closed (or the link died): the length check below
            // decides whether the transfer was complete.
            Err(_) => break,
        }
    }

    if written != size {
        return Err(Error::TaskLocalFailure(format!(
            "received {} bytes (expected {})",
            written, size
        )));
    }
    file.flush().await?;
    drop(file);
    fs::rename(temp, dest).await?;
    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}", rand::random::<u64>()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_stays_in_the_destination_directory() {
        let temp = sibling_temp_path(Path::new("/data/out/result"));
        assert_eq!(temp.parent(), Some(Path::new("/data/out")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("result."));
    }
}
