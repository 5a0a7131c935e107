use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::proto::link::Payload;
use crate::tasks::{TaskChannel, TRANSFER_CHUNK};

/// Ships an executable to the slave and runs it there.
///
/// The slave reports its platform first; the master resolves a prebuilt
/// executable for it (`source` is either the executable itself or a
/// directory holding per-platform builds named `<os>-<arch>`), streams the
/// bytes, and sends the argument vector. The slave runs the program with
/// its task root as working directory and forwards stdout/stderr line by
/// line into the task log. If the task channel dies while the program is
/// running, the program is killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgram {
    pub source: String,
    pub args: Vec<String>,
}

impl RunProgram {
    pub(crate) async fn run_master(&self, ch: &TaskChannel) -> Result<()> {
        let platform = match ch.receive().await? {
            Payload::StrList(pair) if pair.len() == 2 => pair,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid platform info: {:?}",
                    other
                )))
            }
        };

        let path = self.resolve(&platform[0], &platform[1]);
        let executable = fs::read(&path).await.map_err(|e| {
            Error::TaskLocalFailure(format!("read executable {}: {}", path.display(), e))
        })?;

        ch.send(Payload::Int(executable.len() as i64)).await?;
        for chunk in executable.chunks(TRANSFER_CHUNK) {
            ch.send(Payload::Bytes(chunk.to_vec())).await?;
        }
        ch.send(Payload::StrList(self.args.clone())).await?;

        // Block until the slave reports completion (or dies).
        let _ = ch.receive().await;
        Ok(())
    }

    fn resolve(&self, os: &str, arch: &str) -> PathBuf {
        let source = Path::new(&self.source);
        if source.is_dir() {
            source.join(format!("{}-{}", os, arch))
        } else {
            source.to_path_buf()
        }
    }

    pub(crate) async fn run_slave(&self, root: &Path, ch: &TaskChannel) -> Result<()> {
        ch.send(Payload::StrList(vec![
            std::env::consts::OS.to_string(),
            std::env::consts::ARCH.to_string(),
        ]))
        .await?;

        let size = match ch.receive().await? {
            Payload::Int(n) if n >= 0 => n as usize,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid executable size: {:?}",
                    other
                )))
            }
        };
        let mut executable = Vec::with_capacity(size);
        while executable.len() < size {
            match ch.receive().await? {
                Payload::Bytes(chunk) => executable.extend_from_slice(&chunk),
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "invalid executable data: {:?}",
                        other
                    )))
                }
            }
        }
        let args = match ch.receive().await? {
            Payload::StrList(args) => args,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid argument vector: {:?}",
                    other
                )))
            }
        };

        let exe_path = root.join(format!("{:016x}", rand::random::<u64>()));
        fs::write(&exe_path, &executable).await?;
        set_executable(&exe_path).await?;

        let run = run_child(root, &exe_path, &args, ch).await;
        let _ = fs::remove_file(&exe_path).await;
        run?;

        // Tell the master we are done before the status exchange begins.
        let _ = ch.send(Payload::Nil).await;
        Ok(())
    }
}

async fn run_child(root: &Path, exe: &Path, args: &[String], ch: &TaskChannel) -> Result<()> {
    let mut child = Command::new(exe)
        .args(args)
        .current_dir(root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::TaskLocalFailure(format!("start executable: {}", e)))?;

    let out_pump = spawn_line_pump(child.stdout.take(), ch.clone());
    let err_pump = spawn_line_pump(child.stderr.take(), ch.clone());

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| Error::TaskLocalFailure(format!("wait for executable: {}", e)))?
        }
        // The job or the whole session died underneath us.
        _ = ch.receive() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = out_pump.await;
            let _ = err_pump.await;
            return Err(Error::TaskLocalFailure(
                "program killed: task channel closed".into(),
            ));
        }
    };
    let _ = out_pump.await;
    let _ = err_pump.await;

    if status.success() {
        Ok(())
    } else {
        Err(Error::TaskLocalFailure(format!(
            "executable exited with {}",
            status
        )))
    }
}

fn spawn_line_pump<R>(reader: Option<R>, ch: TaskChannel) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            ch.log(line).await;
        }
    })
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_platform_builds_inside_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let task = RunProgram {
            source: dir.path().to_string_lossy().into_owned(),
            args: vec![],
        };
        assert_eq!(
            task.resolve("linux", "x86_64"),
            dir.path().join("linux-x86_64")
        );

        let file = RunProgram {
            source: "/usr/bin/true".into(),
            args: vec![],
        };
        assert_eq!(file.resolve("linux", "x86_64"), Path::new("/usr/bin/true"));
    }
}
