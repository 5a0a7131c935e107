//! Slave entrypoint: dial the master, authenticate, and serve jobs until
//! the connection goes away. Each job runs in its own temp directory.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::LinkConfig;
use crate::error::Result;
use crate::proto::SlaveSession;

pub async fn run_slave(host: &str, port: u16, password: &str) -> Result<()> {
    let stream = TcpStream::connect((host, port)).await?;
    let config = LinkConfig::default();
    let session = Arc::new(SlaveSession::establish(stream, password, &config).await?);
    tracing::info!(host, port, "connected to master");

    loop {
        match session.next_job().await {
            Ok(job) => {
                let session = session.clone();
                tokio::spawn(async move {
                    let root = match tempfile::Builder::new().prefix("job").tempdir() {
                        Ok(root) => root,
                        Err(err) => {
                            tracing::error!(error = %err, "failed to create job root");
                            session.close().await;
                            return;
                        }
                    };
                    job.run_tasks(root.path()).await;
                    // The TempDir cleans up the job root on drop.
                });
            }
            Err(err) => {
                tracing::info!(error = %err, "master connection closed");
                break;
            }
        }
    }
    session.close().await;
    Ok(())
}
