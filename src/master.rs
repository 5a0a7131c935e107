//! Master entrypoint: listen for slaves, wire them into the scheduler, and
//! drain gracefully on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admin::{LiveMaster, Scheduler};
use crate::config::LinkConfig;
use crate::error::Result;
use crate::proto::MasterSession;
use crate::store::JobStore;

pub struct MasterOpts {
    pub slave_port: u16,
    pub admin_port: u16,
    pub slave_password: String,
    /// Consumed by the admin surface; the core only carries it.
    pub admin_password: String,
    pub jobs_path: PathBuf,
}

/// Run the master until `shutdown` fires, then drain.
pub async fn run_master(opts: MasterOpts, shutdown: CancellationToken) -> Result<()> {
    let store = JobStore::new(&opts.jobs_path);
    let jobs = store.load().await?;

    let slave_listener = TcpListener::bind(("0.0.0.0", opts.slave_port)).await?;
    let admin_listener = TcpListener::bind(("0.0.0.0", opts.admin_port)).await?;
    tracing::info!(
        slave_port = opts.slave_port,
        admin_port = opts.admin_port,
        jobs = jobs.len(),
        "master listening"
    );

    let scheduler = Arc::new(Scheduler::new());
    scheduler.set_jobs(jobs).await?;

    let accept_scheduler = scheduler.clone();
    let password = opts.slave_password.clone();
    tokio::spawn(async move {
        let config = LinkConfig::default();
        loop {
            let Ok((stream, addr)) = slave_listener.accept().await else {
                return;
            };
            if accept_scheduler.terminated() {
                return;
            }
            let scheduler = accept_scheduler.clone();
            let password = password.clone();
            let config = config.clone();
            tokio::spawn(async move {
                match MasterSession::establish(stream, &password, &config).await {
                    Ok(session) => {
                        tracing::info!(slave = %addr, "slave joined");
                        let _ = scheduler
                            .add_master(LiveMaster::spawn(session), false)
                            .await;
                    }
                    Err(err) => {
                        tracing::warn!(slave = %addr, error = %err, "slave failed to join");
                    }
                }
            });
        }
    });

    // The admin UI is a separate surface; the core still owns the port so
    // a second master cannot bind it out from under the operator.
    tokio::spawn(async move {
        while let Ok((_conn, addr)) = admin_listener.accept().await {
            tracing::debug!(admin = %addr, "admin connection dropped (no UI attached)");
        }
    });

    shutdown.cancelled().await;
    tracing::info!("shutting down");
    scheduler.terminate();
    scheduler.wait(None).await;
    Ok(())
}
