//! Liveness probing over the first sub-link of the root multiplexer.
//!
//! The connector pings, the listener echoes, and both sides run a silence
//! watchdog: a dropped connection is detected within `ping_max_delay` on
//! either end, not just the one that happens to be sending.

use std::sync::Arc;

use tokio::time::{interval, timeout};

use crate::config::LinkConfig;
use crate::error::Result;
use crate::proto::link::{ObjectLink, Payload};
use crate::proto::mux::{Multiplexer, SubLink};

/// Connector side: open the ping sub-link, start probing, then open and
/// return the session sub-link.
pub async fn connect(mux: &Arc<Multiplexer>, config: &LinkConfig) -> Result<SubLink> {
    let ping = Arc::new(mux.connect().await?);

    let pinger = ping.clone();
    let mut tick = interval(config.ping_interval);
    tokio::spawn(async move {
        loop {
            tick.tick().await;
            if pinger.send(Payload::Nil).await.is_err() {
                break;
            }
        }
    });

    spawn_watchdog(ping, mux.clone(), config, false);
    mux.connect().await
}

/// Listener side: accept the ping sub-link, start the echo watchdog, then
/// accept and return the session sub-link.
pub async fn accept(mux: &Arc<Multiplexer>, config: &LinkConfig) -> Result<SubLink> {
    let ping = Arc::new(mux.accept().await?);
    spawn_watchdog(ping, mux.clone(), config, true);
    mux.accept().await
}

fn spawn_watchdog(ping: Arc<SubLink>, mux: Arc<Multiplexer>, config: &LinkConfig, echo: bool) {
    let max_delay = config.ping_max_delay;
    tokio::spawn(async move {
        loop {
            match timeout(max_delay, ping.receive()).await {
                Ok(Ok(_)) => {
                    if echo && ping.send(Payload::Nil).await.is_err() {
                        break;
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!("keepalive expired, closing link");
                    mux.close().await;
                    break;
                }
            }
        }
    });
}
