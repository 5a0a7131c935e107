
use std::time::{Duration, Instant};

use jobrig::config::LinkConfig;
use jobrig::proto::{MasterSession, SlaveSession};
use test_harness::tcp_pair;

fn quiet(max_delay: Duration) -> LinkConfig {
    LinkConfig {
        // Effectively never pings; the other side must notice the silence.
        ping_interval: Duration::from_secs(3600),
        ping_max_delay: max_delay,
        auth_timeout: Duration::from_secs(5),
    }
}

fn patient() -> LinkConfig {
    LinkConfig {
        ping_interval: Duration::from_secs(3600),
        ping_max_delay: Duration::from_secs(3600),
        auth_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn slave_kills_the_link_when_pings_stop() {
    let (master_stream, slave_stream) = tcp_pair().await;
    let patient_cfg = patient();
    let quiet_cfg = quiet(Duration::from_millis(300));
    let (master, slave) = tokio::join!(
        MasterSession::establish_preauth(master_stream, &patient_cfg),
        SlaveSession::establish_preauth(slave_stream, &quiet_cfg),
    );
    let _master = master.unwrap();
    let slave = slave.unwrap();

    let start = Instant::now();
    assert!(slave.next_job().await.is_err());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn master_kills_the_link_when_echoes_stop() {
    let (master_stream, slave_stream) = tcp_pair().await;
    let quiet_cfg = quiet(Duration::from_millis(300));
    let patient_cfg = patient();
    let (master, slave) = tokio::join!(
        MasterSession::establish_preauth(master_stream, &quiet_cfg),
        SlaveSession::establish_preauth(slave_stream, &patient_cfg),
    );
    let master = master.unwrap();
    let _slave = slave.unwrap();

    let start = Instant::now();
    master.wait().await;
    assert!(start.elapsed() < Duration::from_secs(2));
}
