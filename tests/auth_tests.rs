
use std::time::Duration;

use jobrig::error::Error;
use jobrig::proto::{MasterSession, SlaveSession};
use test_harness::{fast_config, tcp_pair};

#[tokio::test]
async fn matching_passwords_establish_a_session() {
    let config = fast_config();
    let (master_stream, slave_stream) = tcp_pair().await;
    let (master, slave) = tokio::join!(
        MasterSession::establish(master_stream, "sesame", &config),
        SlaveSession::establish(slave_stream, "sesame", &config),
    );
    let master = master.unwrap();
    let _slave = slave.unwrap();
    assert_eq!(master.slave_info().os, std::env::consts::OS);
    master.close().await;
}

#[tokio::test]
async fn mismatched_passwords_are_rejected_on_both_ends() {
    let config = fast_config();
    let (master_stream, slave_stream) = tcp_pair().await;
    let (master, slave) = tokio::join!(
        MasterSession::establish(master_stream, "a", &config),
        SlaveSession::establish(slave_stream, "b", &config),
    );
    assert!(matches!(master.unwrap_err(), Error::AuthRejected));
    assert!(matches!(slave.unwrap_err(), Error::AuthRejected));
}

#[tokio::test]
async fn handshake_times_out_on_a_silent_peer() {
    let mut config = fast_config();
    config.auth_timeout = Duration::from_millis(200);
    // The peer holds the socket open but never answers the challenge.
    let (master_stream, _silent) = tcp_pair().await;
    let err = MasterSession::establish(master_stream, "x", &config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LinkDead(_)));
}
