//! Mutual challenge-response authentication, run on the raw TCP stream
//! before any framing begins.

use rand::RngCore;
use sha2::{Digest, Sha512};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::LinkConfig;
use crate::error::{Error, Result};

const CHALLENGE_SIZE: usize = 32;
const DIGEST_SIZE: usize = 64;

/// Master side: challenge first (seq 0), answer second (seq 1).
pub async fn authenticate_master(
    stream: &mut TcpStream,
    password: &str,
    config: &LinkConfig,
) -> Result<()> {
    run_with_deadline(config, stream, password, true).await
}

/// Slave side: answer first (seq 0), challenge second (seq 1).
pub async fn authenticate_slave(
    stream: &mut TcpStream,
    password: &str,
    config: &LinkConfig,
) -> Result<()> {
    run_with_deadline(config, stream, password, false).await
}

async fn run_with_deadline(
    config: &LinkConfig,
    stream: &mut TcpStream,
    password: &str,
    challenger_first: bool,
) -> Result<()> {
    let exchange = async {
        if challenger_first {
            send_challenge(0, stream, password).await?;
            answer_challenge(1, stream, password).await
        } else {
            answer_challenge(0, stream, password).await?;
            send_challenge(1, stream, password).await
        }
    };
    let result = match timeout(config.auth_timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::LinkDead("authentication timed out".into())),
    };
    if result.is_err() {
        let _ = stream.shutdown().await;
    }
    result
}

async fn send_challenge(seq: u8, stream: &mut TcpStream, password: &str) -> Result<()> {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);
    stream.write_all(&challenge).await?;

    let expected = challenge_response(seq, password, &challenge);
    let mut actual = [0u8; DIGEST_SIZE];
    stream.read_exact(&mut actual).await?;

    if actual == expected {
        stream.write_all(&[1]).await?;
        Ok(())
    } else {
        let _ = stream.write_all(&[0]).await;
        Err(Error::AuthRejected)
    }
}

async fn answer_challenge(seq: u8, stream: &mut TcpStream, password: &str) -> Result<()> {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    stream.read_exact(&mut challenge).await?;

    let response = challenge_response(seq, password, &challenge);
    stream.write_all(&response).await?;

    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await?;
    if status[0] == 1 {
        Ok(())
    } else {
        Err(Error::AuthRejected)
    }
}

// The seq byte must be separated from the challenge (here by the password):
// otherwise a malicious peer could replay one direction's challenge as the
// other's with the seq tacked on.
fn challenge_response(seq: u8, password: &str, challenge: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update([seq]);
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    digest
}
