use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;

use super::LivenessCheck;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::transport::udp::{connect_socket, ProbeRequest};
use crate::types::Address;

/// Challenge-response probe over UDP.
///
/// Sends `CHECK ID=<nonce> ADDRESS=<callback>` and expects the nonce back
/// as a 4-byte big-endian integer.  Only the local socket setup is retried;
/// the challenge itself is sent once.
#[derive(Debug, Clone)]
pub struct UdpChecker {
    timeout: Duration,
    bind_attempts: u32,
}

impl UdpChecker {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            timeout: config.request_timeout,
            bind_attempts: config.bind_attempts,
        }
    }

    async fn challenge(&self, address: &Address, nonce: i32) -> Result<bool, TransportError> {
        let socket = connect_socket(address.socket_addr(), self.bind_attempts).await?;
        let probe = ProbeRequest {
            nonce,
            callback: Some(socket.local_addr()?),
        };
        socket.send(probe.to_string().as_bytes()).await?;

        let mut reply = [0u8; 8];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut reply))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        let bytes: [u8; 4] = reply
            .get(..len)
            .and_then(|r| r.try_into().ok())
            .ok_or_else(|| TransportError::Malformed(format!("{len}-byte probe reply")))?;
        Ok(i32::from_be_bytes(bytes) == nonce)
    }
}

#[async_trait]
impl LivenessCheck for UdpChecker {
    async fn is_alive(&self, address: &Address) -> bool {
        let nonce = rand::thread_rng().gen_range(0..i32::MAX);
        match self.challenge(address, nonce).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!("UDP probe of {} failed: {}", address, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::Collector;
    use crate::transport::UdpListener;
    use crate::types::Protocol;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Instant;
    use tokio::net::UdpSocket;

    fn quick() -> TransportConfig {
        TransportConfig {
            request_timeout: Duration::from_millis(300),
            ..TransportConfig::default()
        }
    }

    /// Answers every datagram with a fixed reply.
    async fn fake_peer(reply: Vec<u8>) -> (Address, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&reply, from).await;
            }
        });
        (Address::new(Protocol::Udp, Ipv4Addr::LOCALHOST, port), task)
    }

    #[tokio::test]
    async fn chat_listener_answers_challenge() {
        let (collector, _rx) = Collector::new();
        let handle = UdpListener::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            collector,
            &quick(),
        )
        .await
        .unwrap();
        let address = Address::new(Protocol::Udp, Ipv4Addr::LOCALHOST, handle.local_addr().port());

        let checker = UdpChecker::new(&quick());
        for _ in 0..5 {
            assert!(checker.is_alive(&address).await);
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn wrong_nonce_is_not_alive() {
        let (address, task) = fake_peer((-1i32).to_be_bytes().to_vec()).await;
        assert!(!UdpChecker::new(&quick()).is_alive(&address).await);
        task.abort();
    }

    #[tokio::test]
    async fn short_reply_is_not_alive() {
        let (address, task) = fake_peer(vec![1, 2]).await;
        assert!(!UdpChecker::new(&quick()).is_alive(&address).await);
        task.abort();
    }

    #[tokio::test]
    async fn silent_peer_is_not_alive_within_timeout() {
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let address = Address::new(
            Protocol::Udp,
            Ipv4Addr::LOCALHOST,
            silent.local_addr().unwrap().port(),
        );

        let started = Instant::now();
        assert!(!UdpChecker::new(&quick()).is_alive(&address).await);
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(silent);
    }
}
