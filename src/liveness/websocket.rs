use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::LivenessCheck;
use crate::config::TransportConfig;
use crate::transport::WS_MESSAGE_PATH;
use crate::types::Address;

/// Alive iff the WebSocket handshake completes; nothing is sent.
#[derive(Debug, Clone)]
pub struct WebSocketChecker {
    timeout: Duration,
}

impl WebSocketChecker {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl LivenessCheck for WebSocketChecker {
    async fn is_alive(&self, address: &Address) -> bool {
        let url = format!("ws://{}:{}{}", address.host, address.port, WS_MESSAGE_PATH);
        match tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
        {
            Ok(Ok((mut stream, _response))) => {
                let _ = stream.close(None).await;
                true
            }
            Ok(Err(e)) => {
                debug!("WebSocket probe of {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("WebSocket probe of {} timed out", address);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::Collector;
    use crate::transport::WebSocketListener;
    use crate::types::Protocol;
    use std::net::{Ipv4Addr, SocketAddr};

    #[tokio::test]
    async fn handshake_decides_liveness() {
        let config = TransportConfig {
            request_timeout: Duration::from_millis(500),
            ..TransportConfig::default()
        };
        let (collector, mut rx) = Collector::new();
        let handle = WebSocketListener::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            collector,
            &config,
        )
        .await
        .unwrap();
        let address = Address::new(
            Protocol::Websocket,
            Ipv4Addr::LOCALHOST,
            handle.local_addr().port(),
        );

        let checker = WebSocketChecker::new(&config);
        assert!(checker.is_alive(&address).await);
        // the probe exchanged no payload
        assert!(rx.try_recv().is_err());

        handle.stop().await;
        assert!(!checker.is_alive(&address).await);
    }
}
