use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::types::{Address, ProtocolTable};

pub mod http;
pub mod udp;
pub mod websocket;

pub use http::HttpChecker;
pub use udp::UdpChecker;
pub use websocket::WebSocketChecker;

#[async_trait]
pub trait LivenessCheck: Send + Sync {
    /// Whether `address` answers right now.  Any failure, including a
    /// timeout, is reported as `false`.
    async fn is_alive(&self, address: &Address) -> bool;
}

/// Picks the probe strategy from the address's protocol.
#[derive(Clone)]
pub struct ProtocolChecker {
    strategies: ProtocolTable<Arc<dyn LivenessCheck>>,
}

impl ProtocolChecker {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            strategies: ProtocolTable {
                http: Arc::new(HttpChecker::new(config)),
                websocket: Arc::new(WebSocketChecker::new(config)),
                udp: Arc::new(UdpChecker::new(config)),
            },
        }
    }

    pub fn with_strategies(strategies: ProtocolTable<Arc<dyn LivenessCheck>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl LivenessCheck for ProtocolChecker {
    async fn is_alive(&self, address: &Address) -> bool {
        self.strategies
            .get(address.protocol)
            .is_alive(address)
            .await
    }
}
