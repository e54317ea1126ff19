use async_trait::async_trait;
use log::debug;

use super::LivenessCheck;
use crate::config::TransportConfig;
use crate::transport::HTTP_HEALTH_PATH;
use crate::types::Address;

/// Alive iff `GET /v1/health` answers 2xx within the request timeout.
#[derive(Debug, Clone)]
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(config: &TransportConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl LivenessCheck for HttpChecker {
    async fn is_alive(&self, address: &Address) -> bool {
        let url = format!("http://{}:{}{}", address.host, address.port, HTTP_HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("HTTP probe of {} failed: {}", address, e);
                false
            }
        }
    }
}
