//! Request/response transport: one HTTP POST per message.
//!
//! Best effort, at most once.  The sender does not retry and does not
//! report failures to the caller; the listener acknowledges every message
//! it could decode, whatever the callback does with it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::{
    ChatSender, Dispatcher, ListenerHandle, MessageListener, HTTP_HEALTH_PATH, HTTP_MESSAGE_PATH,
};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::types::{Address, ChatMessage, Protocol};

/// Posts each message to `http://host:port/v1/message`.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(config: &TransportConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Sends one message and returns the peer's status code.
    pub async fn post(
        &self,
        message: &ChatMessage,
        target: &Address,
    ) -> Result<reqwest::StatusCode, TransportError> {
        let url = format!("http://{}:{}{}", target.host, target.port, HTTP_MESSAGE_PATH);
        let response = self.client.post(&url).json(message).send().await?;
        Ok(response.status())
    }
}

#[async_trait]
impl ChatSender for HttpSender {
    async fn send(&self, message: &ChatMessage, target: &Address) {
        match self.post(message, target).await {
            Ok(status) if status.is_success() => {}
            Ok(status) => warn!("{} answered {} to a chat message", target, status),
            Err(e) => warn!("Failed to send message to {}: {}", target, e),
        }
    }
}

/// Stateless HTTP chat endpoint.
pub struct HttpListener;

impl HttpListener {
    /// Router for the chat endpoint, exposed for in-process testing.
    pub fn router(dispatcher: Dispatcher) -> Router {
        Router::new()
            .route(HTTP_HEALTH_PATH, get(health))
            .route(HTTP_MESSAGE_PATH, post(receive_message))
            .with_state(dispatcher)
    }

    pub async fn bind(
        addr: SocketAddr,
        listener: Arc<dyn MessageListener>,
        config: &TransportConfig,
    ) -> Result<ListenerHandle, TransportError> {
        let dispatcher = Dispatcher::new(listener, config.callback_timeout);
        let app = Self::router(dispatcher);

        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        info!("HTTP chat listener on http://{}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(tcp, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("HTTP chat listener failed: {}", e);
            }
        });

        Ok(ListenerHandle::new(
            Protocol::Http,
            local_addr,
            shutdown_tx,
            task,
            config.shutdown_grace,
        ))
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn receive_message(State(dispatcher): State<Dispatcher>, body: Bytes) -> Response {
    match serde_json::from_slice::<ChatMessage>(&body) {
        Ok(message) => {
            dispatcher.deliver(message).await;
            Json(json!({ "status": "ok" })).into_response()
        }
        Err(e) => {
            warn!("Dropping undecodable HTTP chat message: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::net::Ipv4Addr;

    async fn start(
        listener: Arc<dyn MessageListener>,
    ) -> (ListenerHandle, Address, HttpSender) {
        let config = TransportConfig::default();
        let handle = HttpListener::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            listener,
            &config,
        )
        .await
        .unwrap();
        let target = Address::new(Protocol::Http, Ipv4Addr::LOCALHOST, handle.local_addr().port());
        (handle, target, HttpSender::new(&config))
    }

    #[tokio::test]
    async fn delivers_message() {
        let (collector, mut rx) = Collector::new();
        let (handle, target, sender) = start(collector).await;

        let message = ChatMessage::new("pupkin", "welcome to the club buddy");
        sender.send(&message, &target).await;
        assert_eq!(recv(&mut rx).await, message);

        handle.stop().await;
    }

    #[tokio::test]
    async fn callback_error_still_acknowledged_and_next_message_delivered() {
        let (collector, mut rx) = Collector::failing_on("bad", "boom");
        let (handle, target, sender) = start(collector).await;

        let status = sender
            .post(&ChatMessage::new("a", "bad"), &target)
            .await
            .unwrap();
        assert!(status.is_success());
        let status = sender
            .post(&ChatMessage::new("a", "boom"), &target)
            .await
            .unwrap();
        assert!(status.is_success());

        sender.send(&ChatMessage::new("a", "good"), &target).await;
        assert_eq!(recv(&mut rx).await.text, "good");

        handle.stop().await;
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_does_not_fail() {
        let sender = HttpSender::new(&TransportConfig::default());
        // Nothing listens on port 9 (discard) on loopback in the test environment.
        let target = Address::new(Protocol::Http, Ipv4Addr::LOCALHOST, 9);
        sender.send(&ChatMessage::new("a", "lost"), &target).await;
    }

    #[tokio::test]
    async fn stop_releases_port() {
        let (collector, _rx) = Collector::new();
        let (handle, _target, _sender) = start(collector).await;
        let addr = handle.local_addr();
        handle.stop().await;
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
