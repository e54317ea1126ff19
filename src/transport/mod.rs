//! Chat transports.
//!
//! Every protocol comes as a sender and a listener.  Senders implement
//! [`ChatSender`] and never report failures to the caller: a message that
//! cannot be delivered is logged and dropped.  Listeners decode inbound
//! payloads and hand each [`ChatMessage`] to one [`MessageListener`]
//! through a [`Dispatcher`], which runs the callback in its own task under
//! a timeout so a slow or failing callback cannot stall the listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::types::{Address, ChatMessage, Protocol, ProtocolTable};

pub mod http;
pub mod udp;
pub mod websocket;

pub use self::http::{HttpListener, HttpSender};
pub use self::udp::{UdpListener, UdpSender};
pub use self::websocket::{ConnectionState, WebSocketListener, WebSocketSender};

/// Path of the HTTP chat endpoint.
pub const HTTP_MESSAGE_PATH: &str = "/v1/message";
/// Path of the HTTP health endpoint probed by the registry.
pub const HTTP_HEALTH_PATH: &str = "/v1/health";
/// Path of the WebSocket chat endpoint.
pub const WS_MESSAGE_PATH: &str = "/v1/ws/message";
/// Text frame a WebSocket listener sends after every message.
pub const WS_ACK: &str = "OK";

/// Receives decoded chat messages.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn message_received(&self, message: ChatMessage) -> anyhow::Result<()>;
}

/// Sends chat messages to a peer.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, message: &ChatMessage, target: &Address);
}

/// Runs the message callback with fault isolation.
#[derive(Clone)]
pub struct Dispatcher {
    listener: Arc<dyn MessageListener>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(listener: Arc<dyn MessageListener>, timeout: Duration) -> Self {
        Self { listener, timeout }
    }

    /// Delivers one message.  Errors, panics and timeouts of the callback
    /// are logged here and go no further.
    pub async fn deliver(&self, message: ChatMessage) {
        let listener = Arc::clone(&self.listener);
        let timeout = self.timeout;
        let user = message.user.clone();

        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, listener.message_received(message)).await
        });

        match task.await {
            Ok(Ok(Ok(()))) => debug!("Delivered message from {}", user),
            Ok(Ok(Err(e))) => error!("Message callback failed for {}: {:#}", user, e),
            Ok(Err(_)) => warn!(
                "Message callback for {} did not finish within {:?}",
                user, timeout
            ),
            Err(e) => error!("Message callback for {} panicked: {}", user, e),
        }
    }
}

/// A running listener.  Dropping the handle without calling
/// [`ListenerHandle::stop`] leaves the listener running.
#[derive(Debug)]
pub struct ListenerHandle {
    protocol: Protocol,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    grace: Duration,
}

impl ListenerHandle {
    pub(crate) fn new(
        protocol: Protocol,
        local_addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
        grace: Duration,
    ) -> Self {
        Self {
            protocol,
            local_addr,
            shutdown: Some(shutdown),
            task,
            grace,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The bound socket address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new work, waits up to the grace period for in-flight
    /// work and then releases the socket.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(self.grace, &mut self.task).await {
            Ok(Ok(())) => info!("{} listener on {} stopped", self.protocol, self.local_addr),
            Ok(Err(e)) => error!("{} listener task failed: {}", self.protocol, e),
            Err(_) => {
                warn!(
                    "{} listener on {} did not drain within {:?}, aborting",
                    self.protocol, self.local_addr, self.grace
                );
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
    }
}

/// One sender per protocol, picked by the target address.
#[derive(Clone)]
pub struct Transports {
    senders: ProtocolTable<Arc<dyn ChatSender>>,
}

impl Transports {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            senders: ProtocolTable {
                http: Arc::new(HttpSender::new(config)),
                websocket: Arc::new(WebSocketSender::new(config)),
                udp: Arc::new(UdpSender::new(config)),
            },
        }
    }

    pub fn with_senders(senders: ProtocolTable<Arc<dyn ChatSender>>) -> Self {
        Self { senders }
    }

    pub fn sender(&self, protocol: Protocol) -> &Arc<dyn ChatSender> {
        self.senders.get(protocol)
    }

    pub async fn send(&self, message: &ChatMessage, target: &Address) {
        self.sender(target.protocol).send(message, target).await
    }
}

/// Starts the listener for `protocol` on `addr`.
pub async fn bind_listener(
    protocol: Protocol,
    addr: SocketAddr,
    listener: Arc<dyn MessageListener>,
    config: &TransportConfig,
) -> Result<ListenerHandle, TransportError> {
    match protocol {
        Protocol::Http => HttpListener::bind(addr, listener, config).await,
        Protocol::Websocket => WebSocketListener::bind(addr, listener, config).await,
        Protocol::Udp => UdpListener::bind(addr, listener, config).await,
    }
}
