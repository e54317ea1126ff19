//! Persistent-socket transport over WebSocket text frames.
//!
//! The sender keeps at most one connection per destination.  A connection
//! is opened by the first send, reused by the following ones and closed
//! after a period without sends:
//!
//! ```text
//! Closed --send--> Opening --handshake--> Open --idle--> Closed
//! ```
//!
//! Messages are queued per destination and written in order; sends that
//! arrive while the handshake is in progress wait in the same queue.  The
//! listener acknowledges every frame with [`WS_ACK`]; the acknowledgement
//! says the connection is alive, not that a given payload was handled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ChatSender, Dispatcher, ListenerHandle, MessageListener, WS_ACK, WS_MESSAGE_PATH};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::types::{Address, ChatMessage, Protocol};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of an outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

struct Connection {
    id: u64,
    queue: mpsc::UnboundedSender<ChatMessage>,
    state: watch::Receiver<ConnectionState>,
}

struct Inner {
    connections: Mutex<HashMap<SocketAddr, Connection>>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    next_id: AtomicU64,
    opened: AtomicU64,
}

impl Inner {
    fn connections(&self) -> MutexGuard<'_, HashMap<SocketAddr, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the map entry for `target` if it still belongs to connection `id`.
    fn forget(&self, target: SocketAddr, id: u64) {
        let mut connections = self.connections();
        if connections.get(&target).is_some_and(|c| c.id == id) {
            connections.remove(&target);
        }
    }
}

/// Lazily connecting, connection-reusing WebSocket sender.
#[derive(Clone)]
pub struct WebSocketSender {
    inner: Arc<Inner>,
}

impl WebSocketSender {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                connect_timeout: config.request_timeout,
                idle_timeout: config.idle_timeout,
                next_id: AtomicU64::new(0),
                opened: AtomicU64::new(0),
            }),
        }
    }

    /// Queues `message` for `target`, opening a connection if none exists.
    pub fn enqueue(&self, message: ChatMessage, target: &Address) {
        let key = target.socket_addr();
        let mut message = message;
        let mut connections = self.inner.connections();

        if let Some(connection) = connections.get(&key) {
            match connection.queue.send(message) {
                Ok(()) => return,
                // connection task already gone; the entry is replaced below
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Opening);
        // the receiver is alive until the task below starts, so this cannot fail
        let _ = queue_tx.send(message);
        connections.insert(
            key,
            Connection {
                id,
                queue: queue_tx,
                state: state_rx,
            },
        );
        drop(connections);

        tokio::spawn(run_connection(
            Arc::clone(&self.inner),
            key,
            id,
            queue_rx,
            state_tx,
        ));
    }

    pub fn state(&self, target: &Address) -> ConnectionState {
        self.inner
            .connections()
            .get(&target.socket_addr())
            .map(|c| *c.state.borrow())
            .unwrap_or(ConnectionState::Closed)
    }

    /// Number of handshakes that completed since this sender was created.
    pub fn connections_opened(&self) -> u64 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    /// Closes every connection once its queue is flushed.
    pub fn close_all(&self) {
        self.inner.connections().clear();
    }
}

#[async_trait]
impl ChatSender for WebSocketSender {
    async fn send(&self, message: &ChatMessage, target: &Address) {
        self.enqueue(message.clone(), target);
    }
}

async fn run_connection(
    inner: Arc<Inner>,
    target: SocketAddr,
    id: u64,
    mut queue: mpsc::UnboundedReceiver<ChatMessage>,
    state: watch::Sender<ConnectionState>,
) {
    let url = format!("ws://{}{}", target, WS_MESSAGE_PATH);
    let connected =
        tokio::time::timeout(inner.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await;
    let mut stream = match connected {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!("WebSocket connection to {} failed: {}", url, e);
            abandon(&inner, target, id, queue, &state);
            return;
        }
        Err(_) => {
            warn!(
                "WebSocket connection to {} timed out after {:?}",
                url, inner.connect_timeout
            );
            abandon(&inner, target, id, queue, &state);
            return;
        }
    };

    inner.opened.fetch_add(1, Ordering::Relaxed);
    state.send_replace(ConnectionState::Open);
    debug!("WebSocket connection to {} open", url);

    let idle = tokio::time::sleep(inner.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => {
                debug!("WebSocket connection to {} idle, closing", url);
                break;
            }
            next = queue.recv() => match next {
                Some(message) => {
                    if let Err(e) = send_frame(&mut stream, &message).await {
                        warn!("Failed to send message to {}: {}", url, e);
                        break;
                    }
                    idle.as_mut().reset(Instant::now() + inner.idle_timeout);
                }
                None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(ack))) => debug!("{} acknowledged: {}", url, ack.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection to {} closed by peer", url);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket connection to {} failed: {}", url, e);
                    break;
                }
            },
        }
    }

    // New sends now open a fresh connection; flush what was queued before.
    inner.forget(target, id);
    let mut lost = 0usize;
    while let Some(message) = queue.recv().await {
        if send_frame(&mut stream, &message).await.is_err() {
            lost += 1;
        }
    }
    if lost > 0 {
        warn!("Dropped {} queued messages for {}", lost, url);
    }
    state.send_replace(ConnectionState::Closed);
    let _ = stream.close(None).await;
}

fn abandon(
    inner: &Inner,
    target: SocketAddr,
    id: u64,
    mut queue: mpsc::UnboundedReceiver<ChatMessage>,
    state: &watch::Sender<ConnectionState>,
) {
    inner.forget(target, id);
    queue.close();
    let mut lost = 0usize;
    while queue.try_recv().is_ok() {
        lost += 1;
    }
    if lost > 0 {
        warn!("Dropped {} queued messages for {}", lost, target);
    }
    state.send_replace(ConnectionState::Closed);
}

async fn send_frame(stream: &mut ClientStream, message: &ChatMessage) -> Result<(), TransportError> {
    let json = serde_json::to_string(message)?;
    stream.send(Message::Text(json.into())).await?;
    Ok(())
}

#[derive(Clone)]
struct ListenerState {
    dispatcher: Dispatcher,
    closing: watch::Receiver<bool>,
}

/// Accepts long-lived WebSocket connections on [`WS_MESSAGE_PATH`].
pub struct WebSocketListener;

impl WebSocketListener {
    pub async fn bind(
        addr: SocketAddr,
        listener: Arc<dyn MessageListener>,
        config: &TransportConfig,
    ) -> Result<ListenerHandle, TransportError> {
        let (closing_tx, closing_rx) = watch::channel(false);
        let state = ListenerState {
            dispatcher: Dispatcher::new(listener, config.callback_timeout),
            closing: closing_rx,
        };
        let app = Router::new()
            .route(WS_MESSAGE_PATH, get(upgrade))
            .with_state(state);

        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        info!("WebSocket chat listener on ws://{}{}", local_addr, WS_MESSAGE_PATH);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(tcp, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    // upgraded connections are not tracked by graceful shutdown
                    let _ = closing_tx.send(true);
                })
                .await;
            if let Err(e) = result {
                error!("WebSocket chat listener failed: {}", e);
            }
        });

        Ok(ListenerHandle::new(
            Protocol::Websocket,
            local_addr,
            shutdown_tx,
            task,
            config.shutdown_grace,
        ))
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: ListenerState) {
    let ListenerState {
        dispatcher,
        mut closing,
    } = state;

    loop {
        let frame = tokio::select! {
            _ = closing.changed() => {
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            frame = socket.recv() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<ChatMessage>(text.as_str()) {
                    Ok(message) => dispatcher.deliver(message).await,
                    Err(e) => warn!("Dropping malformed WebSocket frame: {}", e),
                }
                if socket.send(WsMessage::Text(WS_ACK.into())).await.is_err() {
                    break;
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("WebSocket receive error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::net::Ipv4Addr;

    async fn start(listener: Arc<dyn MessageListener>) -> (ListenerHandle, Address) {
        let handle = WebSocketListener::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            listener,
            &TransportConfig::default(),
        )
        .await
        .unwrap();
        let target = Address::new(
            Protocol::Websocket,
            Ipv4Addr::LOCALHOST,
            handle.local_addr().port(),
        );
        (handle, target)
    }

    fn sender_with_idle(idle: Duration) -> WebSocketSender {
        WebSocketSender::new(&TransportConfig {
            idle_timeout: idle,
            ..TransportConfig::default()
        })
    }

    #[tokio::test]
    async fn listener_acks_every_frame() {
        let (collector, mut rx) = Collector::new();
        let (handle, target) = start(collector).await;

        let url = format!("ws://{}{}", target.socket_addr(), WS_MESSAGE_PATH);
        let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        for text in ["first", "second", "third"] {
            let message = ChatMessage::new("Dreamtail", text);
            send_frame(&mut stream, &message).await.unwrap();
            match stream.next().await.unwrap().unwrap() {
                Message::Text(ack) => assert_eq!(ack.as_str(), WS_ACK),
                other => panic!("unexpected frame {:?}", other),
            }
            assert_eq!(recv(&mut rx).await, message);
        }

        // a malformed frame is still acknowledged
        stream.send(Message::Text("nope".into())).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            Message::Text(ack) => assert_eq!(ack.as_str(), WS_ACK),
            other => panic!("unexpected frame {:?}", other),
        }

        drop(stream);
        handle.stop().await;
    }

    #[tokio::test]
    async fn sender_reuses_connection_in_order() {
        let (collector, mut rx) = Collector::new();
        let (handle, target) = start(collector).await;
        let sender = sender_with_idle(Duration::from_secs(120));

        for i in 0..5 {
            sender
                .send(&ChatMessage::new("alice", format!("msg {i}")), &target)
                .await;
        }
        for i in 0..5 {
            assert_eq!(recv(&mut rx).await.text, format!("msg {i}"));
        }
        assert_eq!(sender.connections_opened(), 1);
        assert_eq!(sender.state(&target), ConnectionState::Open);

        sender.close_all();
        handle.stop().await;
    }

    #[tokio::test]
    async fn sender_reopens_after_idle_gap() {
        let (collector, mut rx) = Collector::new();
        let (handle, target) = start(collector).await;
        let sender = sender_with_idle(Duration::from_millis(200));

        sender.send(&ChatMessage::new("alice", "one"), &target).await;
        assert_eq!(recv(&mut rx).await.text, "one");
        sender.send(&ChatMessage::new("alice", "two"), &target).await;
        assert_eq!(recv(&mut rx).await.text, "two");
        assert_eq!(sender.connections_opened(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sender.state(&target), ConnectionState::Closed);

        sender.send(&ChatMessage::new("alice", "three"), &target).await;
        assert_eq!(recv(&mut rx).await.text, "three");
        assert_eq!(sender.connections_opened(), 2);

        sender.close_all();
        handle.stop().await;
    }

    #[tokio::test]
    async fn concurrent_sends_while_opening_share_one_connection() {
        let (collector, mut rx) = Collector::new();
        let (handle, target) = start(collector).await;
        let sender = sender_with_idle(Duration::from_secs(120));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..10 {
            let sender = sender.clone();
            tasks.spawn(async move {
                sender
                    .send(&ChatMessage::new("bob", format!("{i}")), &target)
                    .await
            });
        }
        while tasks.join_next().await.is_some() {}

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(recv(&mut rx).await.text);
        }
        seen.sort();
        assert_eq!(seen.len(), 10);
        assert_eq!(sender.connections_opened(), 1);

        sender.close_all();
        handle.stop().await;
    }

    #[tokio::test]
    async fn unreachable_destination_returns_to_closed() {
        // bind and drop to get a port nobody listens on
        let port = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let target = Address::new(Protocol::Websocket, Ipv4Addr::LOCALHOST, port);
        let sender = sender_with_idle(Duration::from_secs(120));

        sender.send(&ChatMessage::new("a", "lost"), &target).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while sender.state(&target) != ConnectionState::Closed {
            assert!(Instant::now() < deadline, "connection never gave up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sender.connections_opened(), 0);
    }
}
