//! Connectionless transport: one datagram per message.
//!
//! Lossy and at most once.  The listener also answers the registry's
//! liveness challenge (`CHECK ID=<nonce> ADDRESS=<host>:<port>`) with the
//! nonce as a 4-byte big-endian integer.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use super::{ChatSender, Dispatcher, ListenerHandle, MessageListener};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::types::{Address, ChatMessage, Protocol};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

const PROBE_PREFIX: &str = "CHECK";

/// Opens a fresh local socket connected to `target`, retrying the local
/// bind/connect up to `attempts` times.
pub(crate) async fn connect_socket(
    target: SocketAddr,
    attempts: u32,
) -> Result<UdpSocket, TransportError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match open_socket(target).await {
            Ok(socket) => return Ok(socket),
            Err(source) if attempt >= attempts => {
                return Err(TransportError::Bind { attempts, source })
            }
            Err(e) => {
                debug!(
                    "Local UDP socket for {} failed (attempt {}/{}): {}",
                    target, attempt, attempts, e
                );
                attempt += 1;
            }
        }
    }
}

async fn open_socket(target: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// The liveness challenge sent by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub nonce: i32,
    pub callback: Option<SocketAddr>,
}

impl ProbeRequest {
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim().strip_prefix(PROBE_PREFIX)?;
        let mut nonce = None;
        let mut callback = None;
        for field in rest.split_whitespace() {
            if let Some(id) = field.strip_prefix("ID=") {
                nonce = id.parse::<i32>().ok();
            } else if let Some(addr) = field.strip_prefix("ADDRESS=") {
                callback = addr.parse::<SocketAddr>().ok();
            }
        }
        Some(Self {
            nonce: nonce?,
            callback,
        })
    }

    /// Where the answer goes: the advertised callback when it names a
    /// concrete endpoint, the datagram source otherwise.
    pub fn reply_target(&self, source: SocketAddr) -> SocketAddr {
        self.callback
            .filter(|addr| !addr.ip().is_unspecified() && addr.port() != 0)
            .unwrap_or(source)
    }
}

impl fmt::Display for ProbeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ID={}", PROBE_PREFIX, self.nonce)?;
        if let Some(callback) = self.callback {
            write!(f, " ADDRESS={}", callback)?;
        }
        Ok(())
    }
}

/// Fires one datagram per message from a fresh socket.
#[derive(Debug, Clone)]
pub struct UdpSender {
    bind_attempts: u32,
}

impl UdpSender {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            bind_attempts: config.bind_attempts,
        }
    }

    pub async fn try_send(
        &self,
        message: &ChatMessage,
        target: &Address,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > MAX_DATAGRAM {
            return Err(TransportError::Malformed(format!(
                "message of {} bytes does not fit a datagram",
                payload.len()
            )));
        }
        let socket = connect_socket(target.socket_addr(), self.bind_attempts).await?;
        socket.send(&payload).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatSender for UdpSender {
    async fn send(&self, message: &ChatMessage, target: &Address) {
        if let Err(e) = self.try_send(message, target).await {
            warn!("Failed to send message to {}: {}", target, e);
        }
    }
}

/// Receives datagrams on one bound socket.
pub struct UdpListener;

impl UdpListener {
    pub async fn bind(
        addr: SocketAddr,
        listener: Arc<dyn MessageListener>,
        config: &TransportConfig,
    ) -> Result<ListenerHandle, TransportError> {
        let dispatcher = Dispatcher::new(listener, config.callback_timeout);
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP chat listener on udp://{}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(receive_loop(socket, dispatcher, shutdown_rx));

        Ok(ListenerHandle::new(
            Protocol::Udp,
            local_addr,
            shutdown_tx,
            task,
            config.shutdown_grace,
        ))
    }
}

async fn receive_loop(
    socket: UdpSocket,
    dispatcher: Dispatcher,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    handle_datagram(&buf[..len], from, &socket, &dispatcher, &mut in_flight).await;
                }
                // e.g. ICMP port unreachable surfacing on the socket; keep going
                Err(e) => warn!("UDP receive error: {}", e),
            }
        }
    }

    drop(socket);
    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            error!("UDP delivery task failed: {}", e);
        }
    }
}

async fn handle_datagram(
    data: &[u8],
    from: SocketAddr,
    socket: &UdpSocket,
    dispatcher: &Dispatcher,
    in_flight: &mut JoinSet<()>,
) {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => {
            warn!("Dropping non-UTF-8 datagram from {}", from);
            return;
        }
    };

    if let Some(probe) = ProbeRequest::parse(text) {
        debug!(
            "Liveness probe {} from {} (callback {:?})",
            probe.nonce, from, probe.callback
        );
        let reply_to = probe.reply_target(from);
        if let Err(e) = socket.send_to(&probe.nonce.to_be_bytes(), reply_to).await {
            warn!("Failed to answer liveness probe at {}: {}", reply_to, e);
        }
        return;
    }

    match serde_json::from_str::<ChatMessage>(text) {
        Ok(message) => {
            let dispatcher = dispatcher.clone();
            in_flight.spawn(async move { dispatcher.deliver(message).await });
        }
        Err(e) => warn!("Dropping malformed datagram from {}: {}", from, e),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    async fn start(listener: Arc<dyn MessageListener>) -> (ListenerHandle, Address, UdpSender) {
        let config = TransportConfig::default();
        let handle = UdpListener::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            listener,
            &config,
        )
        .await
        .unwrap();
        let target = Address::new(Protocol::Udp, Ipv4Addr::LOCALHOST, handle.local_addr().port());
        (handle, target, UdpSender::new(&config))
    }

    #[test]
    fn probe_request_format() {
        let probe = ProbeRequest {
            nonce: 42,
            callback: Some("127.0.0.1:8088".parse().unwrap()),
        };
        let text = probe.to_string();
        assert_eq!(text, "CHECK ID=42 ADDRESS=127.0.0.1:8088");
        assert_eq!(ProbeRequest::parse(&text), Some(probe));

        assert_eq!(ProbeRequest::parse("CHECK ADDRESS=127.0.0.1:1"), None);
        assert_eq!(ProbeRequest::parse(r#"{"user":"a","text":"b"}"#), None);
        assert_eq!(
            ProbeRequest::parse("CHECK ID=7 ADDRESS=nowhere"),
            Some(ProbeRequest {
                nonce: 7,
                callback: None
            })
        );
    }

    #[tokio::test]
    async fn delivers_message() {
        let (collector, mut rx) = Collector::new();
        let (handle, target, sender) = start(collector).await;

        let message = ChatMessage::new("GhostUser", "I want this delivered!");
        sender.send(&message, &target).await;
        assert_eq!(recv(&mut rx).await, message);

        handle.stop().await;
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_break_the_loop() {
        let (collector, mut rx) = Collector::failing_on("bad", "boom");
        let (handle, target, sender) = start(collector).await;

        let raw = connect_socket(target.socket_addr(), 30).await.unwrap();
        raw.send(b"definitely not json").await.unwrap();
        raw.send(&[0xff, 0xfe, 0x00]).await.unwrap();
        sender.send(&ChatMessage::new("a", "bad"), &target).await;
        sender.send(&ChatMessage::new("a", "boom"), &target).await;
        sender.send(&ChatMessage::new("a", "after"), &target).await;

        assert_eq!(recv(&mut rx).await.text, "after");
        handle.stop().await;
    }

    #[tokio::test]
    async fn answers_liveness_probe() {
        let (collector, _rx) = Collector::new();
        let (handle, target, _sender) = start(collector).await;

        let socket = connect_socket(target.socket_addr(), 30).await.unwrap();
        let probe = ProbeRequest {
            nonce: 123_456,
            callback: Some(socket.local_addr().unwrap()),
        };
        socket.send(probe.to_string().as_bytes()).await.unwrap();

        let mut reply = [0u8; 4];
        let len = tokio::time::timeout(std::time::Duration::from_secs(5), socket.recv(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(i32::from_be_bytes(reply), 123_456);

        handle.stop().await;
    }

    #[tokio::test]
    async fn answers_at_the_advertised_callback() {
        let (collector, _rx) = Collector::new();
        let (handle, target, _sender) = start(collector).await;

        let asker = connect_socket(target.socket_addr(), 30).await.unwrap();
        let callback = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let probe = ProbeRequest {
            nonce: 77,
            callback: Some(callback.local_addr().unwrap()),
        };
        asker.send(probe.to_string().as_bytes()).await.unwrap();

        let mut reply = [0u8; 4];
        let (len, from) =
            tokio::time::timeout(std::time::Duration::from_secs(5), callback.recv_from(&mut reply))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(len, 4);
        assert_eq!(from.port(), target.port);
        assert_eq!(i32::from_be_bytes(reply), 77);

        handle.stop().await;
    }

    #[test]
    fn reply_target_falls_back_to_source() {
        let source: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let probe = |callback: Option<&str>| ProbeRequest {
            nonce: 1,
            callback: callback.map(|c| c.parse().unwrap()),
        };

        assert_eq!(probe(None).reply_target(source), source);
        assert_eq!(probe(Some("0.0.0.0:5000")).reply_target(source), source);
        assert_eq!(probe(Some("127.0.0.1:0")).reply_target(source), source);
        assert_eq!(
            probe(Some("127.0.0.1:5000")).reply_target(source),
            "127.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn local_socket_setup_gives_up_after_bounded_attempts() {
        // an IPv4 socket can never connect to an IPv6 target
        let target: SocketAddr = "[::1]:9".parse().unwrap();
        match connect_socket(target, 30).await {
            Err(TransportError::Bind { attempts, .. }) => assert_eq!(attempts, 30),
            other => panic!("expected a bind failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn stop_releases_the_socket() {
        let (collector, _rx) = Collector::new();
        let (handle, target, _sender) = start(collector).await;
        handle.stop().await;

        UdpSocket::bind(target.socket_addr()).await.unwrap();
    }
}
