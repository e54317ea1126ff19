//! Data structures shared by the registry and the chat transports.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! travel over the registry REST API and every chat wire protocol.  The
//! fields are kept minimal; an [`Address`] is validated once when it is
//! built or decoded and is a plain `Copy` value from then on.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Longest peer name the registry accepts.
pub const MAX_NAME_LEN: usize = 50;

/// Wire protocol a peer listens on.
///
/// Serialised in upper case (`"HTTP"`); the scheme form (`"http"`, `"ws"`,
/// `"udp"`) is accepted on input as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[serde(alias = "http")]
    Http,
    #[serde(alias = "ws", alias = "websocket")]
    Websocket,
    #[serde(alias = "udp")]
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::Websocket, Protocol::Udp];

    /// Canonical URL scheme.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Websocket => "ws",
            Protocol::Udp => "udp",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 8080,
            Protocol::Websocket => 8082,
            Protocol::Udp => 3000,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "ws" | "websocket" => Ok(Protocol::Websocket),
            "udp" => Ok(Protocol::Udp),
            other => Err(RegistryError::InvalidAddress(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// One value per [`Protocol`], looked up by tag.
#[derive(Debug, Clone, Default)]
pub struct ProtocolTable<T> {
    pub http: T,
    pub websocket: T,
    pub udp: T,
}

impl<T> ProtocolTable<T> {
    pub fn from_fn(mut f: impl FnMut(Protocol) -> T) -> Self {
        Self {
            http: f(Protocol::Http),
            websocket: f(Protocol::Websocket),
            udp: f(Protocol::Udp),
        }
    }

    pub fn get(&self, protocol: Protocol) -> &T {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Websocket => &self.websocket,
            Protocol::Udp => &self.udp,
        }
    }
}

/// A reachable chat endpoint, printed as `scheme://host:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAddress")]
pub struct Address {
    pub protocol: Protocol,
    #[serde(serialize_with = "serialize_host")]
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Address {
    pub fn new(protocol: Protocol, host: Ipv4Addr, port: u16) -> Self {
        Self {
            protocol,
            host,
            port,
        }
    }

    /// Builds an address from an untrusted host string.
    pub fn parse(protocol: Protocol, host: &str, port: u16) -> Result<Self, RegistryError> {
        let host = validate_host(host)?;
        Ok(Self::new(protocol, host, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = RegistryError;

    /// Parses `scheme://host:port`; the port may be omitted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| RegistryError::InvalidAddress(format!("missing scheme: {s}")))?;
        let protocol: Protocol = scheme.parse()?;
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RegistryError::InvalidAddress(format!("invalid port: {port}")))?;
                (host, port)
            }
            None => (rest, protocol.default_port()),
        };
        Address::parse(protocol, host, port)
    }
}

/// Untrusted form of [`Address`] as it arrives on the wire.
#[derive(Deserialize)]
struct RawAddress {
    protocol: Protocol,
    host: String,
    #[serde(default)]
    port: Option<u32>,
}

impl TryFrom<RawAddress> for Address {
    type Error = RegistryError;

    fn try_from(raw: RawAddress) -> Result<Self, Self::Error> {
        let port = match raw.port {
            None => raw.protocol.default_port(),
            Some(p) => u16::try_from(p)
                .map_err(|_| RegistryError::InvalidAddress(format!("port out of range: {p}")))?,
        };
        Address::parse(raw.protocol, &raw.host, port)
    }
}

fn serialize_host<S: serde::Serializer>(host: &Ipv4Addr, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(host)
}

/// A single chat line.  The same JSON shape is used by every transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
        }
    }
}

/// Registration payload: who the peer is and where it listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub address: Address,
}

/// Checks a peer name: 1..=50 characters of `[A-Za-z0-9_.]`, not only dots.
///
/// Names end up as a URL path segment (`/users/{name}`), where `.` and `..`
/// would be resolved away.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.chars().all(|c| c == '.');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Accepts only a literal dotted-quad IPv4 host.
pub fn validate_host(host: &str) -> Result<Ipv4Addr, RegistryError> {
    host.parse::<Ipv4Addr>()
        .map_err(|_| RegistryError::InvalidAddress(format!("host is not a dotted quad: {host}")))
}
