//! Peer directory and chat transports.
//!
//! * [`registry`]: the membership table with failure accounting.
//! * [`liveness`]: per-protocol reachability probes.
//! * [`scheduler`]: the periodic eviction sweep.
//! * [`transport`]: HTTP, WebSocket and UDP chat senders and listeners.
//! * [`api`] / [`client`]: the registry REST surface and its client.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod liveness;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub mod types;

pub use client::RegistryClient;
pub use config::{Config, TransportConfig};
pub use error::{RegistryError, TransportError};
pub use registry::AddressRegistry;
pub use scheduler::EvictionScheduler;
pub use types::{Address, ChatMessage, Protocol, UserInfo};
