use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Registry daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub api_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub sweep_period_secs: u64,
    pub eviction_threshold: u32,
    pub probe_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8088)),
            bind_ip: None,
            sweep_period_secs: 120,
            eviction_threshold: 3,
            probe_timeout_ms: 5_000,
            state_file: None,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("peerchat.toml"))
                .merge(Json::file("peerchat.json"))
                .merge(Env::prefixed("PEERCHAT_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of api_bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.api_bind.port();
            config.api_bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        if config.eviction_threshold == 0 {
            anyhow::bail!("eviction_threshold must be at least 1");
        }
        if config.sweep_period_secs == 0 {
            anyhow::bail!("sweep_period_secs must be at least 1");
        }

        Ok(config)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Knobs shared by the chat senders, listeners and liveness probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bound on a single HTTP request, WebSocket handshake or UDP probe reply.
    pub request_timeout: Duration,
    /// An outbound WebSocket connection closes after this long without a send.
    pub idle_timeout: Duration,
    /// Upper bound on one invocation of the message callback.
    pub callback_timeout: Duration,
    /// How long a stopping listener waits for in-flight work.
    pub shutdown_grace: Duration,
    /// Attempts at opening a local UDP socket before giving up.
    pub bind_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            callback_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            bind_attempts: 30,
        }
    }
}

impl TransportConfig {
    /// Transport settings derived from the daemon configuration, used by
    /// the registry's own liveness probes.
    pub fn for_probes(config: &Config) -> Self {
        Self {
            request_timeout: config.probe_timeout(),
            shutdown_grace: config.shutdown_grace(),
            ..Self::default()
        }
    }
}
