//! JSON configuration for the tunnel binaries.
//!
//! Keys are camelCase. Every field of the `tunnel` block is optional:
//!
//! ```json
//! {
//!   "peerAddress": "tunnel.example.net",
//!   "peerTcpPort": 7000,
//!   "localHostUdpPort": 5000,
//!   "clientId": 17,
//!   "tunnel": { "connections": 2, "coalesce": { "flushIntervalMs": 50 } }
//! }
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::PoolConfig;
use crate::channel::ChannelConfig;
use crate::codec::{MAX_FRAME_PAYLOAD, UVT_HEADER_LEN};
use crate::control::{AllowList, ClientId};
use crate::net::{ConnectionOptions, Endpoint};

/// Errors loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// UDP coalescing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoalesceOptions {
    pub enabled: bool,
    /// Flush once buffered plus incoming bytes would exceed this.
    pub batch_limit: usize,
    pub flush_interval_ms: u64,
}

impl Default for CoalesceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_limit: MAX_FRAME_PAYLOAD,
            flush_interval_ms: 100,
        }
    }
}

impl CoalesceOptions {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Buffer pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolOptions {
    pub small_size: usize,
    pub medium_size: usize,
    pub large_size: usize,
    pub max_per_tier: usize,
    pub trim_interval_secs: u64,
    pub keep_fraction: f64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            small_size: pool.small_size,
            medium_size: pool.medium_size,
            large_size: pool.large_size,
            max_per_tier: pool.max_per_tier,
            trim_interval_secs: pool.trim_interval.as_secs(),
            keep_fraction: pool.keep_fraction,
        }
    }
}

/// Settings shared by client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelOptions {
    /// TCP connections per virtual channel.
    pub connections: usize,
    pub send_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub bind_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub coalesce: CoalesceOptions,
    pub pool: PoolOptions,
    pub memory_alert_mb: u64,
    pub report_interval_secs: u64,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            connections: 2,
            send_timeout_ms: 1800,
            connect_timeout_ms: 3000,
            bind_timeout_ms: 2000,
            reconnect_delay_ms: 1000,
            coalesce: CoalesceOptions::default(),
            pool: PoolOptions::default(),
            memory_alert_mb: 100,
            report_interval_secs: 10,
        }
    }
}

impl TunnelOptions {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    #[must_use]
    pub const fn memory_alert_bytes(&self) -> u64 {
        self.memory_alert_mb.saturating_mul(1024 * 1024)
    }

    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connection: ConnectionOptions {
                send_timeout: Duration::from_millis(self.send_timeout_ms),
                ..ConnectionOptions::default()
            },
            ..ChannelConfig::default()
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            small_size: self.pool.small_size,
            medium_size: self.pool.medium_size,
            large_size: self.pool.large_size,
            max_per_tier: self.pool.max_per_tier,
            trim_interval: Duration::from_secs(self.pool.trim_interval_secs),
            keep_fraction: self.pool.keep_fraction,
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=usize::from(u8::MAX)).contains(&self.connections) {
            return Err(invalid(format!(
                "connections must be in 1..=255, got {}",
                self.connections
            )));
        }
        for (name, ms) in [
            ("sendTimeoutMs", self.send_timeout_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("bindTimeoutMs", self.bind_timeout_ms),
        ] {
            if ms == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }
        let max_batch = MAX_FRAME_PAYLOAD + UVT_HEADER_LEN;
        if !(1..=max_batch).contains(&self.coalesce.batch_limit) {
            return Err(invalid(format!(
                "coalesce.batchLimit must be in 1..={max_batch}, got {}",
                self.coalesce.batch_limit
            )));
        }
        let pool = &self.pool;
        if pool.small_size == 0 || pool.small_size > pool.medium_size || pool.medium_size > pool.large_size {
            return Err(invalid("pool sizes must satisfy 0 < small <= medium <= large"));
        }
        if !(pool.keep_fraction > 0.0 && pool.keep_fraction <= 1.0) {
            return Err(invalid(format!(
                "pool.keepFraction must be in (0, 1], got {}",
                pool.keep_fraction
            )));
        }
        if pool.trim_interval_secs == 0 || self.report_interval_secs == 0 {
            return Err(invalid("intervals must be positive"));
        }
        Ok(())
    }
}

fn default_local_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_listen() -> String {
    "0.0.0.0".to_owned()
}

/// `uvt-client` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub peer_address: String,
    pub peer_tcp_port: u16,
    /// Address the local UDP socket binds to.
    #[serde(default = "default_local_host")]
    pub local_host_address: String,
    pub local_host_udp_port: u16,
    pub client_id: ClientId,
    #[serde(default)]
    pub tunnel: TunnelOptions,
}

impl ClientConfig {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load(path.as_ref())
    }

    /// # Errors
    ///
    /// Returns an error if `json` cannot be parsed or validated.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_address.trim().is_empty() {
            return Err(invalid("peerAddress must not be empty"));
        }
        if self.peer_tcp_port == 0 {
            return Err(invalid("peerTcpPort must not be 0"));
        }
        self.tunnel.validate()
    }

    /// Resolves the server's TCP endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve.
    pub fn server_endpoint(&self) -> io::Result<Endpoint> {
        Endpoint::resolve(&self.peer_address, self.peer_tcp_port)
    }

    /// Resolves the local UDP bind endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve.
    pub fn local_udp_endpoint(&self) -> io::Result<Endpoint> {
        Endpoint::resolve(&self.local_host_address, self.local_host_udp_port)
    }
}

/// `uvt-server` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen_address: String,
    pub tcp_port: u16,
    pub forward_udp_address: String,
    pub forward_udp_port: u16,
    pub allowed_clients: Vec<ClientId>,
    #[serde(default)]
    pub tunnel: TunnelOptions,
}

impl ServerConfig {
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load(path.as_ref())
    }

    /// # Errors
    ///
    /// Returns an error if `json` cannot be parsed or validated.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_clients.is_empty() {
            return Err(invalid("allowedClients must not be empty"));
        }
        if self.forward_udp_port == 0 {
            return Err(invalid("forwardUdpPort must not be 0"));
        }
        self.tunnel.validate()
    }

    #[must_use]
    pub fn allow_list(&self) -> AllowList {
        self.allowed_clients.iter().copied().collect()
    }

    /// # Errors
    ///
    /// Returns an error if the address does not resolve.
    pub fn listen_endpoint(&self) -> io::Result<Endpoint> {
        Endpoint::resolve(&self.listen_address, self.tcp_port)
    }

    /// # Errors
    ///
    /// Returns an error if the address does not resolve.
    pub fn forward_endpoint(&self) -> io::Result<Endpoint> {
        Endpoint::resolve(&self.forward_udp_address, self.forward_udp_port)
    }
}

trait Validate {
    fn check(&self) -> Result<(), ConfigError>;
}

impl Validate for ClientConfig {
    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

impl Validate for ServerConfig {
    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

fn load<T: DeserializeOwned + Validate>(path: &Path) -> Result<T, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: T = serde_json::from_str(&data)?;
    config.check()?;
    Ok(config)
}
