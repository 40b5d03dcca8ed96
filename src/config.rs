//! Configuration management
//!
//! Loads the link, transport and logging settings from a TOML file. Every
//! field has a default, so an empty file (or no file) is a valid config.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::transport::PeerIdentity;

/// Default RFCOMM channel for the serial service
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Service UUID used for authenticated (secure) connections
pub const SECURE_SERVICE_UUID: &str = "fa87c0d0-afac-11de-8a39-0800200c9a66";

/// Service UUID used for unauthenticated (insecure) connections
pub const INSECURE_SERVICE_UUID: &str = "8ce255c0-200a-11e0-ac64-0800200c9a66";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.link.read_buffer_size == 0 {
            bail!("link.read_buffer_size must be greater than zero");
        }
        if self.link.outbound_capacity == 0 {
            bail!("link.outbound_capacity must be greater than zero");
        }
        if self.link.max_relisten_delay_ms < self.link.relisten_delay_ms {
            bail!("link.max_relisten_delay_ms must be >= link.relisten_delay_ms");
        }
        Ok(())
    }
}

/// Connection manager settings
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Upper bound on an outbound connection attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Size of the transfer worker's read buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Number of writes that may be queued on the transfer worker
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Initial delay before re-listening after a listen failure
    #[serde(default = "default_relisten_delay")]
    pub relisten_delay_ms: u64,
    /// Maximum re-listen delay
    #[serde(default = "default_max_relisten_delay")]
    pub max_relisten_delay_ms: u64,
    /// Listen on the secure service
    #[serde(default = "default_true")]
    pub secure_listen: bool,
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn relisten_delay(&self) -> Duration {
        Duration::from_millis(self.relisten_delay_ms)
    }

    pub fn max_relisten_delay(&self) -> Duration {
        Duration::from_millis(self.max_relisten_delay_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_buffer_size: default_read_buffer_size(),
            outbound_capacity: default_outbound_capacity(),
            relisten_delay_ms: default_relisten_delay(),
            max_relisten_delay_ms: default_max_relisten_delay(),
            secure_listen: true,
        }
    }
}

/// Which transport backs the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Real RFCOMM Bluetooth (requires BlueZ)
    #[default]
    Rfcomm,
    /// TCP simulation (for development)
    Tcp,
}

/// Transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,
    /// RFCOMM channel number
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Name advertised for the listening service
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_secure_uuid")]
    pub secure_uuid: String,
    #[serde(default = "default_insecure_uuid")]
    pub insecure_uuid: String,
    /// TCP simulation listen address
    #[serde(default = "default_tcp_bind")]
    pub tcp_bind: SocketAddr,
    /// Peers reported as paired in TCP simulation
    #[serde(default)]
    pub tcp_peers: Vec<PeerIdentity>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            channel: default_channel(),
            service_name: default_service_name(),
            secure_uuid: default_secure_uuid(),
            insecure_uuid: default_insecure_uuid(),
            tcp_bind: default_tcp_bind(),
            tcp_peers: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    12_000
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_outbound_capacity() -> usize {
    100
}

fn default_relisten_delay() -> u64 {
    500
}

fn default_max_relisten_delay() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_channel() -> u8 {
    DEFAULT_RFCOMM_CHANNEL
}

fn default_service_name() -> String {
    "BluetoothChat".into()
}

fn default_secure_uuid() -> String {
    SECURE_SERVICE_UUID.into()
}

fn default_insecure_uuid() -> String {
    INSECURE_SERVICE_UUID.into()
}

fn default_tcp_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.link.read_buffer_size, 1024);
        assert_eq!(config.link.connect_timeout(), Duration::from_secs(12));
        assert!(config.link.secure_listen);
        assert_eq!(config.transport.mode, TransportMode::Rfcomm);
        assert_eq!(config.transport.channel, DEFAULT_RFCOMM_CHANNEL);
        assert_eq!(config.transport.secure_uuid, SECURE_SERVICE_UUID);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_tcp_simulation_config() {
        let config = Config::from_toml(
            r#"
            [transport]
            mode = "tcp"
            tcp_bind = "127.0.0.1:9100"

            [[transport.tcp_peers]]
            name = "bench-peer"
            address = "127.0.0.1:9200"
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.mode, TransportMode::Tcp);
        assert_eq!(config.transport.tcp_bind.port(), 9100);
        assert_eq!(config.transport.tcp_peers.len(), 1);
        assert_eq!(config.transport.tcp_peers[0].name, "bench-peer");
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let result = Config::from_toml("[link]\nread_buffer_size = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let result = Config::from_toml(
            "[link]\nrelisten_delay_ms = 5000\nmax_relisten_delay_ms = 100\n",
        );
        assert!(result.is_err());
    }
}
