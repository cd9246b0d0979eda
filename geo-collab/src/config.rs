//! Server and client configuration.
//!
//! Every section derives `Deserialize` with `#[serde(default)]`, so a
//! TOML file only needs the keys it overrides:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! max_members_per_room = 50
//!
//! [client.reconnect]
//! max_attempts = 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl CollabConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Member cap per room; `None` means unlimited
    pub max_members_per_room: Option<usize>,
    /// Frames buffered per member before deliveries are dropped
    pub outbound_capacity: usize,
    /// Heartbeat interval in seconds; silence for twice this evicts a peer
    pub heartbeat_interval_secs: u64,
    /// How long an empty room survives before it is deleted
    pub room_grace_period_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: None,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            room_grace_period_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn room_grace_period(&self) -> Duration {
        Duration::from_secs(self.room_grace_period_secs)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub outbound_capacity: usize,
    /// Minimum spacing of outbound cursor updates
    pub cursor_throttle_ms: u64,
    pub max_pending_echoes: usize,
    pub reconnect: ReconnectConfig,
    pub presence: PresenceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            outbound_capacity: 256,
            cursor_throttle_ms: 100,
            max_pending_echoes: 1024,
            reconnect: ReconnectConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1500,
            max_delay_ms: 30_000,
            max_jitter_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub sweep_interval_ms: u64,
    pub cursor_staleness_ms: u64,
    pub activity_staleness_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            cursor_staleness_ms: 5000,
            activity_staleness_ms: 300_000,
        }
    }
}

impl PresenceConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cursor_staleness(&self) -> Duration {
        Duration::from_millis(self.cursor_staleness_ms)
    }

    pub fn activity_staleness(&self) -> Duration {
        Duration::from_millis(self.activity_staleness_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
