//! Configuration for the connection manager

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::ConnectionManager`].
///
/// Serde defaults are provided per field so the struct can be embedded in a
/// host application's config file with only the fields that differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Message server WebSocket URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Delay between reconnection attempts, milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Maximum reconnection attempts after an unexpected close before the
    /// channel gives up and stays closed
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Heartbeat interval in milliseconds while the channel is open
    /// (0 = no heartbeat)
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
}

fn default_server_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: 0,
        }
    }
}

impl ManagerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// None when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}
