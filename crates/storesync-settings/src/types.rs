//! Settings types. Every field has a default so partial files are valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Network and transport settings.
    pub server: ServerSettings,
    /// Liveness monitor settings.
    pub liveness: LivenessSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl SyncSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.liveness.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "liveness.intervalMs must be greater than zero".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than zero".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be greater than zero".into(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath must start with '/': {}",
                self.server.ws_path
            )));
        }
        Ok(())
    }
}

/// Server network settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// WebSocket upgrade path, shared with the HTTP API.
    pub ws_path: String,
    /// Upgrades beyond this many live connections are refused.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for tasks to drain.
    pub shutdown_timeout_ms: u64,
}

impl ServerSettings {
    /// Shutdown drain timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            max_connections: 1000,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Liveness monitor settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivenessSettings {
    /// Sweep interval. A silent connection is evicted within two sweeps.
    pub interval_ms: u64,
}

impl LivenessSettings {
    /// Sweep interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
