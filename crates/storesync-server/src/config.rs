//! Server configuration.

use std::time::Duration;

use storesync_settings::SyncSettings;

/// Runtime configuration for [`SyncServer`](crate::server::SyncServer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Liveness sweep interval.
    pub liveness_interval: Duration,
    /// How long shutdown waits for tasks to drain.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/ws".into(),
            max_connections: 1000,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            liveness_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&SyncSettings> for ServerConfig {
    fn from(settings: &SyncSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            ws_path: server.ws_path.clone(),
            max_connections: server.max_connections,
            send_queue_capacity: server.send_queue_capacity,
            max_message_size: server.max_message_size,
            liveness_interval: settings.liveness.interval(),
            shutdown_timeout: server.shutdown_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_on_any_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.ws_path, "/ws");
    }

    #[test]
    fn default_liveness_interval() {
        assert_eq!(ServerConfig::default().liveness_interval, Duration::from_secs(30));
    }

    #[test]
    fn from_settings() {
        let mut settings = SyncSettings::default();
        settings.server.port = 9090;
        settings.server.send_queue_capacity = 8;
        settings.liveness.interval_ms = 500;
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.send_queue_capacity, 8);
        assert_eq!(cfg.liveness_interval, Duration::from_millis(500));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(10));
    }
}
