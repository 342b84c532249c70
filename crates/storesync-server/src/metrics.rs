//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections registered (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections unregistered (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Server-initiated closes (counter, labels: reason).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Envelopes broadcast (counter, labels: type).
pub const WS_BROADCASTS_TOTAL: &str = "ws_broadcasts_total";
/// Envelopes queued on a connection by a broadcast (counter).
pub const WS_DELIVERIES_TOTAL: &str = "ws_deliveries_total";
/// Inbound messages that failed to parse (counter).
pub const WS_INVALID_MESSAGES_TOTAL: &str = "ws_invalid_messages_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_EVICTIONS_TOTAL,
            WS_BROADCASTS_TOTAL,
            WS_DELIVERIES_TOTAL,
            WS_INVALID_MESSAGES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
