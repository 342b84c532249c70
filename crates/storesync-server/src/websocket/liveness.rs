//! Probe-then-evict liveness monitoring.
//!
//! Each sweep evicts connections still pending from the previous probe,
//! then probes everyone else. A client that never answers is therefore
//! gone after two sweeps, and never lingers longer than one interval past
//! its missed probe.

use std::sync::Arc;
use std::time::Duration;

use storesync_core::Envelope;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{CloseReason, Outbound};
use super::registry::ConnectionRegistry;

/// What a single sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections sent a probe.
    pub probed: usize,
    /// Connections closed and removed.
    pub evicted: usize,
}

/// Periodic liveness sweeper. Holds no connection state of its own.
#[derive(Clone)]
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl LivenessMonitor {
    /// Create a monitor sweeping `registry` every `interval`.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run one sweep.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return report;
        }

        let probe: Arc<str> = match Envelope::probe().to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, "failed to serialize liveness probe");
                return report;
            }
        };

        for entry in snapshot {
            if !entry.alive {
                let silent_ms = entry.connection.last_seen_elapsed().as_millis() as u64;
                if self.registry.evict(&entry.connection, CloseReason::LIVENESS_TIMEOUT) {
                    debug!(conn_id = %entry.id, silent_ms, "no reply to liveness probe");
                    report.evicted += 1;
                }
                continue;
            }

            entry.connection.mark_probed_pending();
            match entry.connection.send(Outbound::Probe(probe.clone())) {
                Ok(()) => report.probed += 1,
                Err(e) => {
                    warn!(conn_id = %entry.id, error = %e, "failed to queue liveness probe");
                    if self.registry.evict(&entry.connection, CloseReason::SEND_FAILURE) {
                        report.evicted += 1;
                    }
                }
            }
        }

        debug!(probed = report.probed, evicted = report.evicted, "liveness sweep");
        report
    }

    /// Sweep on every tick until `cancel` fires. The first sweep happens one
    /// interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "liveness monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.evicted > 0 {
                        info!(evicted = report.evicted, "evicted unresponsive connections");
                    }
                }
                () = cancel.cancelled() => {
                    info!("liveness monitor stopped");
                    return;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storesync_core::EventKind;

    fn monitor() -> (LivenessMonitor, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(8));
        (
            LivenessMonitor::new(registry.clone(), Duration::from_secs(30)),
            registry,
        )
    }

    #[tokio::test]
    async fn first_sweep_probes_fresh_connection() {
        let (monitor, registry) = monitor();
        let (conn, mut rx) = registry.register();

        let report = monitor.sweep();
        assert_eq!(report, SweepReport { probed: 1, evicted: 0 });
        assert!(!conn.is_alive());

        let Outbound::Probe(json) = rx.recv().await.unwrap() else {
            panic!("expected a probe frame");
        };
        let env: storesync_core::Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env.kind, EventKind::Ping);
    }

    #[tokio::test]
    async fn silent_connection_evicted_on_second_sweep() {
        let (monitor, registry) = monitor();
        let (conn, mut rx) = registry.register();

        let _ = monitor.sweep();
        assert_eq!(registry.len(), 1);

        let report = monitor.sweep();
        assert_eq!(report, SweepReport { probed: 0, evicted: 1 });
        assert!(registry.is_empty());
        assert!(conn.is_closed());

        assert!(matches!(rx.recv().await, Some(Outbound::Probe(_))));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close(CloseReason::LIVENESS_TIMEOUT))
        );
        assert!(rx.try_recv().is_err());

        // Nothing left to do, and no second close.
        assert_eq!(monitor.sweep(), SweepReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replying_connection_survives() {
        let (monitor, registry) = monitor();
        let (conn, _rx) = registry.register();

        for _ in 0..5 {
            let report = monitor.sweep();
            assert_eq!(report.evicted, 0);
            registry.mark_alive(conn.id());
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn probe_send_failure_evicts() {
        let (monitor, registry) = monitor();
        let (conn, rx) = registry.register();
        drop(rx);

        let report = monitor.sweep();
        assert_eq!(report, SweepReport { probed: 0, evicted: 1 });
        assert!(conn.is_closed());
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_registry_sweep_is_noop() {
        let (monitor, _registry) = monitor();
        assert_eq!(monitor.sweep(), SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_on_interval() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let monitor = LivenessMonitor::new(registry.clone(), Duration::from_millis(100));
        let (_conn, _rx) = registry.register();
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.len(), 1);
        time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (monitor, _registry) = monitor();
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
