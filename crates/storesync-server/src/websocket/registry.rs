//! The set of live connections and what each one is subscribed to.
//!
//! Every operation takes the map lock for its own duration only, so calls
//! from socket tasks, the liveness monitor and broadcasters interleave
//! safely. Operations naming an unknown connection are no-ops: the
//! connection has already gone, which is the state the caller wanted.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use storesync_core::ConnectionId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::connection::{ClientConnection, CloseReason, Outbound};

/// Point-in-time view of one connection.
#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Scope at snapshot time (`None` = all stores).
    pub scope: Option<String>,
    /// Liveness flag at snapshot time.
    pub alive: bool,
    /// Handle for sending to or closing the connection.
    pub connection: Arc<ClientConnection>,
}

/// Connection counts for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// All live connections.
    pub total_connections: usize,
    /// Connections per explicitly subscribed store; wildcard connections
    /// are not counted here.
    pub connections_by_store: BTreeMap<String, usize>,
}

/// Registry of live connections keyed by identifier.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    queue_capacity: usize,
    /// Set by [`close_all`](Self::close_all); no entries are added afterwards.
    shut: AtomicBool,
}

impl ConnectionRegistry {
    /// Create an empty registry; each connection gets an outbound queue of `queue_capacity`.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            shut: AtomicBool::new(false),
        }
    }

    /// Register a new connection and return it with the receiving end of its queue.
    ///
    /// The connection starts alive, wildcard-scoped, with `last_seen = now`.
    /// After [`close_all`](Self::close_all) the returned connection is already
    /// closed and never enters the registry.
    pub fn register(&self) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut conns = self.connections.write();
        if self.shut.load(Ordering::Acquire) {
            drop(conns);
            let connection = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
            let _ = connection.close(CloseReason::GOING_AWAY);
            debug!(conn_id = %connection.id(), "registry closed, refusing connection");
            return (connection, rx);
        }
        let connection = loop {
            if let Entry::Vacant(slot) = conns.entry(ConnectionId::new()) {
                let connection = Arc::new(ClientConnection::new(slot.key().clone(), tx));
                let _ = slot.insert(connection.clone());
                break connection;
            }
        };
        let active = conns.len();
        drop(conns);

        metrics::counter!(crate::metrics::WS_CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).set(active as f64);
        debug!(conn_id = %connection.id(), active, "connection registered");
        (connection, rx)
    }

    /// Remove a connection. Idempotent; does not close the transport.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut conns = self.connections.write();
        let removed = conns.remove(id);
        let active = conns.len();
        drop(conns);

        if removed.is_some() {
            metrics::counter!(crate::metrics::WS_DISCONNECTIONS_TOTAL).increment(1);
            metrics::gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).set(active as f64);
            debug!(conn_id = %id, active, "connection unregistered");
        }
        removed
    }

    /// Close a connection's transport (at most once) and unregister it.
    ///
    /// Returns `true` if this call performed the close.
    pub fn evict(&self, connection: &ClientConnection, reason: CloseReason) -> bool {
        let closed = connection.close(reason);
        let _ = self.unregister(connection.id());
        if closed {
            metrics::counter!(crate::metrics::WS_EVICTIONS_TOTAL, "reason" => reason.label())
                .increment(1);
            info!(
                conn_id = %connection.id(),
                reason = reason.reason,
                dropped = connection.drop_count(),
                "connection evicted"
            );
        }
        closed
    }

    /// Set the scope of a connection (`None` = all stores).
    pub fn set_scope(&self, id: &ConnectionId, scope: Option<String>) {
        if let Some(conn) = self.get(id) {
            conn.set_scope(scope);
        }
    }

    /// Record a liveness reply.
    pub fn mark_alive(&self, id: &ConnectionId) {
        if let Some(conn) = self.get(id) {
            conn.mark_alive();
        }
    }

    /// Clear the liveness flag ahead of a probe.
    pub fn mark_probed_pending(&self, id: &ConnectionId) {
        if let Some(conn) = self.get(id) {
            conn.mark_probed_pending();
        }
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Consistent view of every live connection.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .values()
            .map(|conn| ConnectionSnapshot {
                id: conn.id().clone(),
                scope: conn.scope(),
                alive: conn.is_alive(),
                connection: conn.clone(),
            })
            .collect()
    }

    /// Connection counts, overall and per subscribed store.
    pub fn stats(&self) -> ConnectionStats {
        let snapshot = self.snapshot();
        let mut connections_by_store = BTreeMap::new();
        for scope in snapshot.iter().filter_map(|s| s.scope.clone()) {
            *connections_by_store.entry(scope).or_insert(0) += 1;
        }
        ConnectionStats {
            total_connections: snapshot.len(),
            connections_by_store,
        }
    }

    /// Close every connection, empty the registry and refuse later
    /// registrations. Returns how many were closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<_> = {
            let mut conns = self.connections.write();
            self.shut.store(true, Ordering::Release);
            conns.drain().map(|(_, c)| c).collect()
        };
        metrics::gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).set(0.0);
        drained.iter().filter(|conn| conn.close(reason)).count()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}
