//! Inbound message dispatch and store-scoped broadcasting.
//!
//! Every send is a non-blocking enqueue onto the target connection's own
//! queue, so one slow client never holds up the others. A failed enqueue
//! evicts that connection and delivery carries on with the rest.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use storesync_core::{
    BatchId, ConnectionId, DataCategory, Envelope, EventKind, InboundMessage, MessageId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, CloseReason, Outbound};
use super::registry::{ConnectionRegistry, ConnectionStats};

/// Default number of items per `bulk_update` envelope.
pub const DEFAULT_BULK_CHUNK_SIZE: usize = 100;

/// A change to announce to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastRequest {
    /// Envelope kind, normally [`EventKind::DataUpdate`].
    pub kind: EventKind,
    /// Store whose data changed.
    pub store_id: String,
    /// Domain object that changed.
    pub data_type: DataCategory,
    /// Payload.
    pub data: Value,
    /// User whose action caused the change.
    pub user_id: Option<String>,
}

impl BroadcastRequest {
    /// A `data_update` for `store_id`.
    pub fn data_update(store_id: impl Into<String>, data_type: DataCategory, data: Value) -> Self {
        Self {
            kind: EventKind::DataUpdate,
            store_id: store_id.into(),
            data_type,
            data,
            user_id: None,
        }
    }

    /// Override the envelope kind.
    #[must_use]
    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attribute the change to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    fn into_envelope(self) -> Envelope {
        Envelope::builder(self.kind)
            .store(self.store_id)
            .data_type(self.data_type)
            .data(self.data)
            .user_id(self.user_id)
            .build()
    }
}

/// Outcome of one broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    /// Identifier of the envelope every target received.
    pub message_id: MessageId,
    /// Connections the envelope was queued on.
    pub delivered: usize,
    /// Targets evicted because the envelope could not be queued.
    pub evicted: usize,
}

/// Outcome of one bulk broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    /// Identifier shared by every chunk.
    pub batch_id: BatchId,
    /// Number of chunk envelopes built.
    pub envelopes: usize,
    /// Chunk envelopes queued, summed over targets.
    pub delivered: usize,
    /// Targets evicted part-way through the batch.
    pub evicted: usize,
}

/// What the router did with an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Liveness reply recorded.
    MarkedAlive,
    /// Scope replaced (`None` = all stores).
    ScopeChanged(Option<String>),
    /// Understood or unknown kind that needs no action.
    Ignored(String),
    /// Unparseable; an error notice went back to the sender.
    Rejected,
}

/// Routes client traffic into the registry and data changes out to clients.
#[derive(Debug)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this router reads and updates.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new client and greet it with its identifier.
    ///
    /// The greeting is the only envelope sent to a single client on connect.
    pub fn on_connect(&self) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (connection, rx) = self.registry.register();
        if connection.is_closed() {
            return (connection, rx);
        }
        info!(conn_id = %connection.id(), "client connected");
        self.unicast(&connection, &Envelope::connected(connection.id()));
        (connection, rx)
    }

    /// Handle one text frame from a client.
    #[instrument(skip_all, fields(conn_id = %connection_id))]
    pub fn on_message(&self, connection_id: &ConnectionId, raw: &str) -> InboundOutcome {
        let message = match InboundMessage::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "invalid message received");
                metrics::counter!(crate::metrics::WS_INVALID_MESSAGES_TOTAL).increment(1);
                if let Some(connection) = self.registry.get(connection_id) {
                    self.unicast(&connection, &Envelope::status_error(&e));
                }
                return InboundOutcome::Rejected;
            }
        };

        match message.event_kind() {
            Some(EventKind::Pong) => {
                self.registry.mark_alive(connection_id);
                InboundOutcome::MarkedAlive
            }
            Some(EventKind::StoreSwitch) => {
                let scope = message.requested_scope();
                debug!(scope = scope.as_deref().unwrap_or("*"), "client switched store");
                self.registry.set_scope(connection_id, scope.clone());
                InboundOutcome::ScopeChanged(scope)
            }
            _ => {
                debug!(kind = %message.kind, "ignoring client message");
                InboundOutcome::Ignored(message.kind)
            }
        }
    }

    /// A transport-level Pong arrived.
    pub fn on_pong(&self, connection_id: &ConnectionId) {
        self.registry.mark_alive(connection_id);
    }

    /// The client's socket closed.
    pub fn on_disconnect(&self, connection_id: &ConnectionId) {
        if let Some(connection) = self.registry.unregister(connection_id) {
            let _ = connection.detach();
            info!(conn_id = %connection_id, age_ms = connection.age().as_millis() as u64, "client disconnected");
        }
    }

    /// Announce a `data_update` to every client watching `store_id` or all stores.
    pub fn broadcast(&self, store_id: &str, data_type: DataCategory, data: Value) -> BroadcastReport {
        self.publish(BroadcastRequest::data_update(store_id, data_type, data))
    }

    /// Announce a server-side change of a store's state as a `store_switch`.
    pub fn broadcast_scope_change(&self, store_id: &str, data: Value) -> BroadcastReport {
        self.publish(
            BroadcastRequest::data_update(store_id, DataCategory::StoreInfo, data)
                .with_kind(EventKind::StoreSwitch),
        )
    }

    /// Build one envelope from `request` and deliver it to matching clients.
    pub fn publish(&self, request: BroadcastRequest) -> BroadcastReport {
        self.broadcast_envelope(&request.into_envelope())
    }

    /// Deliver a prebuilt envelope to every client whose scope matches its store.
    pub fn broadcast_envelope(&self, envelope: &Envelope) -> BroadcastReport {
        let mut report = BroadcastReport {
            message_id: envelope.message_id.clone(),
            delivered: 0,
            evicted: 0,
        };
        let json: Arc<str> = match envelope.to_json() {
            Ok(j) => j.into(),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to serialize envelope");
                return report;
            }
        };

        for target in self.targets(&envelope.store_id) {
            if self.deliver(&target, json.clone()) {
                report.delivered += 1;
            } else {
                report.evicted += 1;
            }
        }

        metrics::counter!(crate::metrics::WS_BROADCASTS_TOTAL, "type" => envelope.kind.as_str())
            .increment(1);
        metrics::counter!(crate::metrics::WS_DELIVERIES_TOTAL).increment(report.delivered as u64);
        debug!(
            kind = %envelope.kind,
            store_id = %envelope.store_id,
            data_type = envelope.data_type.map(DataCategory::as_str),
            delivered = report.delivered,
            evicted = report.evicted,
            "broadcast envelope"
        );
        report
    }

    /// Announce a change too large for one envelope as a batch of `bulk_update` chunks.
    ///
    /// Targets are fixed when the call starts. Each receives the chunks in
    /// sequence order; a target that fails is evicted and skipped for the rest.
    pub fn broadcast_bulk(
        &self,
        store_id: &str,
        data_type: DataCategory,
        items: Vec<Value>,
        chunk_size: usize,
        user_id: Option<String>,
    ) -> BulkReport {
        let batch_id = BatchId::new();
        let chunk_size = chunk_size.max(1);
        let total_items = items.len();
        let chunks: Vec<Vec<Value>> = if items.is_empty() {
            vec![Vec::new()]
        } else {
            items.chunks(chunk_size).map(<[Value]>::to_vec).collect()
        };
        let total_chunks = chunks.len();

        let mut report = BulkReport {
            batch_id: batch_id.clone(),
            envelopes: total_chunks,
            delivered: 0,
            evicted: 0,
        };
        let targets = self.targets(store_id);

        for (sequence, chunk) in chunks.into_iter().enumerate() {
            let envelope = Envelope::builder(EventKind::BulkUpdate)
                .store(store_id)
                .data_type(data_type)
                .data(json!({
                    "items": chunk,
                    "totalItems": total_items,
                    "totalChunks": total_chunks,
                }))
                .user_id(user_id.clone())
                .batch(batch_id.clone(), sequence as u64)
                .build();
            let json: Arc<str> = match envelope.to_json() {
                Ok(j) => j.into(),
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "failed to serialize bulk chunk");
                    break;
                }
            };

            for target in targets.iter().filter(|t| !t.is_closed()) {
                if self.deliver(target, json.clone()) {
                    report.delivered += 1;
                } else {
                    report.evicted += 1;
                }
            }
        }

        metrics::counter!(crate::metrics::WS_BROADCASTS_TOTAL, "type" => EventKind::BulkUpdate.as_str())
            .increment(report.envelopes as u64);
        metrics::counter!(crate::metrics::WS_DELIVERIES_TOTAL).increment(report.delivered as u64);
        info!(
            batch_id = %batch_id,
            store_id,
            data_type = data_type.as_str(),
            total_items,
            envelopes = report.envelopes,
            delivered = report.delivered,
            "bulk broadcast"
        );
        report
    }

    /// Send a control envelope to every connection regardless of scope.
    ///
    /// Returns how many connections it was queued on.
    pub fn announce(&self, envelope: &Envelope) -> usize {
        let json: Arc<str> = match envelope.to_json() {
            Ok(j) => j.into(),
            Err(e) => {
                warn!(error = %e, "failed to serialize announcement");
                return 0;
            }
        };
        self.registry
            .snapshot()
            .iter()
            .filter(|s| self.deliver(&s.connection, json.clone()))
            .count()
    }

    /// Connection counts, overall and per subscribed store.
    pub fn stats(&self) -> ConnectionStats {
        self.registry.stats()
    }

    fn targets(&self, store_id: &str) -> Vec<Arc<ClientConnection>> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|s| s.connection)
            .filter(|conn| conn.wants_store(store_id))
            .collect()
    }

    /// Queue on one connection, evicting it on failure. Returns whether it was queued.
    fn deliver(&self, connection: &ClientConnection, json: Arc<str>) -> bool {
        match connection.send_text(json) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = %connection.id(), error = %e, "failed to send to client");
                let _ = self.registry.evict(connection, CloseReason::SEND_FAILURE);
                false
            }
        }
    }

    fn unicast(&self, connection: &ClientConnection, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(json) => {
                let _ = self.deliver(connection, json.into());
            }
            Err(e) => warn!(conn_id = %connection.id(), error = %e, "failed to serialize envelope"),
        }
    }
}
