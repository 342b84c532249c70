//! The unit of data pushed to sync clients, and the shape of what they send back.
//!
//! Wire form (one JSON object per WebSocket text frame):
//!
//! ```text
//! { "type", "storeId", "dataType", "data", "timestamp",
//!   "userId"?, "batchId"?, "sequenceNumber"?, "messageId" }
//! ```
//!
//! Envelopes are built once through [`EnvelopeBuilder`], which stamps a
//! fresh [`MessageId`] and an epoch-millis timestamp. Timestamps never go
//! backwards within a process, even if the wall clock does.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::ProtocolError;
use crate::ids::{BatchId, ConnectionId, MessageId};

/// Classification of an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Persisted data for a store changed.
    DataUpdate,
    /// A store's state changed (server side), or a client re-declares its scope.
    StoreSwitch,
    /// One chunk of a multi-envelope change.
    BulkUpdate,
    /// Connection lifecycle and error notices.
    ConnectionStatus,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
}

impl EventKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataUpdate => "data_update",
            Self::StoreSwitch => "store_switch",
            Self::BulkUpdate => "bulk_update",
            Self::ConnectionStatus => "connection_status",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Look up a kind by wire name. Unknown names yield `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "data_update" => Some(Self::DataUpdate),
            "store_switch" => Some(Self::StoreSwitch),
            "bulk_update" => Some(Self::BulkUpdate),
            "connection_status" => Some(Self::ConnectionStatus),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which domain object a change concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Product catalogue.
    Products,
    /// Dashboard widgets and summary figures.
    Dashboard,
    /// Sales snapshots.
    Sales,
    /// Account health metrics.
    AccountHealth,
    /// Legal entity details.
    LegalEntity,
    /// Voice-of-customer data.
    VocData,
    /// Store profile.
    StoreInfo,
}

impl DataCategory {
    /// All categories, in wire order.
    pub const ALL: [Self; 7] = [
        Self::Products,
        Self::Dashboard,
        Self::Sales,
        Self::AccountHealth,
        Self::LegalEntity,
        Self::VocData,
        Self::StoreInfo,
    ];

    /// Wire name of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Dashboard => "dashboard",
            Self::Sales => "sales",
            Self::AccountHealth => "account_health",
            Self::LegalEntity => "legal_entity",
            Self::VocData => "voc_data",
            Self::StoreInfo => "store_info",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown data type: {s}"))
    }
}

/// A uniquely identified, timestamped message bound for clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event classification.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Store the event concerns; empty for connection control messages.
    #[serde(default)]
    pub store_id: String,
    /// Domain object that changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataCategory>,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Emission time, epoch milliseconds.
    pub timestamp: i64,
    /// User whose action caused the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Shared by every envelope of one bulk change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    /// Position of this envelope within its batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Unique per envelope.
    pub message_id: MessageId,
}

impl Envelope {
    /// Start building an envelope of the given kind.
    pub fn builder(kind: EventKind) -> EnvelopeBuilder {
        EnvelopeBuilder::new(kind)
    }

    /// Greeting unicast to a client right after it registers.
    pub fn connected(connection_id: &ConnectionId) -> Self {
        Self::builder(EventKind::ConnectionStatus)
            .data(json!({
                "status": "connected",
                "clientId": connection_id,
                "connectionId": connection_id,
            }))
            .build()
    }

    /// Error notice returned to a client whose message could not be handled.
    pub fn status_error(message: impl fmt::Display) -> Self {
        Self::builder(EventKind::ConnectionStatus)
            .data(json!({
                "status": "error",
                "error": message.to_string(),
            }))
            .build()
    }

    /// Notice sent to every client before the server closes its connection.
    pub fn shutting_down() -> Self {
        Self::builder(EventKind::ConnectionStatus)
            .data(json!({ "status": "shutting_down" }))
            .build()
    }

    /// Liveness probe.
    pub fn probe() -> Self {
        Self::builder(EventKind::Ping).build()
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Assembles an [`Envelope`]; identity and timestamp are stamped in [`build`](Self::build).
#[derive(Clone, Debug)]
pub struct EnvelopeBuilder {
    kind: EventKind,
    store_id: String,
    data_type: Option<DataCategory>,
    data: Value,
    user_id: Option<String>,
    batch: Option<(BatchId, u64)>,
}

impl EnvelopeBuilder {
    /// New builder with an empty store, no category and a null payload.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            store_id: String::new(),
            data_type: None,
            data: Value::Null,
            user_id: None,
            batch: None,
        }
    }

    /// Store the event concerns.
    #[must_use]
    pub fn store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = store_id.into();
        self
    }

    /// Domain object that changed.
    #[must_use]
    pub fn data_type(mut self, category: DataCategory) -> Self {
        self.data_type = Some(category);
        self
    }

    /// Payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attribute the change to a user.
    #[must_use]
    pub fn user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Mark the envelope as chunk `sequence` of `batch`.
    #[must_use]
    pub fn batch(mut self, batch: BatchId, sequence: u64) -> Self {
        self.batch = Some((batch, sequence));
        self
    }

    /// Stamp a fresh identifier and timestamp.
    pub fn build(self) -> Envelope {
        let (batch_id, sequence_number) = match self.batch {
            Some((id, seq)) => (Some(id), Some(seq)),
            None => (None, None),
        };
        Envelope {
            kind: self.kind,
            store_id: self.store_id,
            data_type: self.data_type,
            data: self.data,
            timestamp: next_timestamp_ms(),
            user_id: self.user_id,
            batch_id,
            sequence_number,
            message_id: MessageId::new(),
        }
    }
}

static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock epoch millis, clamped so successive calls never decrease.
fn next_timestamp_ms() -> i64 {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_TIMESTAMP_MS.fetch_max(now, Ordering::AcqRel);
    prev.max(now)
}

/// A message received from a client.
///
/// Only `type` is required. Unknown kinds parse successfully so newer
/// clients do not break older servers; [`event_kind`](Self::event_kind)
/// returns `None` for them.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Raw wire kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Store named by the client, if any.
    #[serde(default)]
    pub store_id: Option<String>,
    /// Raw data category, if any.
    #[serde(default)]
    pub data_type: Option<String>,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Client-side message identifier.
    #[serde(default)]
    pub message_id: Option<String>,
}

impl InboundMessage {
    /// Parse a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;
        let Some(object) = value.as_object() else {
            return Err(ProtocolError::NotAnObject);
        };
        if !object.get("type").is_some_and(Value::is_string) {
            return Err(ProtocolError::MissingType);
        }
        serde_json::from_value(value).map_err(ProtocolError::Malformed)
    }

    /// Known kind, or `None` for kinds this server does not understand.
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_wire(&self.kind)
    }

    /// Store scope requested by a `store_switch` message.
    ///
    /// Reads the top-level `storeId`, falling back to `data.storeId`.
    /// Absent or empty means the wildcard scope (`None`).
    pub fn requested_scope(&self) -> Option<String> {
        let top = self.store_id.as_deref().filter(|s| !s.is_empty());
        let nested = self
            .data
            .get("storeId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        top.or(nested).map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn event_kind_wire_names_roundtrip() {
        for kind in [
            EventKind::DataUpdate,
            EventKind::StoreSwitch,
            EventKind::BulkUpdate,
            EventKind::ConnectionStatus,
            EventKind::Ping,
            EventKind::Pong,
        ] {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(EventKind::from_wire("subscribe"), None);
    }

    #[test]
    fn data_category_parses_wire_names() {
        for cat in DataCategory::ALL {
            assert_eq!(cat.as_str().parse::<DataCategory>().unwrap(), cat);
        }
        assert!("inventory".parse::<DataCategory>().is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::builder(EventKind::DataUpdate)
            .store("store-1")
            .data_type(DataCategory::AccountHealth)
            .data(json!({"score": 98}))
            .build();
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "data_update");
        assert_eq!(value["storeId"], "store-1");
        assert_eq!(value["dataType"], "account_health");
        assert_eq!(value["data"]["score"], 98);
        assert!(value["timestamp"].is_i64());
        assert!(value["messageId"].is_string());
        assert!(value.get("batchId").is_none());
        assert!(value.get("sequenceNumber").is_none());
        assert!(value.get("userId").is_none());
    }

    #[test]
    fn batch_fields_serialized_when_set() {
        let batch = BatchId::new();
        let env = Envelope::builder(EventKind::BulkUpdate)
            .store("store-1")
            .batch(batch.clone(), 3)
            .user_id(Some("user-7".into()))
            .build();
        let value: Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["batchId"], batch.as_str());
        assert_eq!(value["sequenceNumber"], 3);
        assert_eq!(value["userId"], "user-7");
    }

    #[test]
    fn connected_carries_client_id() {
        let id = ConnectionId::new();
        let env = Envelope::connected(&id);
        assert_eq!(env.kind, EventKind::ConnectionStatus);
        assert!(env.store_id.is_empty());
        assert_eq!(env.data["status"], "connected");
        assert_eq!(env.data["clientId"], id.as_str());
    }

    #[test]
    fn status_error_carries_message() {
        let env = Envelope::status_error(ProtocolError::NotAnObject);
        assert_eq!(env.data["status"], "error");
        assert_eq!(env.data["error"], "message must be a JSON object");
    }

    #[test]
    fn probe_is_ping() {
        let env = Envelope::probe();
        assert_eq!(env.kind, EventKind::Ping);
        assert!(env.data_type.is_none());
    }

    #[test]
    fn parse_store_switch() {
        let msg = InboundMessage::parse(r#"{"type":"store_switch","storeId":"store-1"}"#).unwrap();
        assert_eq!(msg.event_kind(), Some(EventKind::StoreSwitch));
        assert_eq!(msg.requested_scope().as_deref(), Some("store-1"));
    }

    #[test]
    fn scope_falls_back_to_payload() {
        let msg =
            InboundMessage::parse(r#"{"type":"store_switch","data":{"storeId":"store-9"}}"#)
                .unwrap();
        assert_eq!(msg.requested_scope().as_deref(), Some("store-9"));
    }

    #[test]
    fn empty_scope_is_wildcard() {
        let msg = InboundMessage::parse(r#"{"type":"store_switch","storeId":""}"#).unwrap();
        assert_eq!(msg.requested_scope(), None);
    }

    #[test]
    fn parse_unknown_kind_is_ok() {
        let msg = InboundMessage::parse(r#"{"type":"subscribe_v2","extra":1}"#).unwrap();
        assert_eq!(msg.event_kind(), None);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_matches!(InboundMessage::parse("nope"), Err(ProtocolError::InvalidJson(_)));
        assert_matches!(InboundMessage::parse("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_matches!(
            InboundMessage::parse(r#"{"storeId":"x"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_matches!(InboundMessage::parse(r#"{"type":5}"#), Err(ProtocolError::MissingType));
        assert_matches!(
            InboundMessage::parse(r#"{"type":"store_switch","storeId":42}"#),
            Err(ProtocolError::Malformed(_))
        );
    }

    proptest! {
        #[test]
        fn envelope_ids_pairwise_distinct(n in 1usize..500) {
            let ids: HashSet<MessageId> = (0..n)
                .map(|_| Envelope::builder(EventKind::DataUpdate).build().message_id)
                .collect();
            prop_assert_eq!(ids.len(), n);
        }

        #[test]
        fn timestamps_never_decrease(n in 2usize..200) {
            let stamps: Vec<i64> = (0..n)
                .map(|_| Envelope::builder(EventKind::Ping).build().timestamp)
                .collect();
            for w in stamps.windows(2) {
                prop_assert!(w[0] <= w[1]);
            }
        }
    }
}
