//! Protocol and transport errors.

use thiserror::Error;

/// An inbound client message could not be understood.
///
/// The `Display` text is echoed back to the sender in a
/// `connection_status` error envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// Valid JSON, but not an object.
    #[error("message must be a JSON object")]
    NotAnObject,
    /// The object has no string `type` field.
    #[error("message is missing a string \"type\" field")]
    MissingType,
    /// A known field has the wrong shape.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Enqueueing a frame on a connection's outbound queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The queue is at capacity; the client is not draining it.
    #[error("outbound queue full")]
    Full,
    /// The connection's writer has gone away or the handle was closed.
    #[error("connection closed")]
    Closed,
}
