//! # storesync-core
//!
//! Message model shared by the sync server and its clients.
//!
//! - [`envelope`]: event kinds, data categories, the outbound [`Envelope`]
//!   and its builder, inbound client message parsing
//! - [`ids`]: branded identifiers for connections, messages and batches
//! - [`errors`]: protocol and transport error types

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;

pub use envelope::{DataCategory, Envelope, EnvelopeBuilder, EventKind, InboundMessage};
pub use errors::{ProtocolError, SendError};
pub use ids::{BatchId, ConnectionId, MessageId};
