//! WebSocket connection management and store-scoped fan-out.

pub mod connection;
pub mod handler;
pub mod liveness;
pub mod registry;
pub mod router;
