//! # storesync-server
//!
//! Axum HTTP + `WebSocket` server that keeps store dashboards in sync.
//!
//! - `WebSocket` gateway: connection registry, per-connection outbound queues
//! - Liveness monitor: probe-then-evict sweeps on a fixed interval
//! - Store-scoped broadcasting of data changes, including chunked bulk updates
//! - HTTP endpoints: health, connection stats, broadcast ingress, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{ApiError, ServerError};
pub use server::SyncServer;
pub use websocket::registry::{ConnectionRegistry, ConnectionStats};
pub use websocket::router::{BroadcastReport, BroadcastRequest, BulkReport, MessageRouter};
