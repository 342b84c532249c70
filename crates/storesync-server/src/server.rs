//! `SyncServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use storesync_core::{DataCategory, Envelope, EventKind};
use storesync_settings::SyncSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::{ApiError, ServerError};
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::CloseReason;
use crate::websocket::handler;
use crate::websocket::liveness::LivenessMonitor;
use crate::websocket::registry::{ConnectionRegistry, ConnectionStats};
use crate::websocket::router::{
    BroadcastReport, BroadcastRequest, BulkReport, DEFAULT_BULK_CHUNK_SIZE, MessageRouter,
};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Router for inbound traffic and broadcasts.
    pub router: Arc<MessageRouter>,
    /// When the server started.
    pub start_time: Instant,
    /// Upgrades beyond this many live connections are refused.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The sync server: owns the registry, router and liveness monitor.
#[derive(Debug)]
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    start_time: Instant,
}

impl SyncServer {
    /// Create a new server with an empty registry. Nothing runs until
    /// [`start`](Self::start) or [`listen`](Self::listen).
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.send_queue_capacity));
        let router = Arc::new(MessageRouter::new(registry.clone()));
        Self {
            config,
            registry,
            router,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            monitor: Mutex::new(None),
            start_time: Instant::now(),
        }
    }

    /// Validate `settings` and create a server from them.
    pub fn from_settings(settings: &SyncSettings) -> Result<Self, ServerError> {
        settings.validate()?;
        Ok(Self::new(ServerConfig::from(settings)))
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn app(&self) -> Router {
        let state = AppState {
            router: self.router.clone(),
            start_time: self.start_time,
            max_connections: self.config.max_connections,
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/sync/stats", get(stats_handler))
            .route("/api/sync/broadcast", post(broadcast_handler))
            .route("/api/sync/bulk", post(bulk_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Start the liveness monitor. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let handle = LivenessMonitor::new(self.registry.clone(), self.config.liveness_interval)
            .spawn(self.shutdown.token());
        *monitor = Some(handle);
    }

    /// Start the monitor, bind the listener and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`).
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        self.start();
        let app = self.app();
        let token = self.shutdown.token();
        self.shutdown.track(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "http server failed");
            }
        }));

        info!(%local_addr, ws_path = %self.config.ws_path, "sync server listening");
        Ok(local_addr)
    }

    /// Stop accepting connections and halt the monitor, tell every client the
    /// server is going away, close all connections, then wait for background
    /// tasks to drain.
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let notified = self.router.announce(&Envelope::shutting_down());
        let closed = self.registry.close_all(CloseReason::GOING_AWAY);
        info!(notified, closed, "closing client connections");

        if let Some(monitor) = self.monitor.lock().take() {
            self.shutdown.track(monitor);
        }
        self.shutdown
            .graceful_shutdown(self.config.shutdown_timeout)
            .await;
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The message router, for in-process broadcast callers.
    pub fn message_router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET {ws_path}
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let active = state.router.registry().len();
    if active >= state.max_connections {
        warn!(active, max = state.max_connections, "refusing websocket upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    let router = state.router.clone();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handler::handle_socket(socket, router))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.router.registry().len();
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /api/sync/stats
async fn stats_handler(State(state): State<AppState>) -> Json<ConnectionStats> {
    Json(state.router.stats())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastBody {
    store_id: String,
    data_type: DataCategory,
    #[serde(default)]
    data: Value,
    #[serde(default, rename = "type")]
    kind: Option<EventKind>,
    #[serde(default)]
    user_id: Option<String>,
}

/// POST /api/sync/broadcast
async fn broadcast_handler(
    State(state): State<AppState>,
    Json(body): Json<BroadcastBody>,
) -> Result<Json<BroadcastReport>, ApiError> {
    if body.store_id.is_empty() {
        return Err(ApiError::BadRequest("storeId must not be empty".into()));
    }
    let kind = body.kind.unwrap_or(EventKind::DataUpdate);
    if !matches!(kind, EventKind::DataUpdate | EventKind::StoreSwitch) {
        return Err(ApiError::BadRequest(format!(
            "type must be data_update or store_switch, got {kind}"
        )));
    }

    let request = BroadcastRequest::data_update(body.store_id, body.data_type, body.data)
        .with_kind(kind)
        .with_user(body.user_id);
    Ok(Json(state.router.publish(request)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkBody {
    store_id: String,
    data_type: DataCategory,
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    user_id: Option<String>,
}

/// POST /api/sync/bulk
async fn bulk_handler(
    State(state): State<AppState>,
    Json(body): Json<BulkBody>,
) -> Result<Json<BulkReport>, ApiError> {
    if body.store_id.is_empty() {
        return Err(ApiError::BadRequest("storeId must not be empty".into()));
    }
    Ok(Json(state.router.broadcast_bulk(
        &body.store_id,
        body.data_type,
        body.items,
        body.chunk_size.unwrap_or(DEFAULT_BULK_CHUNK_SIZE),
        body.user_id,
    )))
}
