//! Server and HTTP API errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Failures starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    Settings(#[from] storesync_settings::SettingsError),
}

/// Errors returned by the HTTP API as `{"error": ...}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body was well-formed JSON but not acceptable.
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
