use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Error taxonomy for the replication engine.
///
/// Transient and protocol errors never reach the loop's caller: they are
/// logged and handled in place (disconnect-and-retry, drop-the-frame).
/// `SubmitLocal` is the only path that surfaces an `AppError` to a caller.
#[derive(Debug)]
pub enum AppError {
    /// Read/write/dial failure or handshake token expiry. Peer is disconnected
    /// and a reconnect is scheduled; never surfaced upward.
    Transient(String),
    /// Unknown message type, missing field, or decode failure. The frame is
    /// dropped; the connection stays open.
    Protocol(String),
    /// Storage adapter call failed while applying an update. The update is
    /// re-queued in the dependency buffer for the periodic sweep.
    Storage(String),
    /// Bearer token missing, malformed, expired, or signed with the wrong
    /// secret. Connection is rejected with 401; no state change.
    Unauthorized(String),
    /// Configuration invalid at startup; fails the process before it serves.
    Configuration(String),
    /// Persisted state failed to deserialize; refuse to start rather than
    /// silently diverge.
    StateCorrupt(String),
    NotFound(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Transient(msg) => write!(f, "transient error: {}", msg),
            AppError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            AppError::Storage(msg) => write!(f, "storage error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            AppError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            AppError::StateCorrupt(msg) => write!(f, "state corrupt: {}", msg),
            AppError::NotFound(msg) => write!(f, "not found: {}", msg),
            AppError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Transient(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Protocol(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Storage(msg) => {
                tracing::error!("storage error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Configuration(msg) => {
                tracing::error!("configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::StateCorrupt(msg) => {
                tracing::error!("state corrupt: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        let body = Json(json!({ "error": message, "status": status.as_u16() }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        AppError::Protocol(format!("codec error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::StateCorrupt(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
