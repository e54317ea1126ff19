//! Error types for the registry and the chat transports.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Registry domain error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("user already registered: {0}")]
    NameConflict(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("illegal user name: {0:?}")]
    InvalidName(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Error code string for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameConflict(_) => "NAME_CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NameConflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidName(_) | Self::InvalidAddress(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Failures inside a transport or a liveness probe.
///
/// These never reach the caller of a send or a probe; they are logged and
/// turned into "message lost" or "peer not alive".
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not open a local socket after {attempts} attempts: {source}")]
    Bind {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
