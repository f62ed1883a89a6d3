//! Unified error handling for the data service and its HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Failure reported by a [`RemoteStore`](crate::remote::RemoteStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote call timed out")]
    Timeout,

    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote document not found: {0}")]
    NotFound(String),

    #[error("remote conflict: {0}")]
    Conflict(String),

    #[error("remote rejected the write: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Timeout | RemoteError::Unavailable(_))
    }
}

/// Error type of the data service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] stowage_engine::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Application error type for HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Service(#[from] Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use stowage_engine::Error as EngineError;

        let (status, error_message, details) = match &self {
            AppError::Service(Error::Engine(e)) => match e {
                EngineError::DocumentNotFound(_) | EngineError::NotQueued(_) => {
                    (StatusCode::NOT_FOUND, e.to_string(), None)
                }
                EngineError::OperationOnDeleted(_) | EngineError::AlreadyInFlight(_) => {
                    (StatusCode::CONFLICT, e.to_string(), None)
                }
                EngineError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, e.to_string(), None),
            },
            AppError::Service(Error::Remote(e)) => {
                tracing::warn!("Remote error: {:?}", e);
                (StatusCode::BAD_GATEWAY, "Remote error".to_string(), Some(e.to_string()))
            }
            AppError::Service(e) => {
                tracing::error!("Storage error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage error".to_string(),
                    None,
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

impl From<stowage_engine::Error> for AppError {
    fn from(e: stowage_engine::Error) -> Self {
        AppError::Service(Error::Engine(e))
    }
}

/// Result type alias for handlers.
pub type AppResult<T> = std::result::Result<T, AppError>;
