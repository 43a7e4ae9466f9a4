//! Error types for leadflow-ingest

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - merge retries exhausted and not deferrable
    #[error("Conflict: {0}")]
    Conflict(String),

    /// CRM temporarily unavailable (503)
    #[error("CRM unavailable: {0}")]
    Unavailable(String),

    /// CRM rejected the payload (502)
    #[error("CRM rejected request: {0}")]
    BadGateway(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<leadflow_common::Error> for ApiError {
    fn from(err: leadflow_common::Error) -> Self {
        use leadflow_common::Error;
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::Lookup(msg) => ApiError::Unavailable(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::Sync { retryable: true, message } => ApiError::Unavailable(message),
            Error::Sync { retryable: false, message } => ApiError::BadGateway(message),
            Error::Config(msg) => ApiError::Internal(msg),
            Error::Database(err) => ApiError::Internal(err.to_string()),
            Error::Io(err) => ApiError::Internal(err.to_string()),
            Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "CRM_UNAVAILABLE", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "SYNC_REJECTED", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
