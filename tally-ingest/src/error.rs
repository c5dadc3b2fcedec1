//! Error types for tally-ingest

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
///
/// The status codes are part of the provider contract: 401 tells the
/// provider to stop retrying a delivery we will never accept, while 500
/// explicitly invites a retry.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Signature/authentication failure (401) - terminal, never retried
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed payload (400) - terminal
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Body over the byte ceiling (413)
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Caller exceeded the request budget (429)
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Transient failure (500) - signals the provider to retry
    #[error("Retryable failure: {0}")]
    Retryable(String),

    /// tally-common error
    #[error("Common error: {0}")]
    Common(#[from] tally_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "payload exceeds size ceiling".to_string(),
            ),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "request budget exceeded".to_string(),
            ),
            ApiError::Retryable(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "RETRYABLE", msg),
            ApiError::Common(ref err) => {
                let code = if err.is_retryable() {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::BAD_REQUEST
                };
                (code, "COMMON_ERROR", err.to_string())
            }
        };

        let body = Json(json!({
            "success": false,
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
