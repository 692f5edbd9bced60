//! Error taxonomy at the HTTP boundary.
//!
//! Five kinds, distinguished by type rather than string matching. Storage and
//! outbox internals use `anyhow`; handlers convert with `?` at the boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    /// Input violates the documented contract. Message is safe to return:
    /// it names the violated rule, never the offending value.
    Validation(String),
    /// Pre-filter rejected credentials.
    Auth,
    /// Referenced id does not exist.
    NotFound,
    /// Pre-filter refused based on the token bucket.
    RateLimited { retry_after_secs: u64 },
    /// Anything else. Full chain is logged; the body stays generic.
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            ApiError::Auth => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "missing or invalid API key" })),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "not found" })),
            )
                .into_response(),
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(serde_json::json!({ "error": "rate limit exceeded" })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}
