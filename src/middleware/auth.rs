//! Shared-secret pre-filter.
//!
//! A single header check: `X-API-Key` must equal the configured secret. An
//! empty configured secret disables the filter entirely.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::{error::ApiError, models::Config};

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(
    State(config): State<Arc<Config>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if config.api_key.is_empty() {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok());

    match presented {
        Some(key) if key == config.api_key => Ok(next.run(req).await),
        _ => Err(ApiError::Auth),
    }
}
