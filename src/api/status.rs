//! Observability and reconciliation endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    api::AppState,
    error::{ApiError, ApiResult},
    models::{format_timestamp, sanitize_capped, StoredOrder, TicketMapping},
    storage::QueueStats,
};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: QueueStats,
    pub timestamp: String,
}

/// `GET /stats`
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let stats = state.store.list_stats()?;
    Ok(Json(StatsResponse {
        stats,
        timestamp: format_timestamp(Utc::now()),
    }))
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct QueuePage {
    pub orders: Vec<StoredOrder>,
    pub count: usize,
    pub offset: usize,
}

/// `GET /queue`: page of pending events, oldest first.
pub async fn get_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Json<QueuePage>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);
    let orders = state.store.list_pending(limit, offset)?;
    Ok(Json(QueuePage {
        count: orders.len(),
        orders,
        offset,
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub stats: QueueStats,
}

/// `GET /status`: service identity, uptime, queue snapshot.
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let stats = state.store.list_stats()?;
    Ok(Json(StatusResponse {
        service: "tradebridge",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        stats,
    }))
}

/// `GET /health`: liveness plus a storage ping.
pub async fn health_check(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.ping()?;
    Ok(Json(serde_json::json!({ "status": "healthy" })))
}

/// `GET /metrics`: Prometheus render of the exported metrics.
pub async fn metrics_render(State(state): State<AppState>) -> String {
    state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct TicketMapRequest {
    #[serde(default)]
    pub source_ticket: String,
    #[serde(default)]
    pub slave_ticket: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub size: String,
}

/// `POST /ticket-map`: consumer write-through of its execution identifiers.
pub async fn put_ticket_mapping(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let request: TicketMapRequest = serde_json::from_str(&body)
        .map_err(|_| ApiError::Validation("malformed JSON".into()))?;

    let source_ticket = sanitize_capped(&request.source_ticket, 64);
    let slave_ticket = sanitize_capped(&request.slave_ticket, 64);
    if source_ticket.is_empty() || slave_ticket.is_empty() {
        return Err(ApiError::Validation(
            "source_ticket and slave_ticket are required".into(),
        ));
    }
    let symbol = sanitize_capped(&request.symbol, 20);
    let size = sanitize_capped(&request.size, 50);

    state
        .tickets
        .put_mapping(&source_ticket, &slave_ticket, &symbol, &size)?;
    info!(source_ticket = %source_ticket, slave_ticket = %slave_ticket, "ticket mapping stored");

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /ticket-map/{source_ticket}`
pub async fn get_ticket_mapping(
    State(state): State<AppState>,
    Path(source_ticket): Path<String>,
) -> ApiResult<Json<TicketMapping>> {
    match state.tickets.get_mapping(&source_ticket)? {
        Some(mapping) => Ok(Json(mapping)),
        None => Err(ApiError::NotFound),
    }
}
