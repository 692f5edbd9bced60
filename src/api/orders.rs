//! Order lifecycle endpoints: ingest, poll, ack, retry, inspect.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    api::{refresh_queue_gauges, AppState},
    error::{ApiError, ApiResult},
    models::{json_depth, sanitize_capped, validate_envelope, OrderEnvelope, StoredOrder},
    storage::{AckOutcome, RetryOutcome},
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub max_count: Option<usize>,
    pub consumer_id: Option<String>,
}

/// `POST /orders`: producer ingest with idempotent dedup.
///
/// The body is parsed in two steps so the nesting bound applies before the
/// envelope shape is interpreted.
pub async fn ingest_order(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<OrderAck>> {
    let value: Value = serde_json::from_str(&body)
        .map_err(|_| ApiError::Validation("malformed JSON".into()))?;

    if json_depth(&value) > state.config.max_payload_depth {
        return Err(ApiError::Validation("payload nesting too deep".into()));
    }

    let envelope: OrderEnvelope = serde_json::from_value(value)
        .map_err(|_| ApiError::Validation("invalid event envelope".into()))?;
    let event = validate_envelope(envelope).map_err(ApiError::Validation)?;

    let outcome = state.store.ingest(&event)?;
    crate::metrics::order_received();
    refresh_queue_gauges(&state.store);

    if outcome.duplicate {
        debug!(order_id = %outcome.id, "duplicate ingest resolved to existing order");
    } else {
        info!(
            order_id = %outcome.id,
            event_type = event.event_type.as_str(),
            symbol = %event.payload.symbol,
            "order queued"
        );
    }

    Ok(Json(OrderAck {
        order_id: outcome.id,
        status: "Queued",
    }))
}

/// `GET /orders/pending`: atomic batch claim for one consumer.
pub async fn poll_pending(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<Vec<StoredOrder>>> {
    let consumer_id = sanitize_capped(&query.consumer_id.unwrap_or_default(), 64);
    if consumer_id.is_empty() {
        return Err(ApiError::Validation("consumer_id is required".into()));
    }

    let max_count = query.max_count.unwrap_or(10);
    if max_count == 0 {
        return Ok(Json(Vec::new()));
    }

    let batch = state.store.claim(max_count, &consumer_id)?;
    if !batch.is_empty() {
        debug!(consumer_id = %consumer_id, count = batch.len(), "claimed batch");
        refresh_queue_gauges(&state.store);
    }
    Ok(Json(batch))
}

/// `POST /orders/{id}/processed`: consumer acknowledgement. Idempotent.
pub async fn ack_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OrderAck>> {
    let outcome = state.store.mark_done(&id)?;
    refresh_queue_gauges(&state.store);

    match outcome {
        AckOutcome::Transitioned => Ok(Json(OrderAck {
            order_id: id,
            status: "Processed",
        })),
        AckOutcome::AlreadyDone => Ok(Json(OrderAck {
            order_id: id,
            status: "AlreadyProcessed",
        })),
        AckOutcome::NotFound => Err(ApiError::NotFound),
    }
}

/// `POST /orders/{id}/retry`: operator requeue with no delay.
pub async fn retry_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OrderAck>> {
    match state.store.schedule_retry(&id, Duration::ZERO)? {
        RetryOutcome::Rescheduled => {
            info!(order_id = %id, "order requeued by operator");
            Ok(Json(OrderAck {
                order_id: id,
                status: "Requeued",
            }))
        }
        RetryOutcome::AlreadyDone => {
            Err(ApiError::Validation("order already processed".into()))
        }
        RetryOutcome::NotFound => Err(ApiError::NotFound),
    }
}

/// `GET /orders/{id}`: full stored row, widened operator read model.
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StoredOrder>> {
    match state.store.get(&id)? {
        Some(order) => Ok(Json(order)),
        None => Err(ApiError::NotFound),
    }
}
