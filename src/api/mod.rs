//! HTTP surface: a thin translation layer over the storage engine.

pub mod orders;
pub mod status;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{sync::Arc, time::Instant};
use tower_http::cors::CorsLayer;

use crate::{
    middleware::{
        rate_limit_middleware, request_logging, require_api_key, RateLimitConfig, RateLimiter,
    },
    models::Config,
    storage::{OrderStore, TicketMapStore},
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<OrderStore>,
    pub tickets: Arc<TicketMapStore>,
    pub config: Arc<Config>,
    pub started_at: Instant,
    /// Present when the Prometheus recorder was installed (absent in tests).
    pub prometheus: Option<PrometheusHandle>,
}

/// Refresh the queue gauges from a stats snapshot. Called inline on ingest
/// and ack, and periodically by the metrics sampler loop.
pub(crate) fn refresh_queue_gauges(store: &OrderStore) {
    if let Ok(stats) = store.list_stats() {
        crate::metrics::queue_gauges(stats.pending, stats.retrying);
    }
}

/// Assemble the full router: public liveness routes plus the pre-filtered
/// order surface. Pre-filters honour the configured shared secret and token
/// bucket; CORS and request logging wrap everything.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(status::health_check))
        .route("/metrics", get(status::metrics_render))
        .with_state(state.clone());

    let mut protected = Router::new()
        .route("/orders", post(orders::ingest_order))
        .route("/orders/pending", get(orders::poll_pending))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/processed", post(orders::ack_order))
        .route("/orders/:id/retry", post(orders::retry_order))
        .route("/stats", get(status::get_stats))
        .route("/queue", get(status::get_queue))
        .route("/status", get(status::get_status))
        .route("/ticket-map", post(status::put_ticket_mapping))
        .route("/ticket-map/:source_ticket", get(status::get_ticket_mapping))
        .route_layer(axum_mw::from_fn_with_state(
            state.config.clone(),
            require_api_key,
        ));

    if state.config.rate_limit_enabled {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_minute: state.config.rate_limit_per_minute,
            whitelist: state.config.rate_limit_whitelist.clone(),
        });
        protected = protected.route_layer(axum_mw::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));
    }

    Router::new()
        .merge(public)
        .merge(protected.with_state(state))
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
}
