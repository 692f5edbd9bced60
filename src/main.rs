//! TradeBridge: central order broker between a trade-event producer and an
//! execution consumer. Durable FIFO queue with idempotent ingest, atomic
//! claiming with lease recovery, and retention GC, behind a small HTTP
//! surface.

use anyhow::{Context, Result};
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle, time::interval};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradebridge_backend::{
    api::{build_router, AppState},
    models::Config,
    storage::{OrderStore, TicketMapStore},
};

/// Fixed pause after a failed background iteration before the loop continues.
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Arc::new(Config::from_env());
    info!(
        listen = %config.listen_address,
        db = %config.database_path,
        auth_enabled = !config.api_key.is_empty(),
        rate_limit_enabled = config.rate_limit_enabled,
        "tradebridge broker starting"
    );

    let store = Arc::new(
        OrderStore::new(&config.database_path, &config).context("failed to open order store")?,
    );
    let tickets = Arc::new(
        TicketMapStore::new(&config.database_path).context("failed to open ticket map")?,
    );

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            tradebridge_backend::metrics::describe();
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder, /metrics disabled");
            None
        }
    };

    let state = AppState {
        store: store.clone(),
        tickets,
        config: config.clone(),
        started_at: Instant::now(),
        prometheus,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = vec![
        tokio::spawn(reaper_polling(
            store.clone(),
            config.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(retention_gc_polling(
            store.clone(),
            config.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(metrics_sampler_polling(store.clone(), shutdown_rx.clone())),
    ];

    let app = build_router(state);
    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;
    info!(addr = %config.listen_address, "broker listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // stop the loops; each finishes its current iteration first
    let _ = shutdown_tx.send(true);
    await_loops(loops).await;
    info!("shutdown complete");
    Ok(())
}

async fn await_loops(loops: Vec<JoinHandle<()>>) {
    for handle in loops {
        let _ = handle.await;
    }
}

/// Stale-lease reaper: returns expired claims to pending, fallows events at
/// the retry bound.
async fn reaper_polling(
    store: Arc<OrderStore>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.reaper_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.reap_stale(config.lease_duration, config.max_retries) {
                    Ok(outcome) if outcome.reclaimed > 0 || outcome.newly_fallow > 0 => {
                        info!(
                            reclaimed = outcome.reclaimed,
                            newly_fallow = outcome.newly_fallow,
                            "reaper released stale leases"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "reaper iteration failed");
                        tokio::time::sleep(LOOP_ERROR_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Retention GC: deletes done events past the retention window.
async fn retention_gc_polling(
    store: Arc<OrderStore>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.cleanup_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.cleanup(config.max_order_age) {
                    Ok(0) => {}
                    Ok(deleted) => {
                        info!(deleted, "retention GC removed old done orders");
                        let _ = store.optimize();
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "retention GC iteration failed");
                        tokio::time::sleep(LOOP_ERROR_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Keeps the pending/retry gauges fresh between ingest and ack updates.
async fn metrics_sampler_polling(store: Arc<OrderStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.list_stats() {
                    Ok(stats) => {
                        tradebridge_backend::metrics::queue_gauges(stats.pending, stats.retrying);
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "metrics sampler iteration failed");
                        tokio::time::sleep(LOOP_ERROR_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradebridge_backend=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // standard dotenv search (cwd + parents), then the crate directory
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
