//! Producer-side durable outbox.
//!
//! Embedded in the producer process. `enqueue` durably records an envelope
//! and hands it to a bounded in-memory FIFO; a timer-driven drain delivers in
//! strict FIFO order through a circuit-broken HTTP client. Delivery is
//! at-least-once; the broker's dedup key collapses replays onto the
//! original id.

pub mod breaker;
pub mod client;
pub mod file_log;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{BridgeClient, IngestAck};
pub use file_log::{OutboxLog, ReplayOutcome};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{env_duration_secs, env_parse, OrderEnvelope};

/// One persisted outbox entry: the wire envelope plus its attempt count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event: OrderEnvelope,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub bridge_url: String,
    pub api_key: String,
    pub dir: PathBuf,
    pub max_queue_size: usize,
    pub max_file_size: u64,
    pub retained_backups: usize,
    pub send_timeout: Duration,
    pub retry_interval: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    /// Time unit of the drain backoff curve. One second in production;
    /// shrunk by tests to keep retry scenarios fast.
    pub backoff_unit: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:5000".to_string(),
            api_key: String::new(),
            dir: PathBuf::from("outbox"),
            max_queue_size: 10_000,
            max_file_size: 100 * 1024 * 1024,
            retained_backups: 10,
            send_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(60),
            circuit_failure_threshold: 10,
            circuit_cooldown: Duration::from_secs(300),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl OutboxConfig {
    pub fn from_env() -> Self {
        let defaults = OutboxConfig::default();
        let max_file_size_mb: u64 = env_parse("MAX_FILE_SIZE_MB", 100);

        Self {
            bridge_url: std::env::var("BRIDGE_URL").unwrap_or(defaults.bridge_url),
            api_key: std::env::var("BRIDGE_API_KEY").unwrap_or_default(),
            dir: std::env::var("OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            max_queue_size: env_parse("MAX_QUEUE_SIZE", defaults.max_queue_size),
            max_file_size: max_file_size_mb * 1024 * 1024,
            retained_backups: env_parse("RETAINED_BACKUPS", defaults.retained_backups),
            send_timeout: env_duration_secs("SEND_TIMEOUT_SECS", defaults.send_timeout),
            retry_interval: env_duration_secs("RETRY_INTERVAL_SECS", defaults.retry_interval),
            circuit_failure_threshold: env_parse(
                "CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            ),
            circuit_cooldown: env_duration_secs("CIRCUIT_COOLDOWN_SECS", defaults.circuit_cooldown),
            backoff_unit: defaults.backoff_unit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxStats {
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub breaker: &'static str,
}

/// Backoff pause before sending an envelope that has already failed `attempts`
/// times: `min(2^(attempts − 1), 60)` units. Fresh envelopes go immediately.
pub(crate) fn drain_backoff(attempts: u32, unit: Duration) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    unit * ((1u64 << shift).min(60) as u32)
}

pub struct Outbox {
    config: OutboxConfig,
    client: BridgeClient,
    log: OutboxLog,
    queue: Mutex<VecDeque<OutboxRecord>>,
    breaker: Mutex<CircuitBreaker>,
    // at most one drain at a time; enqueue-triggered and timer-triggered
    // drains contend here instead of double-sending the head
    drain_gate: tokio::sync::Mutex<()>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Outbox {
    /// Open the outbox directory, replay any persisted envelopes into the
    /// in-memory queue, and truncate the log.
    pub fn new(config: OutboxConfig) -> Result<Arc<Self>> {
        let client = BridgeClient::new(&config.bridge_url, &config.api_key, config.send_timeout)
            .context("failed to build outbox HTTP client")?;
        let log = OutboxLog::new(&config.dir, config.max_file_size, config.retained_backups)?;

        let replay = log.replay()?;
        if replay.skipped > 0 {
            warn!(skipped = replay.skipped, "outbox replay skipped malformed lines");
        }
        let queue: VecDeque<OutboxRecord> = replay.entries.into();
        if !queue.is_empty() {
            info!(replayed = queue.len(), "outbox replayed persisted envelopes");
        }

        let breaker = CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_cooldown);

        Ok(Arc::new(Self {
            client,
            log,
            queue: Mutex::new(queue),
            breaker: Mutex::new(breaker),
            drain_gate: tokio::sync::Mutex::new(()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            config,
        }))
    }

    /// Durably record an envelope and hand it to the delivery queue.
    ///
    /// Always persists to disk first. When the circuit is closed an immediate
    /// drain is kicked off on a background task; when open, the envelope
    /// waits for the retry timer. Safe to call from any thread; the immediate
    /// drain is skipped outside a Tokio runtime.
    pub fn enqueue(self: &Arc<Self>, event: OrderEnvelope) -> Result<()> {
        let record = OutboxRecord { event, attempts: 0 };
        let line = serde_json::to_string(&record).context("failed to serialise envelope")?;
        self.log.append(&line)?;

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue_size {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = total, "outbox queue full, dropped oldest envelope");
            }
            queue.push_back(record);
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let outbox = self.clone();
            handle.spawn(async move { outbox.drain().await });
        }
        Ok(())
    }

    /// Drain the queue head-first: peek, send, dequeue on success. The first
    /// failure stops the cycle so FIFO order survives broker outages.
    pub async fn drain(&self) {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            return;
        };

        loop {
            let Some(record) = self.peek() else { break };
            if !self.breaker.lock().try_acquire() {
                break;
            }

            if record.attempts > 0 {
                tokio::time::sleep(drain_backoff(record.attempts, self.config.backoff_unit)).await;
            }

            match self.client.post_order(&record.event).await {
                Ok(ack) => {
                    self.breaker.lock().record_success();
                    self.pop_head_if_sent(&record);
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(order_id = %ack.order_id, status = %ack.status, "envelope delivered");
                }
                Err(e) => {
                    self.breaker.lock().record_failure();
                    self.bump_head_attempts();
                    warn!(error = %format!("{e:#}"), "envelope delivery failed, drain stopped");
                    break;
                }
            }
        }
    }

    /// Background retry timer. Exits after finishing the in-flight drain once
    /// the shutdown signal fires.
    pub fn spawn_retry_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let outbox = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(outbox.config.retry_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => outbox.drain().await,
                    _ = shutdown.changed() => {
                        outbox.drain().await;
                        break;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            queued: self.queue.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            breaker: self.breaker.lock().state().as_str(),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state()
    }

    fn peek(&self) -> Option<OutboxRecord> {
        self.queue.lock().front().cloned()
    }

    /// Dequeue the head only if it is still the envelope that was sent; an
    /// overflow drop may have replaced it mid-flight.
    fn pop_head_if_sent(&self, sent: &OutboxRecord) {
        let mut queue = self.queue.lock();
        if queue
            .front()
            .map(|front| {
                front.event.source_id == sent.event.source_id
                    && front.event.event_type == sent.event.event_type
            })
            .unwrap_or(false)
        {
            queue.pop_front();
        }
    }

    fn bump_head_attempts(&self) {
        if let Some(front) = self.queue.lock().front_mut() {
            front.attempts += 1;
        }
    }

    #[cfg(test)]
    fn queued_source_ids(&self) -> Vec<String> {
        self.queue
            .lock()
            .iter()
            .map(|r| r.event.source_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderPayload;

    fn envelope(source_id: &str) -> OrderEnvelope {
        OrderEnvelope {
            id: None,
            source_id: source_id.to_string(),
            event_type: "POSITION_OPENED".to_string(),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            payload: OrderPayload {
                symbol: "EURUSD".to_string(),
                ..Default::default()
            },
        }
    }

    /// Outbox pointed at a dead endpoint. Threshold 1 so the first failed
    /// probe opens the circuit and later enqueues stay disk-only.
    fn dead_letter_outbox(dir: &std::path::Path, max_queue_size: usize) -> Arc<Outbox> {
        Outbox::new(OutboxConfig {
            bridge_url: "http://127.0.0.1:1".to_string(),
            dir: dir.to_path_buf(),
            max_queue_size,
            send_timeout: Duration::from_millis(250),
            circuit_failure_threshold: 1,
            circuit_cooldown: Duration::from_secs(600),
            backoff_unit: Duration::from_millis(1),
            ..OutboxConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn backoff_curve_is_bounded() {
        let unit = Duration::from_secs(1);
        assert_eq!(drain_backoff(1, unit), Duration::from_secs(1));
        assert_eq!(drain_backoff(2, unit), Duration::from_secs(2));
        assert_eq!(drain_backoff(3, unit), Duration::from_secs(4));
        assert_eq!(drain_backoff(7, unit), Duration::from_secs(60));
        assert_eq!(drain_backoff(60, unit), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dead_letter_outbox(dir.path(), 3);

        for i in 0..5 {
            outbox.enqueue(envelope(&format!("s{i}"))).unwrap();
        }
        // give the spawned immediate drains a moment to fail and settle
        tokio::time::sleep(Duration::from_millis(600)).await;

        let stats = outbox.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.delivered, 0);
        assert_eq!(outbox.queued_source_ids(), vec!["s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn open_circuit_keeps_enqueue_disk_only() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dead_letter_outbox(dir.path(), 100);

        outbox.enqueue(envelope("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(outbox.breaker_state(), BreakerState::Open);

        outbox.enqueue(envelope("second")).unwrap();
        outbox.drain().await; // denied by the breaker, returns immediately

        let stats = outbox.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn restart_replays_pending_envelopes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let outbox = dead_letter_outbox(dir.path(), 100);
            for i in 0..3 {
                outbox.enqueue(envelope(&format!("s{i}"))).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(600)).await;
        }

        let reborn = dead_letter_outbox(dir.path(), 100);
        assert_eq!(reborn.queued_source_ids(), vec!["s0", "s1", "s2"]);

        // log truncated after the successful load
        let len = std::fs::metadata(dir.path().join(file_log::ACTIVE_FILE))
            .unwrap()
            .len();
        assert_eq!(len, 0);
    }
}
