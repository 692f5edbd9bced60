//! Durable order queue storage engine.
//!
//! Serialised-writer design: one SQLite connection behind a mutex, WAL mode
//! for concurrent reads, prepared statement caching, and a transaction around
//! the select-then-update claim path. Every operation leaves either the full
//! effect or none of it visible.

use crate::models::{
    timestamp_cutoff, Config, EventType, NewOrderEvent, OrderPayload, OrderState, StoredOrder,
};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

/// Hard ceiling on a single claim batch, regardless of the requested count.
pub const CLAIM_CEILING: usize = 100;

/// Window used by the recent-event counter in [`OrderStore::list_stats`].
const RECENT_WINDOW: Duration = Duration::from_secs(300);

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    claim_owner TEXT,
    claimed_at INTEGER,
    processed_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_dedup
    ON orders(source_id, event_type);

CREATE INDEX IF NOT EXISTS idx_orders_state
    ON orders(state);

CREATE INDEX IF NOT EXISTS idx_orders_claimable
    ON orders(timestamp ASC) WHERE state = 'pending';

CREATE INDEX IF NOT EXISTS idx_orders_retry
    ON orders(next_retry_at) WHERE state = 'pending';

CREATE INDEX IF NOT EXISTS idx_orders_done_age
    ON orders(processed_at) WHERE state = 'done';
"#;

const SELECT_COLS: &str = "id, source_id, event_type, timestamp, payload_json, created_at, \
     state, claim_owner, claimed_at, processed_at, retry_count, next_retry_at, last_retry_at";

/// Result of an ingest call. `duplicate` means the dedup key matched an
/// existing row and `id` is the original id.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub id: String,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Transitioned,
    AlreadyDone,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled,
    AlreadyDone,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReapOutcome {
    /// Stale claims returned to pending with a backoff.
    pub reclaimed: usize,
    /// Stale claims released at the retry bound; now fallow.
    pub newly_fallow: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    /// Pending rows at the retry bound, excluded from claiming.
    pub fallow: u64,
    /// Pending rows whose next_retry_at lies in the future.
    pub retrying: u64,
    /// Rows whose producer timestamp falls in the last five minutes.
    pub recent_count: u64,
}

/// Exponential backoff for the n-th retry attempt, capped at `max`.
pub fn retry_backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let secs = initial.as_secs().saturating_mul(1u64 << shift);
    Duration::from_secs(secs.min(max.as_secs()))
}

pub struct OrderStore {
    conn: Arc<Mutex<Connection>>,
    max_retries: u32,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
}

impl OrderStore {
    pub fn new(db_path: &str, config: &Config) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // serialisation is our mutex

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialise order schema")?;

        // last_retry_at arrived after the first deployed schema; additive,
        // idempotent migration keeps old databases loadable.
        ensure_column(&conn, "orders", "last_retry_at", "INTEGER")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, existing_orders = count, "order store initialised");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_retries: config.max_retries,
            initial_retry_delay: config.initial_retry_delay,
            max_retry_delay: config.max_retry_delay,
        })
    }

    /// Idempotent insert keyed on `(source_id, event_type)`.
    ///
    /// A dedup hit returns the original id unchanged and touches nothing else.
    pub fn ingest(&self, event: &NewOrderEvent) -> Result<IngestOutcome> {
        let conn = self.conn.lock();

        let existing: Option<String> = conn
            .prepare_cached("SELECT id FROM orders WHERE source_id = ?1 AND event_type = ?2")?
            .query_row(
                params![event.source_id, event.event_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            crate::metrics::duplicate_order();
            return Ok(IngestOutcome {
                id,
                duplicate: true,
            });
        }

        let id = Uuid::new_v4().to_string();
        let payload_json =
            serde_json::to_string(&event.payload).context("failed to serialise payload")?;
        let now = Utc::now().timestamp();

        conn.prepare_cached(
            "INSERT INTO orders \
             (id, source_id, event_type, timestamp, payload_json, created_at, state, retry_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0)",
        )?
        .execute(params![
            id,
            event.source_id,
            event.event_type.as_str(),
            event.timestamp,
            payload_json,
            now,
        ])
        .context("failed to persist order")?;

        Ok(IngestOutcome {
            id,
            duplicate: false,
        })
    }

    /// Atomic batch claim: up to `max_count` due pending events, FIFO by
    /// producer timestamp, transitioned to claimed under one transaction.
    ///
    /// Events at the retry bound (fallow) are never returned.
    pub fn claim(&self, max_count: usize, consumer_id: &str) -> Result<Vec<StoredOrder>> {
        let max_count = max_count.min(CLAIM_CEILING);
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut batch: Vec<StoredOrder> = Vec::new();
        {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {SELECT_COLS} FROM orders \
                 WHERE state = 'pending' \
                   AND (next_retry_at IS NULL OR next_retry_at <= ?1) \
                   AND retry_count < ?2 \
                 ORDER BY timestamp ASC, created_at ASC, id ASC \
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![now, self.max_retries, max_count as i64],
                row_to_order,
            )?;
            for row in rows {
                batch.push(row?);
            }
        }

        {
            let mut update = tx.prepare_cached(
                "UPDATE orders SET state = 'claimed', claim_owner = ?1, claimed_at = ?2 \
                 WHERE id = ?3 AND state = 'pending'",
            )?;
            for order in &batch {
                let changed = update.execute(params![consumer_id, now, order.id])?;
                if changed != 1 {
                    anyhow::bail!("order {} changed state during claim", order.id);
                }
            }
        }

        tx.commit().context("failed to commit claim batch")?;

        for order in &mut batch {
            order.state = OrderState::Claimed;
            order.claim_owner = Some(consumer_id.to_string());
            order.claimed_at = Some(now);
        }
        Ok(batch)
    }

    /// Transition to done. Durable before this returns; idempotent.
    pub fn mark_done(&self, id: &str) -> Result<AckOutcome> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();

        let changed = conn
            .prepare_cached(
                "UPDATE orders SET state = 'done', processed_at = ?1, \
                 claim_owner = NULL, next_retry_at = NULL \
                 WHERE id = ?2 AND state != 'done'",
            )?
            .execute(params![now, id])?;

        if changed > 0 {
            let created_at: i64 = conn
                .prepare_cached("SELECT created_at FROM orders WHERE id = ?1")?
                .query_row([id], |row| row.get(0))?;
            crate::metrics::order_processed();
            crate::metrics::processing_duration((now - created_at).max(0) as f64);
            return Ok(AckOutcome::Transitioned);
        }

        if self.exists_locked(&conn, id)? {
            Ok(AckOutcome::AlreadyDone)
        } else {
            Ok(AckOutcome::NotFound)
        }
    }

    /// Return a claimed or pending event to the queue after `delay`,
    /// incrementing its retry count.
    pub fn schedule_retry(&self, id: &str, delay: Duration) -> Result<RetryOutcome> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();
        let next_retry_at = now + delay.as_secs() as i64;

        let changed = conn
            .prepare_cached(
                "UPDATE orders SET state = 'pending', next_retry_at = ?1, \
                 retry_count = retry_count + 1, last_retry_at = ?2, claim_owner = NULL \
                 WHERE id = ?3 AND state != 'done'",
            )?
            .execute(params![next_retry_at, now, id])?;

        if changed > 0 {
            let retry_count: u32 = conn
                .prepare_cached("SELECT retry_count FROM orders WHERE id = ?1")?
                .query_row([id], |row| row.get(0))?;
            if retry_count == self.max_retries {
                crate::metrics::orders_failed(1);
            }
            return Ok(RetryOutcome::Rescheduled);
        }

        if self.exists_locked(&conn, id)? {
            Ok(RetryOutcome::AlreadyDone)
        } else {
            Ok(RetryOutcome::NotFound)
        }
    }

    /// Release leases older than `lease_duration`.
    ///
    /// Events under the retry bound go back to pending with an exponential
    /// backoff; events at the bound have their claim cleared and stay pending
    /// in the fallow sub-state, excluded from future claims.
    pub fn reap_stale(&self, lease_duration: Duration, max_retries: u32) -> Result<ReapOutcome> {
        let now = Utc::now().timestamp();
        let cutoff = now - lease_duration.as_secs() as i64;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = ReapOutcome::default();

        let stale: Vec<(String, u32)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, retry_count FROM orders \
                 WHERE state = 'claimed' AND claimed_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (id, retry_count) in stale {
            if retry_count < max_retries {
                let attempt = retry_count + 1;
                let delay =
                    retry_backoff(self.initial_retry_delay, self.max_retry_delay, attempt);
                tx.prepare_cached(
                    "UPDATE orders SET state = 'pending', retry_count = ?1, \
                     next_retry_at = ?2, last_retry_at = ?3, claim_owner = NULL \
                     WHERE id = ?4 AND state = 'claimed'",
                )?
                .execute(params![
                    attempt,
                    now + delay.as_secs() as i64,
                    now,
                    id
                ])?;
                outcome.reclaimed += 1;
            } else {
                tx.prepare_cached(
                    "UPDATE orders SET state = 'pending', claim_owner = NULL, \
                     next_retry_at = NULL WHERE id = ?1 AND state = 'claimed'",
                )?
                .execute(params![id])?;
                outcome.newly_fallow += 1;
            }
        }

        tx.commit().context("failed to commit reap batch")?;
        crate::metrics::orders_failed(outcome.newly_fallow as u64);
        Ok(outcome)
    }

    /// Delete done rows older than the retention window.
    pub fn cleanup(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - retention.as_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn
            .prepare_cached("DELETE FROM orders WHERE state = 'done' AND processed_at < ?1")?
            .execute(params![cutoff])?;
        Ok(deleted)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredOrder>> {
        let conn = self.conn.lock();
        let order = conn
            .prepare_cached(&format!("SELECT {SELECT_COLS} FROM orders WHERE id = ?1"))?
            .query_row([id], row_to_order)
            .optional()?;
        Ok(order)
    }

    /// Page of pending events, oldest first, for operator inspection.
    pub fn list_pending(&self, limit: usize, offset: usize) -> Result<Vec<StoredOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM orders WHERE state = 'pending' \
             ORDER BY timestamp ASC, created_at ASC, id ASC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_order)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp();
        let recent_cutoff = timestamp_cutoff(RECENT_WINDOW);

        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<u64> {
            let n: i64 = conn.prepare_cached(sql)?.query_row(p, |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(QueueStats {
            total: count("SELECT COUNT(*) FROM orders", &[])?,
            pending: count(
                "SELECT COUNT(*) FROM orders WHERE state = 'pending' AND retry_count < ?1",
                &[&self.max_retries],
            )?,
            claimed: count("SELECT COUNT(*) FROM orders WHERE state = 'claimed'", &[])?,
            done: count("SELECT COUNT(*) FROM orders WHERE state = 'done'", &[])?,
            fallow: count(
                "SELECT COUNT(*) FROM orders WHERE state = 'pending' AND retry_count >= ?1",
                &[&self.max_retries],
            )?,
            retrying: count(
                "SELECT COUNT(*) FROM orders WHERE state = 'pending' \
                 AND retry_count < ?1 AND next_retry_at > ?2",
                &[&self.max_retries, &now],
            )?,
            recent_count: count(
                "SELECT COUNT(*) FROM orders WHERE timestamp >= ?1",
                &[&recent_cutoff],
            )?,
        })
    }

    /// Storage liveness probe for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("storage ping failed")?;
        Ok(())
    }

    /// Let SQLite re-evaluate its query plans after bulk deletes.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    }

    fn exists_locked(&self, conn: &Connection, id: &str) -> Result<bool> {
        let found: Option<i64> = conn
            .prepare_cached("SELECT 1 FROM orders WHERE id = ?1")?
            .query_row([id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    #[cfg(test)]
    fn force_claimed_at(&self, id: &str, claimed_at: i64) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET claimed_at = ?1 WHERE id = ?2",
            params![claimed_at, id],
        )
        .unwrap();
    }

    #[cfg(test)]
    fn force_next_retry_at(&self, id: &str, next_retry_at: Option<i64>) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET next_retry_at = ?1 WHERE id = ?2",
            params![next_retry_at, id],
        )
        .unwrap();
    }

    #[cfg(test)]
    fn force_processed_at(&self, id: &str, processed_at: i64) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET processed_at = ?1 WHERE id = ?2",
            params![processed_at, id],
        )
        .unwrap();
    }
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
        info!(table, column, "applied additive schema migration");
    }
    Ok(())
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredOrder> {
    let event_type_raw: String = row.get(2)?;
    let payload_json: String = row.get(4)?;
    let state_raw: String = row.get(6)?;

    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| invalid_column(2, "unrecognised event_type in storage".into()))?;
    let payload: OrderPayload = serde_json::from_str(&payload_json)
        .map_err(|e| invalid_column(4, format!("corrupt payload_json: {e}")))?;
    let state = OrderState::parse(&state_raw)
        .ok_or_else(|| invalid_column(6, "unrecognised state in storage".into()))?;

    Ok(StoredOrder {
        id: row.get(0)?,
        source_id: row.get(1)?,
        event_type,
        timestamp: row.get(3)?,
        payload,
        created_at: row.get(5)?,
        state,
        claim_owner: row.get(7)?,
        claimed_at: row.get(8)?,
        processed_at: row.get(9)?,
        retry_count: row.get(10)?,
        next_retry_at: row.get(11)?,
        last_retry_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format_timestamp;
    use tempfile::TempDir;

    fn test_store() -> (OrderStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");
        let store = OrderStore::new(path.to_str().unwrap(), &Config::default()).unwrap();
        (store, dir)
    }

    fn event(source_id: &str, event_type: EventType, timestamp: &str) -> NewOrderEvent {
        NewOrderEvent {
            source_id: source_id.to_string(),
            event_type,
            timestamp: timestamp.to_string(),
            payload: OrderPayload {
                symbol: "EURUSD".to_string(),
                volume: Some("0.10".to_string()),
                ..Default::default()
            },
        }
    }

    fn opened(source_id: &str, timestamp: &str) -> NewOrderEvent {
        event(source_id, EventType::PositionOpened, timestamp)
    }

    #[test]
    fn ingest_assigns_id_and_dedups() {
        let (store, _dir) = test_store();
        let e = opened("A", "2025-01-01T00:00:00.000Z");

        let first = store.ingest(&e).unwrap();
        assert!(!first.duplicate);

        let second = store.ingest(&e).unwrap();
        assert!(second.duplicate);
        assert_eq!(first.id, second.id);

        let stats = store.list_stats().unwrap();
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn dedup_key_includes_event_type() {
        let (store, _dir) = test_store();
        let a = store
            .ingest(&event("A", EventType::PositionOpened, "2025-01-01T00:00:00.000Z"))
            .unwrap();
        let b = store
            .ingest(&event("A", EventType::PositionClosed, "2025-01-01T00:00:01.000Z"))
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.list_stats().unwrap().total, 2);
    }

    #[test]
    fn dedup_leaves_original_row_untouched() {
        let (store, _dir) = test_store();
        let first = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();

        let mut altered = opened("A", "2025-06-30T09:00:00.000Z");
        altered.payload.volume = Some("9.99".to_string());
        store.ingest(&altered).unwrap();

        let stored = store.get(&first.id).unwrap().unwrap();
        assert_eq!(stored.timestamp, "2025-01-01T00:00:00.000Z");
        assert_eq!(stored.payload.volume.as_deref(), Some("0.10"));
    }

    #[test]
    fn claim_is_fifo_by_timestamp_without_overlap() {
        let (store, _dir) = test_store();
        // inserted out of timestamp order on purpose
        store.ingest(&opened("B", "2025-01-01T01:00:01.000Z")).unwrap();
        store.ingest(&opened("A", "2025-01-01T01:00:00.000Z")).unwrap();
        store.ingest(&opened("C", "2025-01-01T01:00:02.000Z")).unwrap();

        let first = store.claim(2, "c1").unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].source_id, "A");
        assert_eq!(first[1].source_id, "B");
        assert!(first.iter().all(|o| o.claim_owner.as_deref() == Some("c1")));

        let second = store.claim(10, "c2").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_id, "C");

        let first_ids: Vec<_> = first.iter().map(|o| &o.id).collect();
        assert!(!first_ids.contains(&&second[0].id));
    }

    #[test]
    fn claim_zero_returns_empty() {
        let (store, _dir) = test_store();
        store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        assert!(store.claim(0, "c1").unwrap().is_empty());
    }

    #[test]
    fn claim_clamps_to_hard_ceiling() {
        let (store, _dir) = test_store();
        for i in 0..(CLAIM_CEILING + 5) {
            store
                .ingest(&opened(
                    &format!("src-{i:03}"),
                    &format!("2025-01-01T00:00:{:02}.{:03}Z", i / 1000, i % 1000),
                ))
                .unwrap();
        }
        let batch = store.claim(10_000, "c1").unwrap();
        assert_eq!(batch.len(), CLAIM_CEILING);
    }

    #[test]
    fn claimed_events_are_not_reclaimable() {
        let (store, _dir) = test_store();
        store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        assert_eq!(store.claim(10, "c1").unwrap().len(), 1);
        assert!(store.claim(10, "c2").unwrap().is_empty());
    }

    #[test]
    fn mark_done_is_idempotent() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.claim(1, "c1").unwrap();

        assert_eq!(store.mark_done(&ingested.id).unwrap(), AckOutcome::Transitioned);
        assert_eq!(store.mark_done(&ingested.id).unwrap(), AckOutcome::AlreadyDone);
        assert_eq!(store.mark_done(&ingested.id).unwrap(), AckOutcome::AlreadyDone);

        let stored = store.get(&ingested.id).unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Done);
        assert!(stored.processed_at.is_some());
        assert!(stored.claim_owner.is_none());
    }

    #[test]
    fn mark_done_unknown_id() {
        let (store, _dir) = test_store();
        assert_eq!(store.mark_done("nope").unwrap(), AckOutcome::NotFound);
    }

    #[test]
    fn ingest_claim_ack_cycle_states() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        assert_eq!(
            store.get(&ingested.id).unwrap().unwrap().state,
            OrderState::Pending
        );

        store.claim(1, "c1").unwrap();
        assert_eq!(
            store.get(&ingested.id).unwrap().unwrap().state,
            OrderState::Claimed
        );

        store.mark_done(&ingested.id).unwrap();
        assert_eq!(
            store.get(&ingested.id).unwrap().unwrap().state,
            OrderState::Done
        );
    }

    #[test]
    fn schedule_retry_defers_and_counts() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.claim(1, "c1").unwrap();

        assert_eq!(
            store
                .schedule_retry(&ingested.id, Duration::from_secs(60))
                .unwrap(),
            RetryOutcome::Rescheduled
        );

        let stored = store.get(&ingested.id).unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.claim_owner.is_none());
        assert!(stored.last_retry_at.is_some());

        // not due yet
        assert!(store.claim(10, "c1").unwrap().is_empty());

        store.force_next_retry_at(&ingested.id, Some(Utc::now().timestamp() - 1));
        assert_eq!(store.claim(10, "c1").unwrap().len(), 1);
    }

    #[test]
    fn schedule_retry_zero_delay_is_immediately_claimable() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.claim(1, "c1").unwrap();
        store.schedule_retry(&ingested.id, Duration::ZERO).unwrap();
        assert_eq!(store.claim(10, "c2").unwrap().len(), 1);
    }

    #[test]
    fn schedule_retry_refuses_done_and_unknown() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.mark_done(&ingested.id).unwrap();
        assert_eq!(
            store.schedule_retry(&ingested.id, Duration::ZERO).unwrap(),
            RetryOutcome::AlreadyDone
        );
        assert_eq!(
            store.schedule_retry("nope", Duration::ZERO).unwrap(),
            RetryOutcome::NotFound
        );
    }

    #[test]
    fn retries_past_bound_go_fallow_and_are_excluded() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();

        // max_retries = 3 in the default config
        for _ in 0..4 {
            store.schedule_retry(&ingested.id, Duration::ZERO).unwrap();
        }

        let stored = store.get(&ingested.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 4);
        assert_eq!(stored.state, OrderState::Pending);

        assert!(store.claim(10, "c1").unwrap().is_empty());

        let stats = store.list_stats().unwrap();
        assert_eq!(stats.fallow, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn reap_returns_expired_leases_with_backoff() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.claim(1, "c1").unwrap();
        store.force_claimed_at(&ingested.id, Utc::now().timestamp() - 400);

        let outcome = store.reap_stale(Duration::from_secs(300), 3).unwrap();
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(outcome.newly_fallow, 0);

        let stored = store.get(&ingested.id).unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.claim_owner.is_none());
        assert!(stored.next_retry_at.unwrap() > Utc::now().timestamp());

        // once the backoff elapses the event is claimable again
        store.force_next_retry_at(&ingested.id, Some(Utc::now().timestamp() - 1));
        let reclaimed = store.claim(10, "c2").unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, ingested.id);
    }

    #[test]
    fn reap_leaves_fresh_leases_alone() {
        let (store, _dir) = test_store();
        store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.claim(1, "c1").unwrap();

        let outcome = store.reap_stale(Duration::from_secs(300), 3).unwrap();
        assert_eq!(outcome.reclaimed, 0);
        assert_eq!(store.list_stats().unwrap().claimed, 1);
    }

    #[test]
    fn reap_fallows_exhausted_events() {
        let (store, _dir) = test_store();
        let ingested = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        store.schedule_retry(&ingested.id, Duration::ZERO).unwrap();
        assert_eq!(store.claim(1, "c1").unwrap().len(), 1);
        store.force_claimed_at(&ingested.id, Utc::now().timestamp() - 400);

        // reap with a bound of 1: the event (retry_count = 1) is exhausted
        let outcome = store.reap_stale(Duration::from_secs(300), 1).unwrap();
        assert_eq!(outcome.newly_fallow, 1);
        assert_eq!(outcome.reclaimed, 0);

        let stored = store.get(&ingested.id).unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.claim_owner.is_none());
        assert!(stored.next_retry_at.is_none());
    }

    #[test]
    fn cleanup_deletes_only_old_done_rows() {
        let (store, _dir) = test_store();
        let old = store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap();
        let fresh = store.ingest(&opened("B", "2025-01-01T00:00:01.000Z")).unwrap();
        let pending = store.ingest(&opened("C", "2025-01-01T00:00:02.000Z")).unwrap();

        store.mark_done(&old.id).unwrap();
        store.mark_done(&fresh.id).unwrap();
        store.force_processed_at(&old.id, Utc::now().timestamp() - 7200);

        let deleted = store.cleanup(Duration::from_secs(3600)).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.get(&fresh.id).unwrap().is_some());
        assert!(store.get(&pending.id).unwrap().is_some());
    }

    #[test]
    fn stats_recent_count_uses_producer_timestamp() {
        let (store, _dir) = test_store();
        store.ingest(&opened("OLD", "2020-01-01T00:00:00.000Z")).unwrap();
        store
            .ingest(&opened("NEW", &format_timestamp(Utc::now())))
            .unwrap();

        let stats = store.list_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.recent_count, 1);
    }

    #[test]
    fn list_pending_pages_in_fifo_order() {
        let (store, _dir) = test_store();
        for i in 0..5 {
            store
                .ingest(&opened(
                    &format!("src-{i}"),
                    &format!("2025-01-01T00:00:0{i}.000Z"),
                ))
                .unwrap();
        }
        let page = store.list_pending(2, 1).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].source_id, "src-1");
        assert_eq!(page[1].source_id, "src-2");
    }

    #[test]
    fn reopen_is_idempotent_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");
        let cfg = Config::default();

        let id = {
            let store = OrderStore::new(path.to_str().unwrap(), &cfg).unwrap();
            store.ingest(&opened("A", "2025-01-01T00:00:00.000Z")).unwrap().id
        };

        let store = OrderStore::new(path.to_str().unwrap(), &cfg).unwrap();
        let stored = store.get(&id).unwrap().unwrap();
        assert_eq!(stored.source_id, "A");
        assert!(stored.last_retry_at.is_none());
    }

    #[test]
    fn backoff_curve_is_capped() {
        let initial = Duration::from_secs(10);
        let max = Duration::from_secs(300);
        assert_eq!(retry_backoff(initial, max, 1), Duration::from_secs(10));
        assert_eq!(retry_backoff(initial, max, 2), Duration::from_secs(20));
        assert_eq!(retry_backoff(initial, max, 3), Duration::from_secs(40));
        assert_eq!(retry_backoff(initial, max, 6), Duration::from_secs(300));
        assert_eq!(retry_backoff(initial, max, 60), Duration::from_secs(300));
    }

    #[test]
    fn ping_succeeds_on_open_store() {
        let (store, _dir) = test_store();
        store.ping().unwrap();
        store.optimize().unwrap();
    }
}
