//! Ticket reconciliation substore.
//!
//! Small key-value table written by the consumer after execution; read by
//! operators and the producer for reconciliation. Holds its own connection to
//! the shared database file so its writes never contend with the order queue.

use crate::models::TicketMapping;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ticket_map (
    source_ticket TEXT PRIMARY KEY,
    slave_ticket TEXT NOT NULL,
    symbol TEXT NOT NULL,
    size TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

pub struct TicketMapStore {
    conn: Arc<Mutex<Connection>>,
}

impl TicketMapStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open ticket map at {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialise ticket map schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert on `source_ticket`, last writer wins.
    pub fn put_mapping(
        &self,
        source_ticket: &str,
        slave_ticket: &str,
        symbol: &str,
        size: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO ticket_map (source_ticket, slave_ticket, symbol, size, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(source_ticket) DO UPDATE SET \
                slave_ticket = excluded.slave_ticket, \
                symbol = excluded.symbol, \
                size = excluded.size, \
                created_at = excluded.created_at",
        )?
        .execute(params![
            source_ticket,
            slave_ticket,
            symbol,
            size,
            Utc::now().timestamp(),
        ])?;
        Ok(())
    }

    pub fn get_mapping(&self, source_ticket: &str) -> Result<Option<TicketMapping>> {
        let conn = self.conn.lock();
        let mapping = conn
            .prepare_cached(
                "SELECT source_ticket, slave_ticket, symbol, size, created_at \
                 FROM ticket_map WHERE source_ticket = ?1",
            )?
            .query_row([source_ticket], |row| {
                Ok(TicketMapping {
                    source_ticket: row.get(0)?,
                    slave_ticket: row.get(1)?,
                    symbol: row.get(2)?,
                    size: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .optional()?;
        Ok(mapping)
    }
}
