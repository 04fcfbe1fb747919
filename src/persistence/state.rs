//! Turso-backed state store for Ocean.
//!
//! Provides persistent storage for:
//! - Sessions, runs and ticks (the run state machine)
//! - The four scoped-storage tables (global / session / run / tick)
//! - The append-only event log
//!
//! Schema definitions live in [`super::schema`], run-machine primitives in
//! [`super::run_store`], the event log in [`super::events`]. All values are
//! opaque JSON at rest; the store never introspects payload content.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use turso::{Connection, Database};

use super::schema::*;

/// The state store manages all Ocean persistence.
///
/// It holds a reference to the database engine and spawns connections on
/// demand. This allows it to be efficiently Cloned and shared across
/// concurrently advancing instances.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    ///
    /// Creates parent directories and initializes the schema if the
    /// database is new.
    pub async fn open(db_path: &str) -> Result<Self> {
        let path = std::path::Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let db = turso::Builder::new_local(db_path)
            .build()
            .await
            .with_context(|| format!("Failed to open database: {}", db_path))?;

        let store = Self { db: Arc::new(db) };
        store.init_schema().await?;

        Ok(store)
    }

    /// Open an in-memory state store (useful for testing).
    pub async fn open_memory() -> Result<Self> {
        let db = turso::Builder::new_local(":memory:")
            .build()
            .await
            .with_context(|| "Failed to open in-memory database")?;

        let store = Self { db: Arc::new(db) };
        store.init_schema().await?;

        Ok(store)
    }

    /// Spawn a connection with the per-connection pragmas applied.
    ///
    /// Foreign-key enforcement is requested here, but the delete paths in
    /// [`super::run_store`] never rely on it: they walk the cascade in
    /// application code so the semantics hold on engines where the pragma
    /// is a no-op.
    pub(crate) async fn conn(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| anyhow::anyhow!("Failed to connect: {}", e))?;
        conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        conn.execute("PRAGMA busy_timeout = 5000;", ()).await.ok();
        conn.execute("PRAGMA foreign_keys = ON;", ()).await.ok();
        Ok(conn)
    }

    /// Apply the schema. Idempotent; safe to call on every open.
    pub async fn migrate(&self) -> Result<()> {
        self.init_schema().await
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn().await?;

        conn.execute_batch(INIT_SCHEMA)
            .await
            .with_context(|| "Failed to initialize database schema")?;

        conn.execute(
            "INSERT OR REPLACE INTO ocean_schema_info (key, value) VALUES ('version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )
        .await?;

        info!(version = SCHEMA_VERSION, "Ocean schema applied");
        Ok(())
    }

    // ─── Global Storage ──────────────────────────────────────────

    pub async fn global_get(&self, clog_id: &str) -> Result<Option<StorageRow>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT value, updated_ts FROM ocean_storage_global WHERE clog_id = ?1",
                [clog_id],
            )
            .await?;
        first_storage_row(rows).await
    }

    pub async fn global_set(&self, clog_id: &str, value: &Value, now_ms: i64) -> Result<()> {
        let conn = self.conn().await?;
        upsert_global(&conn, clog_id, value, now_ms).await
    }

    pub async fn global_clear(&self, clog_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        clear_global(&conn, clog_id).await
    }

    // ─── Session Storage ─────────────────────────────────────────

    pub async fn session_get(&self, clog_id: &str, session_id: &str) -> Result<Option<StorageRow>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT value, updated_ts FROM ocean_storage_session WHERE clog_id = ?1 AND session_id = ?2",
                turso::params![clog_id, session_id],
            )
            .await?;
        first_storage_row(rows).await
    }

    pub async fn session_set(
        &self,
        clog_id: &str,
        session_id: &str,
        value: &Value,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn().await?;
        upsert_session(&conn, clog_id, session_id, value, now_ms).await
    }

    pub async fn session_clear(&self, clog_id: &str, session_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        clear_session(&conn, clog_id, session_id).await
    }

    // ─── Run Storage ─────────────────────────────────────────────

    pub async fn run_get(&self, clog_id: &str, run_id: &str) -> Result<Option<StorageRow>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT value, updated_ts FROM ocean_storage_run WHERE clog_id = ?1 AND run_id = ?2",
                turso::params![clog_id, run_id],
            )
            .await?;
        first_storage_row(rows).await
    }

    pub async fn run_set(
        &self,
        clog_id: &str,
        run_id: &str,
        value: &Value,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn().await?;
        upsert_run(&conn, clog_id, run_id, value, now_ms).await
    }

    pub async fn run_clear(&self, clog_id: &str, run_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        clear_run(&conn, clog_id, run_id).await
    }

    // ─── Tick Storage ────────────────────────────────────────────

    /// All rows of one tick for one adapter, ordered by `row_id`.
    pub async fn tick_rows_get(
        &self,
        clog_id: &str,
        run_id: &str,
        tick_id: &str,
    ) -> Result<Vec<TickStorageRow>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT row_id, value, updated_ts FROM ocean_storage_tick \
                 WHERE clog_id = ?1 AND run_id = ?2 AND tick_id = ?3 ORDER BY row_id",
                turso::params![clog_id, run_id, tick_id],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(TickStorageRow {
                row_id: row.get::<String>(0)?,
                value: parse_json(&row.get::<String>(1)?)?,
                updated_ts: row.get::<i64>(2)?,
            });
        }
        Ok(out)
    }

    pub async fn tick_row_set(
        &self,
        clog_id: &str,
        run_id: &str,
        tick_id: &str,
        row_id: &str,
        value: &Value,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn().await?;
        upsert_tick_row(&conn, clog_id, run_id, tick_id, row_id, value, now_ms).await
    }

    pub async fn tick_row_del(
        &self,
        clog_id: &str,
        run_id: &str,
        tick_id: &str,
        row_id: &str,
    ) -> Result<()> {
        let conn = self.conn().await?;
        del_tick_row(&conn, clog_id, run_id, tick_id, row_id).await
    }

    // ─── Tick History ────────────────────────────────────────────

    /// Distinct tick ids of `(clog_id, run_id)` ordered by their latest
    /// `updated_ts`, each with all stored rows. Callers filter row ids.
    pub async fn tick_history(
        &self,
        clog_id: &str,
        run_id: &str,
        limit_ticks: Option<u32>,
        descending: bool,
    ) -> Result<Vec<TickHistoryEntry>> {
        let conn = self.conn().await?;
        let order = if descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT tick_id, MAX(updated_ts) AS latest FROM ocean_storage_tick \
             WHERE clog_id = ?1 AND run_id = ?2 GROUP BY tick_id \
             ORDER BY latest {order}, tick_id {order} LIMIT ?3"
        );
        let limit = limit_ticks.map(|n| n as i64).unwrap_or(-1);
        let mut rows = conn
            .query(&sql, turso::params![clog_id, run_id, limit])
            .await?;

        let mut ticks = Vec::new();
        while let Some(row) = rows.next().await? {
            ticks.push((row.get::<String>(0)?, row.get::<i64>(1)?));
        }

        let mut out = Vec::with_capacity(ticks.len());
        for (tick_id, updated_ts) in ticks {
            let rows = self.tick_rows_get(clog_id, run_id, &tick_id).await?;
            out.push(TickHistoryEntry {
                tick_id,
                updated_ts,
                rows,
            });
        }
        Ok(out)
    }
}

/// One tick of stored history for an `(adapter, run)` pair.
#[derive(Debug, Clone)]
pub struct TickHistoryEntry {
    pub tick_id: String,
    pub updated_ts: i64,
    pub rows: Vec<TickStorageRow>,
}

// ─── Connection-level helpers ────────────────────────────────────
//
// `write_scoped` applies a whole op batch on one connection inside one
// transaction, so the mutating statements live here as free functions
// over a borrowed connection; the store methods above wrap them for
// direct use.

pub(crate) fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| "Failed to parse stored JSON value")
}

pub(crate) fn render_json(value: &Value) -> Result<String> {
    serde_json::to_string(value).with_context(|| "Failed to serialize JSON value")
}

async fn first_storage_row(mut rows: turso::Rows) -> Result<Option<StorageRow>> {
    if let Some(row) = rows.next().await? {
        Ok(Some(StorageRow {
            value: parse_json(&row.get::<String>(0)?)?,
            updated_ts: row.get::<i64>(1)?,
        }))
    } else {
        Ok(None)
    }
}

pub(crate) async fn upsert_global(
    conn: &Connection,
    clog_id: &str,
    value: &Value,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ocean_storage_global (clog_id, value, updated_ts) VALUES (?1, ?2, ?3)",
        turso::params![clog_id, render_json(value)?, now_ms],
    )
    .await
    .with_context(|| format!("Failed to upsert global storage for clog: {}", clog_id))?;
    Ok(())
}

pub(crate) async fn clear_global(conn: &Connection, clog_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM ocean_storage_global WHERE clog_id = ?1",
        [clog_id],
    )
    .await?;
    Ok(())
}

pub(crate) async fn upsert_session(
    conn: &Connection,
    clog_id: &str,
    session_id: &str,
    value: &Value,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ocean_storage_session (clog_id, session_id, value, updated_ts) \
         VALUES (?1, ?2, ?3, ?4)",
        turso::params![clog_id, session_id, render_json(value)?, now_ms],
    )
    .await
    .with_context(|| format!("Failed to upsert session storage for session: {}", session_id))?;
    Ok(())
}

pub(crate) async fn clear_session(
    conn: &Connection,
    clog_id: &str,
    session_id: &str,
) -> Result<()> {
    conn.execute(
        "DELETE FROM ocean_storage_session WHERE clog_id = ?1 AND session_id = ?2",
        turso::params![clog_id, session_id],
    )
    .await?;
    Ok(())
}

pub(crate) async fn upsert_run(
    conn: &Connection,
    clog_id: &str,
    run_id: &str,
    value: &Value,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ocean_storage_run (clog_id, run_id, value, updated_ts) \
         VALUES (?1, ?2, ?3, ?4)",
        turso::params![clog_id, run_id, render_json(value)?, now_ms],
    )
    .await
    .with_context(|| format!("Failed to upsert run storage for run: {}", run_id))?;
    Ok(())
}

pub(crate) async fn clear_run(conn: &Connection, clog_id: &str, run_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM ocean_storage_run WHERE clog_id = ?1 AND run_id = ?2",
        turso::params![clog_id, run_id],
    )
    .await?;
    Ok(())
}

pub(crate) async fn upsert_tick_row(
    conn: &Connection,
    clog_id: &str,
    run_id: &str,
    tick_id: &str,
    row_id: &str,
    value: &Value,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ocean_storage_tick (clog_id, run_id, tick_id, row_id, value, updated_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        turso::params![clog_id, run_id, tick_id, row_id, render_json(value)?, now_ms],
    )
    .await
    .with_context(|| format!("Failed to upsert tick storage row: {}", row_id))?;
    Ok(())
}

pub(crate) async fn del_tick_row(
    conn: &Connection,
    clog_id: &str,
    run_id: &str,
    tick_id: &str,
    row_id: &str,
) -> Result<()> {
    conn.execute(
        "DELETE FROM ocean_storage_tick \
         WHERE clog_id = ?1 AND run_id = ?2 AND tick_id = ?3 AND row_id = ?4",
        turso::params![clog_id, run_id, tick_id, row_id],
    )
    .await?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────
