//! Append-only event log with scope-filtered replay.
//!
//! Events stand outside the cascade topology: deleting a session or run
//! leaves its audit trail behind, pruned only by the TTL sweep. The
//! database-maintained `seq` is the per-scope total order and the read
//! cursor.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::new_id;
use super::schema::EventRecord;
use super::state::{parse_json, render_json, StateStore};

/// The scope discriminator stored on every event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventScopeKind {
    Global,
    Session,
    Run,
    Tick,
}

impl EventScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventScopeKind::Global => "global",
            EventScopeKind::Session => "session",
            EventScopeKind::Run => "run",
            EventScopeKind::Tick => "tick",
        }
    }
}

/// Read-side scope selector.
///
/// `Global` matches only rows with `scope_kind = 'global'`; `Session` and
/// `Run` filter by id column, so run- and tick-scoped events surface
/// under the session that contains them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Global,
    Session(String),
    Run(String),
}

impl StateStore {
    /// Append one event. The scope id columns are the caller's tick
    /// context projected by `kind` (session ⊂ run ⊂ tick).
    pub async fn append_event(
        &self,
        kind: EventScopeKind,
        session_id: Option<&str>,
        run_id: Option<&str>,
        tick_id: Option<&str>,
        event_type: &str,
        payload: &Value,
        now_ms: i64,
    ) -> Result<EventRecord> {
        let id = new_id("evt");
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO events (id, ts, scope_kind, session_id, run_id, tick_id, type, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            turso::params![
                id.as_str(),
                now_ms,
                kind.as_str(),
                session_id,
                run_id,
                tick_id,
                event_type,
                render_json(payload)?,
            ],
        )
        .await
        .with_context(|| format!("Failed to append event of type: {}", event_type))?;

        // The unique id recovers the autoincremented cursor position.
        let mut rows = conn
            .query("SELECT seq FROM events WHERE id = ?1", [id.as_str()])
            .await?;
        let seq = rows
            .next()
            .await?
            .map(|row| row.get::<i64>(0))
            .transpose()?
            .context("Inserted event row not found")?;

        Ok(EventRecord {
            seq,
            id,
            ts: now_ms,
            scope_kind: kind.as_str().to_string(),
            session_id: session_id.map(str::to_string),
            run_id: run_id.map(str::to_string),
            tick_id: tick_id.map(str::to_string),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        })
    }

    /// Events with `seq > after_seq` in the given scope, ascending,
    /// capped at `limit`. The cursor for the next call is the last
    /// returned `seq`.
    pub async fn read_events_by_scope(
        &self,
        filter: &EventFilter,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<EventRecord>> {
        const COLUMNS: &str = "seq, id, ts, scope_kind, session_id, run_id, tick_id, type, payload";
        let conn = self.conn().await?;
        let mut rows = match filter {
            EventFilter::Global => {
                conn.query(
                    &format!(
                        "SELECT {COLUMNS} FROM events \
                         WHERE scope_kind = 'global' AND seq > ?1 ORDER BY seq ASC LIMIT ?2"
                    ),
                    turso::params![after_seq, limit as i64],
                )
                .await?
            }
            EventFilter::Session(session_id) => {
                conn.query(
                    &format!(
                        "SELECT {COLUMNS} FROM events \
                         WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
                    ),
                    turso::params![session_id.as_str(), after_seq, limit as i64],
                )
                .await?
            }
            EventFilter::Run(run_id) => {
                conn.query(
                    &format!(
                        "SELECT {COLUMNS} FROM events \
                         WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
                    ),
                    turso::params![run_id.as_str(), after_seq, limit as i64],
                )
                .await?
            }
        };

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(EventRecord {
                seq: row.get::<i64>(0)?,
                id: row.get::<String>(1)?,
                ts: row.get::<i64>(2)?,
                scope_kind: row.get::<String>(3)?,
                session_id: row.get::<Option<String>>(4)?,
                run_id: row.get::<Option<String>>(5)?,
                tick_id: row.get::<Option<String>>(6)?,
                event_type: row.get::<String>(7)?,
                payload: parse_json(&row.get::<String>(8)?)?,
            });
        }
        Ok(out)
    }

    /// Delete events older than `ttl_ms`. Returns the number pruned.
    pub async fn gc_events_by_ttl(&self, ttl_ms: i64, now_ms: i64) -> Result<u64> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM events WHERE ts < ?1",
                [now_ms - ttl_ms],
            )
            .await
            .with_context(|| "Failed to sweep expired events")?;
        Ok(deleted)
    }
}

// ─── Tests ───────────────────────────────────────────────────────
