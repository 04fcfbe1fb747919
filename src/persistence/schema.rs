//! Database schema definitions and row types for the Ocean state store.
//!
//! Column names are part of the public contract: adapters and external
//! tooling may query these tables directly.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Schema Constants ───────────────────────────────────────────

/// Schema version — bump when changing table structure.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// SQL statements to initialize the full schema.
///
/// The `ON DELETE CASCADE` clauses declare the cascade topology
/// (Session → Runs → Ticks → TickStorage; Session → SessionStorage;
/// Run → RunStorage). Foreign-key enforcement is per-connection in the
/// SQLite family, so every delete path also walks the cascade in
/// application code; the clauses remain the documented contract.
pub(crate) const INIT_SCHEMA: &str = r#"
-- Root container grouping runs for one logical user/context
CREATE TABLE IF NOT EXISTS ocean_sessions (
    session_id  TEXT PRIMARY KEY,
    created_ts  INTEGER NOT NULL
);

-- Durable run state machines, one owner adapter each
CREATE TABLE IF NOT EXISTS runs (
    run_id          TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL REFERENCES ocean_sessions(session_id) ON DELETE CASCADE,
    clog_id         TEXT NOT NULL,
    status          TEXT NOT NULL,
    state           TEXT NOT NULL,
    locked_by       TEXT,
    lock_expires_at INTEGER,
    attempt         INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 3,
    wake_at         INTEGER,
    pending_input   TEXT,
    last_error      TEXT,
    created_ts      INTEGER NOT NULL,
    updated_ts      INTEGER NOT NULL
);

-- Discrete units of work within a run; FK target for tick storage
CREATE TABLE IF NOT EXISTS ocean_ticks (
    run_id      TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    tick_id     TEXT NOT NULL,
    created_ts  INTEGER NOT NULL,
    PRIMARY KEY (run_id, tick_id)
);

-- Per-adapter singleton JSON row
CREATE TABLE IF NOT EXISTS ocean_storage_global (
    clog_id     TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_ts  INTEGER NOT NULL
);

-- Per-adapter per-session singleton
CREATE TABLE IF NOT EXISTS ocean_storage_session (
    clog_id     TEXT NOT NULL,
    session_id  TEXT NOT NULL REFERENCES ocean_sessions(session_id) ON DELETE CASCADE,
    value       TEXT NOT NULL,
    updated_ts  INTEGER NOT NULL,
    PRIMARY KEY (clog_id, session_id)
);

-- Per-adapter per-run singleton
CREATE TABLE IF NOT EXISTS ocean_storage_run (
    clog_id     TEXT NOT NULL,
    run_id      TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    value       TEXT NOT NULL,
    updated_ts  INTEGER NOT NULL,
    PRIMARY KEY (clog_id, run_id)
);

-- Many keyed rows per tick
CREATE TABLE IF NOT EXISTS ocean_storage_tick (
    clog_id     TEXT NOT NULL,
    run_id      TEXT NOT NULL,
    tick_id     TEXT NOT NULL,
    row_id      TEXT NOT NULL,
    value       TEXT NOT NULL,
    updated_ts  INTEGER NOT NULL,
    PRIMARY KEY (clog_id, run_id, tick_id, row_id),
    FOREIGN KEY (run_id, tick_id) REFERENCES ocean_ticks(run_id, tick_id) ON DELETE CASCADE
);

-- Append-only audit log; outside the cascade, pruned by TTL
CREATE TABLE IF NOT EXISTS events (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    ts          INTEGER NOT NULL,
    scope_kind  TEXT NOT NULL,
    session_id  TEXT,
    run_id      TEXT,
    tick_id     TEXT,
    type        TEXT NOT NULL,
    payload     TEXT NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS ocean_schema_info (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Indexes for common queries
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
CREATE INDEX IF NOT EXISTS idx_events_run_seq ON events(run_id, seq);
CREATE INDEX IF NOT EXISTS idx_events_session_seq ON events(session_id, seq);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id);
"#;

// ─── Run Status ─────────────────────────────────────────────────

/// Lifecycle state of a run.
///
/// The database stores only `idle`, `pending`, `waiting`, `done` and
/// `failed`. `Active` is a derived view: a valid lock on a non-terminal
/// row. Keeping the stored status untouched across acquire is what lets
/// a stale lock be stolen without a reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Pending,
    Active,
    Waiting,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Pending => "pending",
            RunStatus::Active => "active",
            RunStatus::Waiting => "waiting",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(RunStatus::Idle),
            "pending" => Ok(RunStatus::Pending),
            "active" => Ok(RunStatus::Active),
            "waiting" => Ok(RunStatus::Waiting),
            "done" => Ok(RunStatus::Done),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow!("unknown run status '{}'", other)),
        }
    }

    /// Terminal statuses absorb signals and advances without effect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Row Types ───────────────────────────────────────────────────

/// A row from the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub session_id: String,
    pub clog_id: String,
    pub status: RunStatus,
    pub state: Value,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<i64>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub wake_at: Option<i64>,
    pub pending_input: Option<Value>,
    pub last_error: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl RunRow {
    /// A lock is valid while `locked_by` is set and not yet expired.
    pub fn lock_is_valid(&self, now_ms: i64) -> bool {
        matches!(
            (&self.locked_by, self.lock_expires_at),
            (Some(_), Some(expires)) if expires > now_ms
        )
    }

    /// Observer-facing status: `active` while a valid lock is held on a
    /// non-terminal row, the stored status otherwise.
    pub fn effective_status(&self, now_ms: i64) -> RunStatus {
        if !self.status.is_terminal() && self.lock_is_valid(now_ms) {
            RunStatus::Active
        } else {
            self.status
        }
    }
}

/// A row from the `events` table.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub seq: i64,
    pub id: String,
    pub ts: i64,
    pub scope_kind: String,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub tick_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

/// A storage row from any of the singleton scopes.
#[derive(Debug, Clone)]
pub struct StorageRow {
    pub value: Value,
    pub updated_ts: i64,
}

/// A keyed row from `ocean_storage_tick`.
#[derive(Debug, Clone)]
pub struct TickStorageRow {
    pub row_id: String,
    pub value: Value,
    pub updated_ts: i64,
}
