//! Run CRUD and the atomic primitives the scheduler relies on.
//!
//! Three statements carry the concurrency story:
//! - `acquire_run` — BEGIN IMMEDIATE bracketing a candidate SELECT and a
//!   conditional UPDATE that re-asserts the eligibility predicate, so two
//!   concurrent acquirers cannot both win the same run.
//! - `signal_run` — one UPDATE whose CASE arms flip `idle`/`waiting` to
//!   `pending`, leave `active`/`pending` statuses alone, and absorb the
//!   signal entirely on terminal rows.
//! - `release_run` — one UPDATE that checks `pending_input` and either
//!   folds the mid-tick signal in or applies the caller's patch, clearing
//!   the lock in the same statement. Terminal patches skip the check.
//!
//! The stored status never becomes `active`: the active marker is the
//! non-null lock, so a crashed instance leaves an eligible row behind once
//! the lock expires.

use anyhow::{ensure, Context, Result};
use serde_json::Value;
use turso::Connection;

use crate::clock::new_id;
use super::schema::{RunRow, RunStatus};
use super::state::{parse_json, render_json, StateStore};

const RUN_COLUMNS: &str = "run_id, session_id, clog_id, status, state, locked_by, \
     lock_expires_at, attempt, max_attempts, wake_at, pending_input, last_error, \
     created_ts, updated_ts";

/// Parameters for [`StateStore::create_run`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub session_id: String,
    pub clog_id: String,
    /// `None` creates an idle run; `Some` (including JSON `null`) creates a
    /// pending run with that input queued.
    pub input: Option<Value>,
    pub initial_state: Option<Value>,
    pub max_attempts: u32,
}

/// The outcome-derived patch applied by [`StateStore::release_run`].
///
/// Terminal patches (`done`/`failed`) apply unconditionally; all others
/// yield to a signal that arrived during the tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePatch {
    pub status: RunStatus,
    pub attempt: u32,
    pub wake_at: Option<i64>,
    pub last_error: Option<String>,
    pub pending_input: Option<Value>,
}

impl StateStore {
    // ─── Create / Read ───────────────────────────────────────────

    /// Create a run (and its session if absent). Returns the new run id.
    pub async fn create_run(&self, new: &NewRun, now_ms: i64) -> Result<String> {
        ensure!(new.max_attempts >= 1, "max_attempts must be at least 1");

        let run_id = new_id("run");
        let status = if new.input.is_some() {
            RunStatus::Pending
        } else {
            RunStatus::Idle
        };
        let state = new.initial_state.clone().unwrap_or(Value::Object(Default::default()));
        let pending_input = match &new.input {
            Some(v) => Some(render_json(v)?),
            None => None,
        };

        let conn = self.conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO ocean_sessions (session_id, created_ts) VALUES (?1, ?2)",
            turso::params![new.session_id.as_str(), now_ms],
        )
        .await
        .with_context(|| format!("Failed to ensure session: {}", new.session_id))?;

        conn.execute(
            "INSERT INTO runs (run_id, session_id, clog_id, status, state, locked_by, \
             lock_expires_at, attempt, max_attempts, wake_at, pending_input, last_error, \
             created_ts, updated_ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, 0, ?6, NULL, ?7, NULL, ?8, ?8)",
            turso::params![
                run_id.as_str(),
                new.session_id.as_str(),
                new.clog_id.as_str(),
                status.as_str(),
                render_json(&state)?,
                new.max_attempts as i64,
                pending_input,
                now_ms,
            ],
        )
        .await
        .with_context(|| format!("Failed to create run for session: {}", new.session_id))?;

        Ok(run_id)
    }

    /// Fetch a run row. Pure read.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
        let mut rows = conn.query(&sql, [run_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(run_row_from(&row)?)),
            None => Ok(None),
        }
    }

    // ─── Signal ──────────────────────────────────────────────────

    /// Enqueue input into a run.
    ///
    /// `idle`/`waiting` flip to `pending` (clearing `wake_at`); `pending`
    /// and locked rows keep their status but the input is overwritten;
    /// terminal rows update neither status nor input. One statement so a
    /// signal can never be half-applied.
    pub async fn signal_run(&self, run_id: &str, input: &Value, now_ms: i64) -> Result<()> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE runs SET \
                 pending_input = CASE WHEN status IN ('done','failed') THEN pending_input ELSE ?1 END, \
                 wake_at       = CASE WHEN status IN ('idle','waiting') THEN NULL ELSE wake_at END, \
                 status        = CASE WHEN status IN ('idle','waiting') THEN 'pending' ELSE status END, \
                 updated_ts    = CASE WHEN status IN ('done','failed') THEN updated_ts ELSE ?2 END \
                 WHERE run_id = ?3",
                turso::params![render_json(input)?, now_ms, run_id],
            )
            .await
            .with_context(|| format!("Failed to signal run: {}", run_id))?;
        ensure!(affected == 1, "run '{}' not found", run_id);
        Ok(())
    }

    // ─── Acquire / Consume / Release ─────────────────────────────

    /// Atomically select and lock one eligible run.
    ///
    /// Eligible: `pending`, or `waiting` with `wake_at <= now`; and
    /// unlocked or holding an expired lock. Returns the pre-update
    /// snapshot (the caller needs `pending_input` and `attempt` as they
    /// were before the lock was taken).
    pub async fn acquire_run(
        &self,
        instance_id: &str,
        lock_ms: i64,
        now_ms: i64,
    ) -> Result<Option<RunRow>> {
        let conn = self.conn().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        match acquire_in_tx(&conn, instance_id, lock_ms, now_ms).await {
            Ok(Some(run)) => {
                conn.execute("COMMIT", ()).await?;
                Ok(Some(run))
            }
            Ok(None) => {
                conn.execute("ROLLBACK", ()).await.ok();
                Ok(None)
            }
            Err(e) => {
                conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    /// Null out `pending_input` so a signal arriving during the tick is
    /// observable as a fresh non-NULL value at release time.
    pub async fn consume_pending_input(&self, run_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE runs SET pending_input = NULL WHERE run_id = ?1",
            [run_id],
        )
        .await
        .with_context(|| format!("Failed to consume pending input for run: {}", run_id))?;
        Ok(())
    }

    /// Release the lock while applying the outcome patch.
    ///
    /// Non-terminal patches go through the CASE-in-UPDATE signal check: a
    /// non-NULL `pending_input` at release time wins over the patch
    /// (status `pending`, attempt reset, input kept). Terminal patches
    /// apply unconditionally — signals cannot override `done`/`failed`.
    pub async fn release_run(
        &self,
        run_id: &str,
        patch: &ReleasePatch,
        now_ms: i64,
    ) -> Result<()> {
        let pending_input = match &patch.pending_input {
            Some(v) => Some(render_json(v)?),
            None => None,
        };
        let sql = if patch.status.is_terminal() {
            "UPDATE runs SET \
             status = ?1, attempt = ?2, wake_at = ?3, last_error = ?4, pending_input = ?5, \
             locked_by = NULL, lock_expires_at = NULL, updated_ts = ?6 \
             WHERE run_id = ?7"
        } else {
            "UPDATE runs SET \
             status        = CASE WHEN pending_input IS NOT NULL THEN 'pending' ELSE ?1 END, \
             attempt       = CASE WHEN pending_input IS NOT NULL THEN 0 ELSE ?2 END, \
             wake_at       = CASE WHEN pending_input IS NOT NULL THEN NULL ELSE ?3 END, \
             last_error    = CASE WHEN pending_input IS NOT NULL THEN NULL ELSE ?4 END, \
             pending_input = CASE WHEN pending_input IS NOT NULL THEN pending_input ELSE ?5 END, \
             locked_by = NULL, lock_expires_at = NULL, updated_ts = ?6 \
             WHERE run_id = ?7"
        };

        let conn = self.conn().await?;
        conn.execute(
            sql,
            turso::params![
                patch.status.as_str(),
                patch.attempt as i64,
                patch.wake_at,
                patch.last_error.clone(),
                pending_input,
                now_ms,
                run_id,
            ],
        )
        .await
        .with_context(|| format!("Failed to release run: {}", run_id))?;
        Ok(())
    }

    // ─── Ticks ───────────────────────────────────────────────────

    /// Create the tick entity, at most once per `(run_id, tick_id)`.
    pub async fn insert_tick(&self, run_id: &str, tick_id: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO ocean_ticks (run_id, tick_id, created_ts) VALUES (?1, ?2, ?3)",
            turso::params![run_id, tick_id, now_ms],
        )
        .await
        .with_context(|| format!("Failed to insert tick for run: {}", run_id))?;
        Ok(())
    }

    // ─── Deletes (application-emulated cascades) ─────────────────

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        match cascade_delete_session(&conn, session_id).await {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        match cascade_delete_run(&conn, run_id).await {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    pub async fn delete_tick(&self, run_id: &str, tick_id: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        match cascade_delete_tick(&conn, run_id, tick_id).await {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }
}

async fn acquire_in_tx(
    conn: &Connection,
    instance_id: &str,
    lock_ms: i64,
    now_ms: i64,
) -> Result<Option<RunRow>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs \
         WHERE (status = 'pending' OR (status = 'waiting' AND wake_at <= ?1)) \
           AND (locked_by IS NULL OR lock_expires_at <= ?1) \
         ORDER BY updated_ts ASC, run_id ASC LIMIT 1"
    );
    let mut rows = conn.query(&sql, [now_ms]).await?;
    let snapshot = match rows.next().await? {
        Some(row) => run_row_from(&row)?,
        None => return Ok(None),
    };

    // Re-assert the predicate so the write stands alone even if the
    // transaction were downgraded to a savepoint pair.
    let affected = conn
        .execute(
            "UPDATE runs SET locked_by = ?1, lock_expires_at = ?2, updated_ts = ?3 \
             WHERE run_id = ?4 \
               AND (status = 'pending' OR (status = 'waiting' AND wake_at <= ?3)) \
               AND (locked_by IS NULL OR lock_expires_at <= ?3)",
            turso::params![instance_id, now_ms + lock_ms, now_ms, snapshot.run_id.as_str()],
        )
        .await?;

    if affected == 1 {
        Ok(Some(snapshot))
    } else {
        Ok(None)
    }
}

// Children before parents, mirroring the declared FK cascade topology.

pub(crate) async fn cascade_delete_session(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM ocean_storage_tick WHERE run_id IN \
         (SELECT run_id FROM runs WHERE session_id = ?1)",
        [session_id],
    )
    .await?;
    conn.execute(
        "DELETE FROM ocean_ticks WHERE run_id IN \
         (SELECT run_id FROM runs WHERE session_id = ?1)",
        [session_id],
    )
    .await?;
    conn.execute(
        "DELETE FROM ocean_storage_run WHERE run_id IN \
         (SELECT run_id FROM runs WHERE session_id = ?1)",
        [session_id],
    )
    .await?;
    conn.execute("DELETE FROM runs WHERE session_id = ?1", [session_id])
        .await?;
    conn.execute(
        "DELETE FROM ocean_storage_session WHERE session_id = ?1",
        [session_id],
    )
    .await?;
    conn.execute(
        "DELETE FROM ocean_sessions WHERE session_id = ?1",
        [session_id],
    )
    .await?;
    Ok(())
}

pub(crate) async fn cascade_delete_run(conn: &Connection, run_id: &str) -> Result<()> {
    conn.execute("DELETE FROM ocean_storage_tick WHERE run_id = ?1", [run_id])
        .await?;
    conn.execute("DELETE FROM ocean_ticks WHERE run_id = ?1", [run_id])
        .await?;
    conn.execute("DELETE FROM ocean_storage_run WHERE run_id = ?1", [run_id])
        .await?;
    conn.execute("DELETE FROM runs WHERE run_id = ?1", [run_id])
        .await?;
    Ok(())
}

pub(crate) async fn cascade_delete_tick(
    conn: &Connection,
    run_id: &str,
    tick_id: &str,
) -> Result<()> {
    conn.execute(
        "DELETE FROM ocean_storage_tick WHERE run_id = ?1 AND tick_id = ?2",
        turso::params![run_id, tick_id],
    )
    .await?;
    conn.execute(
        "DELETE FROM ocean_ticks WHERE run_id = ?1 AND tick_id = ?2",
        turso::params![run_id, tick_id],
    )
    .await?;
    Ok(())
}

fn run_row_from(row: &turso::Row) -> Result<RunRow> {
    let pending_input = match row.get::<Option<String>>(10)? {
        Some(text) => Some(parse_json(&text)?),
        None => None,
    };
    Ok(RunRow {
        run_id: row.get::<String>(0)?,
        session_id: row.get::<String>(1)?,
        clog_id: row.get::<String>(2)?,
        status: RunStatus::parse(&row.get::<String>(3)?)?,
        state: parse_json(&row.get::<String>(4)?)?,
        locked_by: row.get::<Option<String>>(5)?,
        lock_expires_at: row.get::<Option<i64>>(6)?,
        attempt: row.get::<i64>(7)? as u32,
        max_attempts: row.get::<i64>(8)? as u32,
        wake_at: row.get::<Option<i64>>(9)?,
        pending_input,
        last_error: row.get::<Option<String>>(11)?,
        created_ts: row.get::<i64>(12)?,
        updated_ts: row.get::<i64>(13)?,
    })
}

// ─── Tests ───────────────────────────────────────────────────────
