//! Validate-then-apply execution of scoped read and write batches.
//!
//! Validation is pure and runs over the whole batch before any statement
//! touches the database: scope identifiers must match the current tick
//! context, and every write target must already be in the read ledger.
//! Writes then apply inside one transaction so a partial failure cannot
//! corrupt state.

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::persistence::run_store::{
    cascade_delete_run, cascade_delete_session, cascade_delete_tick,
};
use crate::persistence::state::{
    clear_global, clear_run, clear_session, del_tick_row, upsert_global, upsert_run,
    upsert_session, upsert_tick_row, StateStore,
};
use crate::tools::{TickContext, ToolError};

use super::ledger::ReadLedger;
use super::{HistoryOrder, HistoryTick, ReadPlan, SnapshotEntry, WriteOp};

// ─── Read side ───────────────────────────────────────────────────

/// Scope check: every plan must reference the current tick's identity.
pub(crate) fn validate_plans(plans: &[ReadPlan], ctx: &TickContext) -> Result<(), ToolError> {
    for plan in plans {
        match plan {
            ReadPlan::Global => {}
            ReadPlan::Session { session_id } => {
                if session_id != &ctx.session_id {
                    return Err(ToolError::InvalidScope(format!(
                        "session '{}' is not the current tick's session",
                        session_id
                    )));
                }
            }
            ReadPlan::Run { run_id } | ReadPlan::HistoryTicksForRun { run_id, .. } => {
                if run_id != &ctx.run_id {
                    return Err(ToolError::InvalidScope(format!(
                        "run '{}' is not the current tick's run",
                        run_id
                    )));
                }
            }
            ReadPlan::TickRows { run_id, tick_id, .. } => {
                if run_id != &ctx.run_id || tick_id != &ctx.tick_id {
                    return Err(ToolError::InvalidScope(format!(
                        "tick rows '{}/{}' do not belong to the current tick",
                        run_id, tick_id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Mint capabilities for the requested identities. Row existence is
/// irrelevant: reading an absent row still authorizes writing it. The
/// history plan records nothing.
pub(crate) fn record_plans(plans: &[ReadPlan], ledger: &mut ReadLedger) {
    for plan in plans {
        match plan {
            ReadPlan::Global => ledger.record_global(),
            ReadPlan::Session { session_id } => ledger.record_session(session_id),
            ReadPlan::Run { run_id } => ledger.record_run(run_id),
            ReadPlan::TickRows { run_id, tick_id, row_ids } => {
                for row_id in row_ids {
                    ledger.record_tick_row(run_id, tick_id, row_id);
                }
            }
            ReadPlan::HistoryTicksForRun { .. } => {}
        }
    }
}

pub(crate) async fn execute_read(
    store: &StateStore,
    clog_id: &str,
    plans: &[ReadPlan],
) -> Result<Vec<SnapshotEntry>, ToolError> {
    let mut snapshot = Vec::with_capacity(plans.len());
    for plan in plans {
        let entry = match plan {
            ReadPlan::Global => SnapshotEntry::Global {
                value: store.global_get(clog_id).await?.map(|r| r.value),
            },
            ReadPlan::Session { session_id } => SnapshotEntry::Session {
                value: store
                    .session_get(clog_id, session_id)
                    .await?
                    .map(|r| r.value),
            },
            ReadPlan::Run { run_id } => SnapshotEntry::Run {
                value: store.run_get(clog_id, run_id).await?.map(|r| r.value),
            },
            ReadPlan::TickRows { run_id, tick_id, row_ids } => {
                let rows = store.tick_rows_get(clog_id, run_id, tick_id).await?;
                let wanted: BTreeMap<String, Value> = rows
                    .into_iter()
                    .filter(|row| row_ids.contains(&row.row_id))
                    .map(|row| (row.row_id, row.value))
                    .collect();
                SnapshotEntry::TickRows { rows: wanted }
            }
            ReadPlan::HistoryTicksForRun { run_id, row_ids, limit_ticks, order } => {
                let descending = matches!(order, Some(HistoryOrder::Desc));
                let entries = store
                    .tick_history(clog_id, run_id, *limit_ticks, descending)
                    .await?;
                let ticks = entries
                    .into_iter()
                    .map(|entry| HistoryTick {
                        tick_id: entry.tick_id,
                        updated_ts: entry.updated_ts,
                        rows: entry
                            .rows
                            .into_iter()
                            .filter(|row| {
                                row_ids
                                    .as_ref()
                                    .map(|ids| ids.contains(&row.row_id))
                                    .unwrap_or(true)
                            })
                            .map(|row| (row.row_id, row.value))
                            .collect(),
                    })
                    .collect();
                SnapshotEntry::HistoryTicksForRun { ticks }
            }
        };
        snapshot.push(entry);
    }
    Ok(snapshot)
}

// ─── Write side ──────────────────────────────────────────────────

/// Fail-fast validation of a whole op batch: scope equality first, then
/// RBW ledger membership. Nothing is applied unless every op passes.
pub(crate) fn validate_ops(
    ops: &[WriteOp],
    ctx: &TickContext,
    ledger: &ReadLedger,
) -> Result<(), ToolError> {
    for op in ops {
        match op {
            WriteOp::GlobalSet { .. } | WriteOp::GlobalClear => {
                if !ledger.allows_global() {
                    return Err(ToolError::RbwViolation {
                        scope: "global",
                        key: "global".into(),
                    });
                }
            }
            WriteOp::SessionSet { session_id, .. }
            | WriteOp::SessionClear { session_id }
            | WriteOp::SessionDelete { session_id } => {
                if session_id != &ctx.session_id {
                    return Err(ToolError::InvalidScope(format!(
                        "session '{}' is not the current tick's session",
                        session_id
                    )));
                }
                if !ledger.allows_session(session_id) {
                    return Err(ToolError::RbwViolation {
                        scope: "session",
                        key: session_id.clone(),
                    });
                }
            }
            WriteOp::RunSet { run_id, .. }
            | WriteOp::RunClear { run_id }
            | WriteOp::RunDelete { run_id } => {
                if run_id != &ctx.run_id {
                    return Err(ToolError::InvalidScope(format!(
                        "run '{}' is not the current tick's run",
                        run_id
                    )));
                }
                if !ledger.allows_run(run_id) {
                    return Err(ToolError::RbwViolation {
                        scope: "run",
                        key: run_id.clone(),
                    });
                }
            }
            WriteOp::TickSet { run_id, tick_id, row_id, .. }
            | WriteOp::TickDel { run_id, tick_id, row_id } => {
                if run_id != &ctx.run_id || tick_id != &ctx.tick_id {
                    return Err(ToolError::InvalidScope(format!(
                        "tick rows '{}/{}' do not belong to the current tick",
                        run_id, tick_id
                    )));
                }
                if !ledger.allows_tick_row(run_id, tick_id, row_id) {
                    return Err(ToolError::RbwViolation {
                        scope: "tick",
                        key: format!("{}/{}/{}", run_id, tick_id, row_id),
                    });
                }
            }
            WriteOp::TickDelete { run_id, tick_id } => {
                if run_id != &ctx.run_id || tick_id != &ctx.tick_id {
                    return Err(ToolError::InvalidScope(format!(
                        "tick '{}/{}' is not the current tick",
                        run_id, tick_id
                    )));
                }
                if !ledger.allows_any_row_of_tick(run_id, tick_id) {
                    return Err(ToolError::RbwViolation {
                        scope: "tick",
                        key: format!("{}/{}", run_id, tick_id),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Apply a validated op batch inside one transaction.
pub(crate) async fn execute_write(
    store: &StateStore,
    clog_id: &str,
    ops: &[WriteOp],
    now_ms: i64,
) -> Result<usize, ToolError> {
    apply_ops(store, clog_id, ops, now_ms)
        .await
        .map_err(ToolError::Storage)
}

async fn apply_ops(
    store: &StateStore,
    clog_id: &str,
    ops: &[WriteOp],
    now_ms: i64,
) -> Result<usize> {
    let conn = store.conn().await?;
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    for op in ops {
        let applied = match op {
            WriteOp::GlobalSet { value } => upsert_global(&conn, clog_id, value, now_ms).await,
            WriteOp::GlobalClear => clear_global(&conn, clog_id).await,
            WriteOp::SessionSet { session_id, value } => {
                upsert_session(&conn, clog_id, session_id, value, now_ms).await
            }
            WriteOp::SessionClear { session_id } => {
                clear_session(&conn, clog_id, session_id).await
            }
            WriteOp::RunSet { run_id, value } => {
                upsert_run(&conn, clog_id, run_id, value, now_ms).await
            }
            WriteOp::RunClear { run_id } => clear_run(&conn, clog_id, run_id).await,
            WriteOp::TickSet { run_id, tick_id, row_id, value } => {
                upsert_tick_row(&conn, clog_id, run_id, tick_id, row_id, value, now_ms).await
            }
            WriteOp::TickDel { run_id, tick_id, row_id } => {
                del_tick_row(&conn, clog_id, run_id, tick_id, row_id).await
            }
            WriteOp::SessionDelete { session_id } => {
                cascade_delete_session(&conn, session_id).await
            }
            WriteOp::RunDelete { run_id } => cascade_delete_run(&conn, run_id).await,
            WriteOp::TickDelete { run_id, tick_id } => {
                cascade_delete_tick(&conn, run_id, tick_id).await
            }
        };
        if let Err(e) = applied {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }
    }
    conn.execute("COMMIT", ()).await?;
    Ok(ops.len())
}

// ─── Tests ───────────────────────────────────────────────────────
