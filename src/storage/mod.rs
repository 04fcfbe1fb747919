//! Scoped storage: read plans, write ops, and the RBW engine.
//!
//! Storage is four scopes of durable JSON — one row per adapter
//! (global), one per `(adapter, session)`, one per `(adapter, run)`, and
//! many keyed rows per `(adapter, run, tick)`. The plain CRUD lives on
//! the state store; correctness lives here, in the batched read and
//! write tools and the read-before-write ledger.

pub mod engine;
pub mod ledger;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use ledger::ReadLedger;

/// One read in a `read_scoped` batch.
///
/// Non-history plans must name the current tick's identifiers and record
/// the requested identities into the RBW ledger whether or not a row
/// exists. The history plan reads but never records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum ReadPlan {
    Global,
    #[serde(rename_all = "camelCase")]
    Session { session_id: String },
    #[serde(rename_all = "camelCase")]
    Run { run_id: String },
    #[serde(rename_all = "camelCase")]
    TickRows {
        run_id: String,
        tick_id: String,
        row_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    HistoryTicksForRun {
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_ids: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_ticks: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<HistoryOrder>,
    },
}

/// Ordering of history ticks by their latest update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOrder {
    Asc,
    Desc,
}

/// One mutation in a `write_scoped` batch.
///
/// All ops of a batch are validated before any is applied, then applied
/// inside one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WriteOp {
    #[serde(rename = "global.set")]
    GlobalSet { value: Value },
    #[serde(rename = "global.clear")]
    GlobalClear,
    #[serde(rename = "session.set", rename_all = "camelCase")]
    SessionSet { session_id: String, value: Value },
    #[serde(rename = "session.clear", rename_all = "camelCase")]
    SessionClear { session_id: String },
    #[serde(rename = "run.set", rename_all = "camelCase")]
    RunSet { run_id: String, value: Value },
    #[serde(rename = "run.clear", rename_all = "camelCase")]
    RunClear { run_id: String },
    #[serde(rename = "tick.set", rename_all = "camelCase")]
    TickSet {
        run_id: String,
        tick_id: String,
        row_id: String,
        value: Value,
    },
    #[serde(rename = "tick.del", rename_all = "camelCase")]
    TickDel {
        run_id: String,
        tick_id: String,
        row_id: String,
    },
    #[serde(rename = "session.delete", rename_all = "camelCase")]
    SessionDelete { session_id: String },
    #[serde(rename = "run.delete", rename_all = "camelCase")]
    RunDelete { run_id: String },
    #[serde(rename = "tick.delete", rename_all = "camelCase")]
    TickDelete { run_id: String, tick_id: String },
}

/// One entry of the `read_scoped` snapshot, mirroring its plan.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum SnapshotEntry {
    Global {
        value: Option<Value>,
    },
    Session {
        value: Option<Value>,
    },
    Run {
        value: Option<Value>,
    },
    TickRows {
        rows: BTreeMap<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    HistoryTicksForRun {
        ticks: Vec<HistoryTick>,
    },
}

/// One tick of history: its rows and latest update time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTick {
    pub tick_id: String,
    pub updated_ts: i64,
    pub rows: BTreeMap<String, Value>,
}
