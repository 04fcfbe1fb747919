//! Ocean: a persistence-first execution substrate for resumable runs.
//!
//! Every piece of durable state lives in a single relational database;
//! forward progress is driven opportunistically by external pokes. There
//! is no long-running process and no in-memory state between
//! invocations — a run is a durable state machine, a tick is one bounded
//! unit of work inside it, and adapters ("clogs") are the only code that
//! runs inside ticks.
//!
//! The core pieces:
//! - [`kernel::Ocean`] — the public facade (create/signal/advance/…)
//! - [`scheduler`] — acquire one run, dispatch, classify, release
//! - [`storage`] — scoped JSON storage with read-before-write enforcement
//! - [`tools`] — the budgeted tool surface adapters call
//! - [`persistence`] — the turso-backed state store and event log
//! - [`clock`] — the single time seam everything consults

pub mod clock;
pub mod clog;
pub mod kernel;
pub mod persistence;
pub mod scheduler;
pub mod storage;
pub mod tools;

pub use clock::Clock;
pub use clog::{AdvanceContext, Clog, ClogRegistry};
pub use kernel::config::OceanConfig;
pub use kernel::{CreateRun, DirectCall, Ocean, RunView};
pub use persistence::{EventFilter, EventRecord, EventScopeKind, RunStatus};
pub use scheduler::outcome::TickOutcome;
pub use scheduler::{AdvanceReport, AdvanceResult};
pub use storage::{HistoryOrder, ReadPlan, SnapshotEntry, WriteOp};
pub use tools::{TickContext, ToolError, ToolInvoker};
