//! Durable state: schema, state store, run machine, event log.

pub mod events;
pub mod run_store;
pub mod schema;
pub mod state;

pub use events::{EventFilter, EventScopeKind};
pub use run_store::{NewRun, ReleasePatch};
pub use schema::{EventRecord, RunRow, RunStatus, StorageRow, TickStorageRow};
pub use state::{StateStore, TickHistoryEntry};
