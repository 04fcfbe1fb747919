//! Adapter ("clog") trait and registry.
//!
//! Clogs are the only code that runs inside ticks. A clog owns its runs:
//! the scheduler dispatches a run's advance handler solely by `clog_id`,
//! and peers reach each other's named endpoints through `clog.call`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::scheduler::outcome::TickOutcome;
use crate::tools::{ToolError, ToolInvoker};

/// Context handed to an advance handler.
pub struct AdvanceContext<'a> {
    /// Tool invoker bound to this clog for the current tick.
    pub tools: &'a ToolInvoker,
    /// The run's attempt counter at acquire time.
    pub attempt: u32,
}

/// A user-supplied adapter: an id, optional named endpoints, and an
/// optional advance handler.
///
/// Handlers MAY return errors; the scheduler converts an advance-handler
/// error into a retry outcome. Endpoint errors surface to the calling
/// adapter as tool-result errors.
#[async_trait]
pub trait Clog: Send + Sync {
    /// Stable adapter id, e.g. `"chat"`.
    fn id(&self) -> &str;

    /// Whether this clog implements [`Clog::on_advance`]. The scheduler
    /// fails a run owned by a clog without one.
    fn has_advance_handler(&self) -> bool {
        false
    }

    /// Advance the run by one tick. `input` is the pending-input snapshot
    /// taken at acquire.
    async fn on_advance(
        &self,
        input: Option<Value>,
        cx: AdvanceContext<'_>,
    ) -> Result<TickOutcome> {
        let _ = (input, cx);
        anyhow::bail!("clog '{}' has no advance handler", self.id())
    }

    /// Invoke a named endpoint on behalf of a peer (or a direct caller).
    /// `tools` is a fresh invoker bound to THIS clog with its own budget.
    async fn call_endpoint(
        &self,
        method: &str,
        payload: Value,
        tools: &ToolInvoker,
    ) -> Result<Value, ToolError> {
        let _ = (payload, tools);
        Err(ToolError::UnknownEndpoint {
            clog: self.id().to_string(),
            method: method.to_string(),
        })
    }
}

/// Process-wide registry of adapters; read-only after startup.
///
/// Cloning is cheap (the map is shared), which is what lets every tool
/// invoker resolve peer calls without a lock.
#[derive(Clone, Default)]
pub struct ClogRegistry {
    clogs: Arc<BTreeMap<String, Arc<dyn Clog>>>,
}

impl ClogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a clog. Returns an error if the id is already taken.
    pub fn register(&mut self, clog: Arc<dyn Clog>) -> Result<()> {
        let id = clog.id().to_string();
        let map = Arc::make_mut(&mut self.clogs);
        if map.contains_key(&id) {
            anyhow::bail!("Clog '{}' already registered", id);
        }
        map.insert(id, clog);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Clog>> {
        self.clogs.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clogs.is_empty()
    }
}
