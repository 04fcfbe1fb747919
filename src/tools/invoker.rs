//! Per-tick tool invokers and the factory that builds them.
//!
//! One invoker exists per `(clog, tick)` and owns that pair's storage
//! budget and read ledger. The factory closes over the shared tick
//! context; every peer call mints a fresh invoker for the callee, so
//! budgets and capabilities never cross an adapter boundary.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::clog::ClogRegistry;
use crate::persistence::{EventScopeKind, StateStore};
use crate::storage::engine;
use crate::storage::{ReadLedger, ReadPlan, SnapshotEntry, WriteOp};

use super::{parse_args, TickContext, ToolError};

pub const TOOL_READ_SCOPED: &str = "ocean.storage.read_scoped";
pub const TOOL_WRITE_SCOPED: &str = "ocean.storage.write_scoped";
pub const TOOL_EVENTS_EMIT: &str = "ocean.events.emit";
pub const TOOL_CLOG_CALL: &str = "ocean.clog.call";

/// Builds tool invokers bound to one tick context.
#[derive(Clone)]
pub struct InvokerFactory {
    store: StateStore,
    registry: ClogRegistry,
    clock: Clock,
    ctx: TickContext,
}

impl InvokerFactory {
    pub fn new(store: StateStore, registry: ClogRegistry, clock: Clock, ctx: TickContext) -> Self {
        Self {
            store,
            registry,
            clock,
            ctx,
        }
    }

    /// A fresh invoker for `clog_id`: zeroed budget, empty ledger.
    pub fn invoker_for(&self, clog_id: &str) -> ToolInvoker {
        ToolInvoker {
            clog_id: clog_id.to_string(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            ctx: self.ctx.clone(),
            budget: Mutex::new(TickBudget::default()),
        }
    }
}

#[derive(Default)]
struct TickBudget {
    read_called: bool,
    write_called: bool,
    ledger: ReadLedger,
}

/// The tool surface one adapter sees during one tick.
pub struct ToolInvoker {
    clog_id: String,
    store: StateStore,
    registry: ClogRegistry,
    clock: Clock,
    ctx: TickContext,
    budget: Mutex<TickBudget>,
}

impl ToolInvoker {
    pub fn clog_id(&self) -> &str {
        &self.clog_id
    }

    pub fn context(&self) -> &TickContext {
        &self.ctx
    }

    // ─── Typed surface ───────────────────────────────────────────

    /// The single batched read of this tick.
    ///
    /// Validation failures (scope mismatch, double call) do not consume
    /// the budget; a validated call does, and mints ledger capabilities
    /// for every requested identity before touching the database.
    pub async fn read_scoped(
        &self,
        plans: Vec<ReadPlan>,
    ) -> Result<Vec<SnapshotEntry>, ToolError> {
        {
            let mut budget = self.budget.lock().expect("budget lock poisoned");
            if budget.read_called {
                return Err(ToolError::ReadAlreadyCalled);
            }
            engine::validate_plans(&plans, &self.ctx)?;
            budget.read_called = true;
            engine::record_plans(&plans, &mut budget.ledger);
        }
        engine::execute_read(&self.store, &self.clog_id, &plans).await
    }

    /// The single batched write of this tick. Every op is validated
    /// against the ledger before any is applied; application happens in
    /// one transaction.
    pub async fn write_scoped(&self, ops: Vec<WriteOp>) -> Result<usize, ToolError> {
        {
            let mut budget = self.budget.lock().expect("budget lock poisoned");
            if !budget.read_called {
                return Err(ToolError::WriteBeforeRead);
            }
            if budget.write_called {
                return Err(ToolError::WriteAlreadyCalled);
            }
            engine::validate_ops(&ops, &self.ctx, &budget.ledger)?;
            budget.write_called = true;
        }
        engine::execute_write(&self.store, &self.clog_id, &ops, self.clock.now_ms()).await
    }

    /// Append an event scoped to the current tick context. Not budgeted.
    pub async fn emit(
        &self,
        scope: EventScopeKind,
        event_type: &str,
        payload: Value,
    ) -> Result<(), ToolError> {
        let (session_id, run_id, tick_id) = match scope {
            EventScopeKind::Global => (None, None, None),
            EventScopeKind::Session => (Some(self.ctx.session_id.as_str()), None, None),
            EventScopeKind::Run => (
                Some(self.ctx.session_id.as_str()),
                Some(self.ctx.run_id.as_str()),
                None,
            ),
            EventScopeKind::Tick => (
                Some(self.ctx.session_id.as_str()),
                Some(self.ctx.run_id.as_str()),
                Some(self.ctx.tick_id.as_str()),
            ),
        };
        self.store
            .append_event(
                scope,
                session_id,
                run_id,
                tick_id,
                event_type,
                &payload,
                self.clock.now_ms(),
            )
            .await?;
        Ok(())
    }

    /// Call a peer clog endpoint: `clog.<id>.<method>`.
    ///
    /// The callee receives a fresh invoker — same tick, independent
    /// budget and ledger.
    pub async fn call_clog(&self, address: &str, payload: Value) -> Result<Value, ToolError> {
        let (clog_id, method) = parse_address(address)?;
        let clog = self
            .registry
            .get(clog_id)
            .ok_or_else(|| ToolError::UnknownClog(clog_id.to_string()))?;

        debug!(caller = %self.clog_id, callee = %clog_id, method = %method, "Peer clog call");

        let peer = InvokerFactory::new(
            self.store.clone(),
            self.registry.clone(),
            self.clock.clone(),
            self.ctx.clone(),
        )
        .invoker_for(clog_id);

        clog.call_endpoint(method, payload, &peer).await
    }

    // ─── JSON dispatch surface ───────────────────────────────────

    /// Dispatch a tool call by name. Success returns the tool's result
    /// object; failure returns `{ok:false, error:{code, message,
    /// details}}` so handler code can branch rather than propagate.
    pub async fn invoke(&self, name: &str, input: Value) -> Value {
        debug!(clog = %self.clog_id, tool = %name, "Tool invocation");
        match self.dispatch(name, input).await {
            Ok(result) => result,
            Err(e) => e.to_envelope(),
        }
    }

    async fn dispatch(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        match name {
            TOOL_READ_SCOPED => {
                let args: ReadScopedInput = parse_args(input)?;
                let snapshot = self.read_scoped(args.plans).await?;
                Ok(json!({ "snapshot": snapshot }))
            }
            TOOL_WRITE_SCOPED => {
                let args: WriteScopedInput = parse_args(input)?;
                let applied = self.write_scoped(args.ops).await?;
                Ok(json!({ "applied": applied }))
            }
            TOOL_EVENTS_EMIT => {
                let args: EmitInput = parse_args(input)?;
                self.emit(args.scope, &args.event_type, args.payload).await?;
                Ok(json!({ "ok": true }))
            }
            TOOL_CLOG_CALL => {
                let args: CallInput = parse_args(input)?;
                let result = self.call_clog(&args.address, args.payload).await?;
                Ok(json!({ "result": result }))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn parse_address(address: &str) -> Result<(&str, &str), ToolError> {
    let rest = address.strip_prefix("clog.").ok_or_else(|| {
        ToolError::InvalidParams(format!(
            "peer address '{}' must look like clog.<id>.<method>",
            address
        ))
    })?;
    match rest.rsplit_once('.') {
        Some((clog_id, method)) if !clog_id.is_empty() && !method.is_empty() => {
            Ok((clog_id, method))
        }
        _ => Err(ToolError::InvalidParams(format!(
            "peer address '{}' must look like clog.<id>.<method>",
            address
        ))),
    }
}

#[derive(Deserialize)]
struct ReadScopedInput {
    plans: Vec<ReadPlan>,
}

#[derive(Deserialize)]
struct WriteScopedInput {
    ops: Vec<WriteOp>,
}

#[derive(Deserialize)]
struct EmitInput {
    scope: EventScopeKind,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct CallInput {
    address: String,
    #[serde(default)]
    payload: Value,
}
