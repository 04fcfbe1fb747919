//! The Ocean facade — the public API application code and drivers use.
//!
//! Ocean has no opinions about adapter behavior and runs no background
//! work. It provides the physics: durable runs, tick dispatch, scoped
//! storage, the event log, and the tool surface. External pokes (HTTP
//! handlers, cron hits, webhooks) drive progress by calling `signal` and
//! `advance`.

pub mod config;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::clock::{new_id, Clock};
use crate::clog::{Clog, ClogRegistry};
use crate::persistence::{EventFilter, EventRecord, NewRun, RunStatus, StateStore};
use crate::scheduler::{self, AdvanceReport};
use crate::tools::{InvokerFactory, TickContext, ToolError};
use config::OceanConfig;

/// Parameters for [`Ocean::create_run`].
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub session_id: String,
    pub clog_id: String,
    /// `None` creates an idle run; `Some` (including JSON `null`) queues
    /// the value as the initial signal.
    pub input: Option<Value>,
    pub initial_state: Option<Value>,
    /// Overrides `scheduler.default_max_attempts`.
    pub max_attempts: Option<u32>,
}

impl CreateRun {
    pub fn new(session_id: impl Into<String>, clog_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            clog_id: clog_id.into(),
            input: None,
            initial_state: None,
            max_attempts: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Observer-facing run snapshot returned by [`Ocean::get_run`].
///
/// `status` is the derived view: `active` while a valid lock is held.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: String,
    pub session_id: String,
    pub clog_id: String,
    pub status: RunStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub wake_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Parameters for [`Ocean::call_clog`] — the direct endpoint-invocation
/// surface that bypasses the run state machine. No lock semantics; the
/// caller is responsible for avoiding interleaving with live ticks.
#[derive(Debug, Clone)]
pub struct DirectCall {
    pub run_id: String,
    pub tick_id: String,
    pub clog_id: String,
    pub method: String,
    pub payload: Value,
}

/// The Ocean kernel: one handle per process ("instance").
///
/// Multiple instances may share one database; the database is the only
/// coordination point.
pub struct Ocean {
    config: OceanConfig,
    store: StateStore,
    registry: ClogRegistry,
    clock: Clock,
    instance_id: String,
    last_gc_ms: AtomicI64,
}

impl Ocean {
    /// Open (or create) the database at `config.persistence.database_path`
    /// and apply the schema.
    pub async fn open(config: OceanConfig) -> Result<Self> {
        config.validate()?;
        let store = StateStore::open(&config.persistence.database_path).await?;
        Ok(Self::from_parts(config, store))
    }

    /// An in-memory Ocean (useful for testing).
    pub async fn open_memory(config: OceanConfig) -> Result<Self> {
        config.validate()?;
        let store = StateStore::open_memory().await?;
        Ok(Self::from_parts(config, store))
    }

    fn from_parts(config: OceanConfig, store: StateStore) -> Self {
        let instance_id = new_id("inst");
        info!(instance_id = %instance_id, "Ocean instance created");
        Self {
            config,
            store,
            registry: ClogRegistry::new(),
            clock: Clock::system(),
            instance_id,
            last_gc_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Replace the time source. The scheduler, backoff, lock expiry,
    /// event timestamps and the TTL sweep all consult this clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Override the generated instance id (the lock owner marker).
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Direct access to the state store, for drivers and tests.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Re-apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        self.store.migrate().await
    }

    // ─── Adapters ────────────────────────────────────────────────

    /// Register an adapter. Clogs are registered once, at startup.
    pub fn register_clog(&mut self, clog: Arc<dyn Clog>) -> Result<()> {
        self.registry.register(clog)
    }

    // ─── Runs ────────────────────────────────────────────────────

    /// Create a run (and its session if absent). Returns the run id.
    pub async fn create_run(&self, req: CreateRun) -> Result<String> {
        let max_attempts = req
            .max_attempts
            .unwrap_or(self.config.scheduler.default_max_attempts);
        self.store
            .create_run(
                &NewRun {
                    session_id: req.session_id,
                    clog_id: req.clog_id,
                    input: req.input,
                    initial_state: req.initial_state,
                    max_attempts,
                },
                self.clock.now_ms(),
            )
            .await
    }

    /// Enqueue input into a run. `None` is delivered as JSON `null`.
    pub async fn signal(&self, run_id: &str, input: Option<Value>) -> Result<()> {
        self.store
            .signal_run(run_id, &input.unwrap_or(Value::Null), self.clock.now_ms())
            .await
    }

    /// Observer snapshot of a run, with the derived `active` status.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunView>> {
        let now = self.clock.now_ms();
        Ok(self.store.get_run(run_id).await?.map(|run| RunView {
            status: run.effective_status(now),
            run_id: run.run_id,
            session_id: run.session_id,
            clog_id: run.clog_id,
            attempt: run.attempt,
            max_attempts: run.max_attempts,
            wake_at: run.wake_at,
            last_error: run.last_error,
            created_ts: run.created_ts,
            updated_ts: run.updated_ts,
        }))
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        self.store.delete_run(run_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.store.delete_session(session_id).await
    }

    // ─── Scheduling ──────────────────────────────────────────────

    /// Advance at most one run.
    pub async fn advance(&self) -> Result<AdvanceReport> {
        scheduler::advance_once(
            &self.store,
            &self.registry,
            &self.clock,
            &self.instance_id,
            self.config.scheduler.lock_ms,
        )
        .await
    }

    /// Call [`Ocean::advance`] until it returns zero or `max_rounds` is
    /// reached. Returns the reports of the rounds that advanced.
    pub async fn drain(&self, max_rounds: u32) -> Result<Vec<AdvanceReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_rounds {
            let report = self.advance().await?;
            if report.advanced == 0 {
                break;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// [`Ocean::drain`] with the configured round cap.
    pub async fn drain_default(&self) -> Result<Vec<AdvanceReport>> {
        self.drain(self.config.scheduler.drain_max_rounds).await
    }

    // ─── Events ──────────────────────────────────────────────────

    /// Scope-filtered event replay. `after_seq` defaults to the start of
    /// the log, `limit` to `events.read_limit`.
    pub async fn read_events(
        &self,
        scope: EventFilter,
        after_seq: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<EventRecord>> {
        self.store
            .read_events_by_scope(
                &scope,
                after_seq.unwrap_or(0),
                limit.unwrap_or(self.config.events.read_limit),
            )
            .await
    }

    /// Opportunistic TTL sweep, rate-limited to once per
    /// `events.gc_min_interval_ms`. Call from any request path.
    #[instrument(skip(self))]
    pub async fn gc_events_if_due(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let last = self.last_gc_ms.load(Ordering::SeqCst);
        if last != i64::MIN && now - last < self.config.events.gc_min_interval_ms {
            return Ok(());
        }
        self.last_gc_ms.store(now, Ordering::SeqCst);
        let deleted = self
            .store
            .gc_events_by_ttl(self.config.events.ttl_ms, now)
            .await?;
        if deleted > 0 {
            debug!(deleted, "Swept expired events");
        }
        Ok(())
    }

    // ─── Direct invocation ───────────────────────────────────────

    /// Invoke a clog endpoint under an explicit `(run_id, tick_id)`
    /// without going through the state machine. The run must exist; the
    /// tick entity is created if absent; the callee gets a fresh invoker
    /// with its own budget.
    pub async fn call_clog(&self, call: DirectCall) -> Result<Value, ToolError> {
        let run = self
            .store
            .get_run(&call.run_id)
            .await?
            .ok_or_else(|| ToolError::InvalidScope(format!("run '{}' not found", call.run_id)))?;

        let clog = self
            .registry
            .get(&call.clog_id)
            .ok_or_else(|| ToolError::UnknownClog(call.clog_id.clone()))?;

        self.store
            .insert_tick(&call.run_id, &call.tick_id, self.clock.now_ms())
            .await?;

        let factory = InvokerFactory::new(
            self.store.clone(),
            self.registry.clone(),
            self.clock.clone(),
            TickContext {
                session_id: run.session_id,
                run_id: call.run_id,
                tick_id: call.tick_id,
            },
        );
        let tools = factory.invoker_for(&call.clog_id);
        clog.call_endpoint(&call.method, call.payload, &tools).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────
