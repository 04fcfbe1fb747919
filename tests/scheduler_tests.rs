//! End-to-end scheduler scenarios: happy path, retry exhaustion, signal
//! delivery around backoff, continue chains, concurrent instances, and
//! stale-lock stealing.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use ocean::{
    AdvanceContext, Clock, Clog, CreateRun, EventFilter, EventScopeKind, Ocean, OceanConfig,
    ReadPlan, RunStatus, TickOutcome, WriteOp,
};

// ─── Helpers ────────────────────────────────────────────────────

/// A clog that replays a scripted outcome queue and records what the
/// scheduler handed it.
struct ScriptedClog {
    id: String,
    outcomes: Mutex<VecDeque<TickOutcome>>,
    inputs: Mutex<Vec<Option<Value>>>,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedClog {
    fn new(id: &str, outcomes: Vec<TickOutcome>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            outcomes: Mutex::new(outcomes.into()),
            inputs: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn seen_inputs(&self) -> Vec<Option<Value>> {
        self.inputs.lock().unwrap().clone()
    }

    fn seen_attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clog for ScriptedClog {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_advance_handler(&self) -> bool {
        true
    }

    async fn on_advance(
        &self,
        input: Option<Value>,
        cx: AdvanceContext<'_>,
    ) -> Result<TickOutcome> {
        self.inputs.lock().unwrap().push(input);
        self.attempts.lock().unwrap().push(cx.attempt);
        let next = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TickOutcome::Ok);
        Ok(next)
    }
}

async fn ocean_with(clock: Clock, clog: Arc<dyn Clog>) -> Ocean {
    let mut ocean = Ocean::open_memory(OceanConfig::default())
        .await
        .unwrap()
        .with_clock(clock);
    ocean.register_clog(clog).unwrap();
    ocean
}

// ─── Scenario 1: single message, happy path ─────────────────────

/// Reads its run row, emits one event, writes the run row back, returns ok.
struct ChatClog;

#[async_trait]
impl Clog for ChatClog {
    fn id(&self) -> &str {
        "chat"
    }

    fn has_advance_handler(&self) -> bool {
        true
    }

    async fn on_advance(
        &self,
        input: Option<Value>,
        cx: AdvanceContext<'_>,
    ) -> Result<TickOutcome> {
        let run_id = cx.tools.context().run_id.clone();
        cx.tools
            .read_scoped(vec![ReadPlan::Run { run_id: run_id.clone() }])
            .await?;
        cx.tools
            .emit(EventScopeKind::Run, "message", json!({ "echo": input }))
            .await?;
        cx.tools
            .write_scoped(vec![WriteOp::RunSet {
                run_id,
                value: json!({ "last": input }),
            }])
            .await?;
        Ok(TickOutcome::Ok)
    }
}

#[tokio::test]
async fn test_single_message_happy_path() -> Result<()> {
    let clock = Clock::manual(1_000);
    let ocean = ocean_with(clock, Arc::new(ChatClog)).await;

    let run_id = ocean
        .create_run(CreateRun::new("s1", "chat").with_input(json!({"text": "hi"})))
        .await?;

    let report = ocean.advance().await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(report.results[0].run_id, run_id);
    assert_eq!(report.results[0].outcome, "ok");

    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Idle);
    assert_eq!(run.attempt, 0);
    assert!(run.last_error.is_none());
    let raw = ocean.store().get_run(&run_id).await?.unwrap();
    assert!(raw.pending_input.is_none());
    assert!(raw.locked_by.is_none());

    let events = ocean
        .read_events(EventFilter::Run(run_id.clone()), None, None)
        .await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[0].event_type, "message");
    assert_eq!(events[0].payload, json!({"echo": {"text": "hi"}}));

    // The run-row write landed.
    let stored = ocean.store().run_get("chat", &run_id).await?.unwrap();
    assert_eq!(stored.value, json!({"last": {"text": "hi"}}));

    // Nothing left to do.
    assert_eq!(ocean.advance().await?.advanced, 0);
    Ok(())
}

// ─── Scenario 2: retry exhaustion ───────────────────────────────

#[tokio::test]
async fn test_retry_exhaustion_is_terminal() -> Result<()> {
    let clock = Clock::manual(10_000);
    let clog = ScriptedClog::new(
        "flaky",
        vec![
            TickOutcome::Retry { error: "boom".into() },
            TickOutcome::Retry { error: "boom".into() },
        ],
    );
    let ocean = ocean_with(clock.clone(), clog.clone()).await;

    let run_id = ocean
        .create_run(
            CreateRun::new("s1", "flaky")
                .with_input(json!({"job": 1}))
                .with_max_attempts(2),
        )
        .await?;

    let report = ocean.advance().await?;
    assert_eq!(report.results[0].outcome, "retry");
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.attempt, 1);
    assert_eq!(run.wake_at, Some(12_000));
    assert_eq!(run.last_error.as_deref(), Some("boom"));
    // The consumed input was restored for the next attempt.
    let raw = ocean.store().get_run(&run_id).await?.unwrap();
    assert_eq!(raw.pending_input, Some(json!({"job": 1})));

    // Not yet eligible.
    assert_eq!(ocean.advance().await?.advanced, 0);

    clock.advance_ms(2_000);
    let report = ocean.advance().await?;
    assert_eq!(report.advanced, 1);
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.attempt, 2);
    assert_eq!(run.last_error.as_deref(), Some("boom"));

    // The retried attempt saw the original input and incremented attempt.
    assert_eq!(
        clog.seen_inputs(),
        vec![Some(json!({"job": 1})), Some(json!({"job": 1}))]
    );
    assert_eq!(clog.seen_attempts(), vec![0, 1]);

    // Terminal: signal and advance are no-ops.
    ocean.signal(&run_id, Some(json!("poke"))).await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(ocean.advance().await?.advanced, 0);
    Ok(())
}

// ─── Scenario 3: signal interrupts backoff ──────────────────────

#[tokio::test]
async fn test_signal_interrupts_backoff() -> Result<()> {
    let clock = Clock::manual(10_000);
    let clog = ScriptedClog::new(
        "flaky",
        vec![
            TickOutcome::Retry { error: "boom".into() },
            TickOutcome::Ok,
        ],
    );
    let ocean = ocean_with(clock.clone(), clog.clone()).await;

    let run_id = ocean
        .create_run(
            CreateRun::new("s1", "flaky")
                .with_input(json!({"text": "go"}))
                .with_max_attempts(2),
        )
        .await?;

    ocean.advance().await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);

    // A signal before wake_at re-enqueues immediately with the new input.
    ocean.signal(&run_id, Some(json!({"text": "stop"}))).await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.attempt, 1);
    assert!(run.wake_at.is_none());
    let raw = ocean.store().get_run(&run_id).await?.unwrap();
    assert_eq!(raw.pending_input, Some(json!({"text": "stop"})));

    // No clock advance needed: the run is pending now.
    let report = ocean.advance().await?;
    assert_eq!(report.results[0].outcome, "ok");
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Idle);
    assert_eq!(run.attempt, 0);

    assert_eq!(
        clog.seen_inputs(),
        vec![Some(json!({"text": "go"})), Some(json!({"text": "stop"}))]
    );
    assert_eq!(clog.seen_attempts(), vec![0, 1]);
    Ok(())
}

// ─── Scenario 4: continue chain bounded by drain limit ──────────

#[tokio::test]
async fn test_continue_chain_bounded_by_drain_limit() -> Result<()> {
    let clock = Clock::manual(0);
    let clog = ScriptedClog::new(
        "stepper",
        vec![
            TickOutcome::Continue { input: Some(json!({"step": 1})) },
            TickOutcome::Continue { input: Some(json!({"step": 2})) },
            TickOutcome::Continue { input: Some(json!({"step": 3})) },
            TickOutcome::Ok,
        ],
    );
    let ocean = ocean_with(clock, clog.clone()).await;

    let run_id = ocean
        .create_run(CreateRun::new("s1", "stepper").with_input(json!({"step": 0})))
        .await?;

    let reports = ocean.drain(2).await?;
    assert_eq!(reports.len(), 2);

    // The chain stopped mid-flight: still pending, with the next
    // continue-input preserved.
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    let raw = ocean.store().get_run(&run_id).await?.unwrap();
    assert_eq!(raw.pending_input, Some(json!({"step": 2})));
    assert_eq!(
        clog.seen_inputs(),
        vec![Some(json!({"step": 0})), Some(json!({"step": 1}))]
    );

    // Draining the rest finishes the chain.
    let reports = ocean.drain(10).await?;
    assert_eq!(reports.len(), 2);
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Idle);
    Ok(())
}

// ─── Scenario 5: two instances, one run ─────────────────────────

#[tokio::test]
async fn test_two_instances_one_run() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("shared.db");
    let mut config = OceanConfig::default();
    config.persistence.database_path = db_path.to_str().unwrap().to_string();

    let clock = Clock::manual(1_000);

    let mut ocean_a = Ocean::open(config.clone())
        .await?
        .with_clock(clock.clone())
        .with_instance_id("inst_a");
    ocean_a.register_clog(ScriptedClog::new("chat", vec![])).unwrap();

    let mut ocean_b = Ocean::open(config)
        .await?
        .with_clock(clock.clone())
        .with_instance_id("inst_b");
    ocean_b.register_clog(ScriptedClog::new("chat", vec![])).unwrap();

    let run_id = ocean_a
        .create_run(CreateRun::new("s1", "chat").with_input(json!(1)))
        .await?;

    let (ra, rb) = tokio::join!(ocean_a.advance(), ocean_b.advance());
    let (ra, rb) = (ra?, rb?);
    assert_eq!(
        ra.advanced + rb.advanced,
        1,
        "exactly one instance must win the run"
    );

    // After the winner releases, both observe the same final state.
    let via_a = ocean_a.get_run(&run_id).await?.unwrap();
    let via_b = ocean_b.get_run(&run_id).await?.unwrap();
    assert_eq!(via_a.status, RunStatus::Idle);
    assert_eq!(via_b.status, RunStatus::Idle);
    Ok(())
}

// ─── Scenario 6: stale lock steal ───────────────────────────────

#[tokio::test]
async fn test_stale_lock_steal() -> Result<()> {
    let clock = Clock::manual(1_000);
    let clog = ScriptedClog::new("chat", vec![]);
    let ocean = ocean_with(clock.clone(), clog.clone()).await;

    let run_id = ocean
        .create_run(CreateRun::new("s1", "chat").with_input(json!({"text": "hi"})))
        .await?;

    // Instance A acquires and consumes the input, then dies without
    // releasing.
    let snapshot = ocean
        .store()
        .acquire_run("inst_a", 30_000, clock.now_ms())
        .await?
        .unwrap();
    assert_eq!(snapshot.run_id, run_id);
    ocean.store().consume_pending_input(&run_id).await?;

    // While the lock is live the run is reported active and nothing is
    // eligible.
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Active);
    assert_eq!(ocean.advance().await?.advanced, 0);

    // After the lock TTL, the next advance steals the run. The original
    // input is gone (consumed by A); adapters replay idempotently.
    clock.advance_ms(30_000);
    let report = ocean.advance().await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(clog.seen_inputs(), vec![None]);

    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Idle);
    Ok(())
}

// ─── Failure semantics ──────────────────────────────────────────

struct PanickyClog;

#[async_trait]
impl Clog for PanickyClog {
    fn id(&self) -> &str {
        "explosive"
    }

    fn has_advance_handler(&self) -> bool {
        true
    }

    async fn on_advance(
        &self,
        _input: Option<Value>,
        _cx: AdvanceContext<'_>,
    ) -> Result<TickOutcome> {
        anyhow::bail!("handler blew up")
    }
}

#[tokio::test]
async fn test_handler_error_becomes_retry() -> Result<()> {
    let clock = Clock::manual(0);
    let ocean = ocean_with(clock, Arc::new(PanickyClog)).await;

    let run_id = ocean
        .create_run(CreateRun::new("s1", "explosive").with_input(json!(1)))
        .await?;

    let report = ocean.advance().await?;
    assert_eq!(report.results[0].outcome, "retry");
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.attempt, 1);
    assert_eq!(run.last_error.as_deref(), Some("handler blew up"));
    Ok(())
}

#[tokio::test]
async fn test_missing_advance_handler_fails_run() -> Result<()> {
    let clock = Clock::manual(0);
    // No clog registered at all for this owner.
    let ocean = Ocean::open_memory(OceanConfig::default())
        .await?
        .with_clock(clock);

    let run_id = ocean
        .create_run(CreateRun::new("s1", "ghost").with_input(json!(1)))
        .await?;

    let report = ocean.advance().await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(report.results[0].outcome, "failed");
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_deref(), Some("no onAdvance handler"));
    Ok(())
}

#[tokio::test]
async fn test_explicit_failed_bypasses_retry_budget() -> Result<()> {
    let clock = Clock::manual(0);
    let clog = ScriptedClog::new(
        "fatal",
        vec![TickOutcome::Failed { error: "unrecoverable".into() }],
    );
    let ocean = ocean_with(clock, clog).await;

    let run_id = ocean
        .create_run(
            CreateRun::new("s1", "fatal")
                .with_input(json!(1))
                .with_max_attempts(5),
        )
        .await?;

    ocean.advance().await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.attempt, 0);
    assert_eq!(run.last_error.as_deref(), Some("unrecoverable"));
    Ok(())
}

#[tokio::test]
async fn test_wait_outcome_sleeps_until_wake_at() -> Result<()> {
    let clock = Clock::manual(1_000);
    let clog = ScriptedClog::new(
        "sleeper",
        vec![TickOutcome::Wait { wake_at: 5_000 }, TickOutcome::Ok],
    );
    let ocean = ocean_with(clock.clone(), clog).await;

    let run_id = ocean
        .create_run(CreateRun::new("s1", "sleeper").with_input(json!(1)))
        .await?;

    ocean.advance().await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.wake_at, Some(5_000));

    // wake_at == now is eligible (<=, not <).
    clock.set_ms(5_000);
    let report = ocean.advance().await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(
        ocean.get_run(&run_id).await?.unwrap().status,
        RunStatus::Idle
    );
    Ok(())
}

#[tokio::test]
async fn test_signal_during_tick_re_enqueues_after_ok() -> Result<()> {
    // The handler itself signals its own run mid-tick, exercising the
    // release-time signal fold without a second task.
    struct SelfSignaler {
        ocean_store: ocean::persistence::StateStore,
    }

    #[async_trait]
    impl Clog for SelfSignaler {
        fn id(&self) -> &str {
            "selfsignal"
        }

        fn has_advance_handler(&self) -> bool {
            true
        }

        async fn on_advance(
            &self,
            input: Option<Value>,
            cx: AdvanceContext<'_>,
        ) -> Result<TickOutcome> {
            if input == Some(json!("first")) {
                self.ocean_store
                    .signal_run(&cx.tools.context().run_id, &json!("second"), 50)
                    .await?;
            }
            Ok(TickOutcome::Ok)
        }
    }

    let clock = Clock::manual(0);
    let mut ocean = Ocean::open_memory(OceanConfig::default())
        .await?
        .with_clock(clock);
    let store = ocean.store().clone();
    ocean
        .register_clog(Arc::new(SelfSignaler { ocean_store: store }))
        .unwrap();

    let run_id = ocean
        .create_run(CreateRun::new("s1", "selfsignal").with_input(json!("first")))
        .await?;

    // The ok release observes the mid-tick signal and re-enqueues.
    ocean.advance().await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    let raw = ocean.store().get_run(&run_id).await?.unwrap();
    assert_eq!(raw.pending_input, Some(json!("second")));

    // The second advance drains it to idle.
    ocean.advance().await?;
    let run = ocean.get_run(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Idle);
    Ok(())
}
