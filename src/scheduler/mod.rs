//! The tick scheduler: one unit of work per `advance()` call.
//!
//! Acquire one eligible run, begin a tick, dispatch the owner's advance
//! handler, classify the returned outcome or error, and release
//! atomically — folding in any signal that arrived while the handler
//! ran. The database is the only coordination point; the scheduler holds
//! no state between calls, which is what makes parallel instances safe.

pub mod outcome;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::{new_id, Clock};
use crate::clog::{AdvanceContext, ClogRegistry};
use crate::persistence::{ReleasePatch, RunStatus, StateStore};
use crate::tools::{InvokerFactory, TickContext};

use outcome::{release_patch, TickOutcome};

/// Result of one `advance()` call. At most one run is dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceReport {
    pub advanced: u32,
    pub results: Vec<AdvanceResult>,
}

impl AdvanceReport {
    pub(crate) fn empty() -> Self {
        Self {
            advanced: 0,
            results: Vec::new(),
        }
    }
}

/// Per-run entry of an advance report.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceResult {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub outcome: String,
}

/// Advance at most one run. Returns `advanced: 0` when nothing is
/// eligible.
#[instrument(skip_all, fields(instance_id = %instance_id))]
pub(crate) async fn advance_once(
    store: &StateStore,
    registry: &ClogRegistry,
    clock: &Clock,
    instance_id: &str,
    lock_ms: i64,
) -> Result<AdvanceReport> {
    let now = clock.now_ms();
    let Some(run) = store.acquire_run(instance_id, lock_ms, now).await? else {
        debug!("No eligible run");
        return Ok(AdvanceReport::empty());
    };

    // Snapshot and consume the input so a signal arriving during the
    // handler is observable as a fresh non-NULL value at release time.
    let consumed_input = run.pending_input.clone();
    if consumed_input.is_some() {
        store.consume_pending_input(&run.run_id).await?;
    }

    let clog = registry.get(&run.clog_id);
    let handler = match clog {
        Some(clog) if clog.has_advance_handler() => clog,
        _ => {
            warn!(run_id = %run.run_id, clog_id = %run.clog_id, "No advance handler for run owner");
            store
                .release_run(
                    &run.run_id,
                    &ReleasePatch {
                        status: RunStatus::Failed,
                        attempt: run.attempt,
                        wake_at: None,
                        last_error: Some("no onAdvance handler".to_string()),
                        pending_input: None,
                    },
                    clock.now_ms(),
                )
                .await?;
            return Ok(AdvanceReport {
                advanced: 1,
                results: vec![AdvanceResult {
                    run_id: run.run_id.clone(),
                    outcome: "failed".to_string(),
                }],
            });
        }
    };

    let tick_id = new_id("tick");
    store.insert_tick(&run.run_id, &tick_id, now).await?;

    let factory = InvokerFactory::new(
        store.clone(),
        registry.clone(),
        clock.clone(),
        TickContext {
            session_id: run.session_id.clone(),
            run_id: run.run_id.clone(),
            tick_id: tick_id.clone(),
        },
    );
    let tools = factory.invoker_for(&run.clog_id);

    info!(run_id = %run.run_id, tick_id = %tick_id, clog_id = %run.clog_id, attempt = run.attempt, "Dispatching tick");

    let outcome = match handler
        .on_advance(
            consumed_input.clone(),
            AdvanceContext {
                tools: &tools,
                attempt: run.attempt,
            },
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(run_id = %run.run_id, error = %e, "Advance handler error, converting to retry");
            TickOutcome::Retry {
                error: e.to_string(),
            }
        }
    };

    let patch = release_patch(&run, &outcome, consumed_input.as_ref(), clock.now_ms());
    store.release_run(&run.run_id, &patch, clock.now_ms()).await?;

    debug!(run_id = %run.run_id, outcome = outcome.status_str(), "Tick released");

    Ok(AdvanceReport {
        advanced: 1,
        results: vec![AdvanceResult {
            run_id: run.run_id,
            outcome: outcome.status_str().to_string(),
        }],
    })
}
