//! Tick outcomes and their translation into release patches.
//!
//! The outcome table is the whole retry/terminal discipline of the
//! substrate, so it lives here as a pure function over the acquired run
//! snapshot — the scheduler feeds it and the run store applies it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::{ReleasePatch, RunRow, RunStatus};

/// Base delay of the exponential backoff schedule.
pub const BACKOFF_BASE_MS: i64 = 1_000;
/// Upper bound of the backoff schedule.
pub const BACKOFF_CAP_MS: i64 = 60_000;

/// The tagged return of an advance handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Work complete for now; go idle until the next signal.
    Ok,
    /// Terminal success. `output` is accepted for shape parity and not
    /// persisted.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    /// Immediately re-enqueue with the given input.
    Continue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Sleep until `wake_at` (epoch ms) or the next signal.
    Wait {
        #[serde(rename = "wakeAt")]
        wake_at: i64,
    },
    /// Transient failure; back off and re-attempt, up to `max_attempts`.
    Retry { error: String },
    /// Terminal failure, bypassing remaining attempts.
    Failed { error: String },
}

impl TickOutcome {
    /// The status string reported in advance results.
    pub fn status_str(&self) -> &'static str {
        match self {
            TickOutcome::Ok => "ok",
            TickOutcome::Done { .. } => "done",
            TickOutcome::Continue { .. } => "continue",
            TickOutcome::Wait { .. } => "wait",
            TickOutcome::Retry { .. } => "retry",
            TickOutcome::Failed { .. } => "failed",
        }
    }
}

/// `backoff(n) = min(1000 × 2ⁿ, 60_000)` milliseconds: attempt 1 waits
/// 2 s, attempt 2 waits 4 s, …, capped at 60 s.
pub fn backoff_ms(attempt: u32) -> i64 {
    let shift = attempt.min(16);
    BACKOFF_BASE_MS
        .saturating_mul(1i64 << shift)
        .min(BACKOFF_CAP_MS)
}

/// Translate an outcome into the release patch for `run`.
///
/// `consumed_input` is the pending-input snapshot taken at acquire; a
/// retry writes it back so the input survives into the next attempt
/// (unless a newer signal wins inside the release statement itself).
pub(crate) fn release_patch(
    run: &RunRow,
    outcome: &TickOutcome,
    consumed_input: Option<&Value>,
    now_ms: i64,
) -> ReleasePatch {
    match outcome {
        TickOutcome::Ok => ReleasePatch {
            status: RunStatus::Idle,
            attempt: 0,
            wake_at: None,
            last_error: None,
            pending_input: None,
        },
        TickOutcome::Done { .. } => ReleasePatch {
            status: RunStatus::Done,
            attempt: 0,
            wake_at: None,
            last_error: None,
            pending_input: None,
        },
        TickOutcome::Continue { input } => ReleasePatch {
            status: RunStatus::Pending,
            attempt: 0,
            wake_at: None,
            last_error: None,
            pending_input: input.clone(),
        },
        TickOutcome::Wait { wake_at } => ReleasePatch {
            status: RunStatus::Waiting,
            attempt: 0,
            wake_at: Some(*wake_at),
            last_error: None,
            pending_input: None,
        },
        TickOutcome::Retry { error } => {
            let next_attempt = run.attempt + 1;
            if next_attempt >= run.max_attempts {
                ReleasePatch {
                    status: RunStatus::Failed,
                    attempt: next_attempt,
                    wake_at: None,
                    last_error: Some(error.clone()),
                    pending_input: None,
                }
            } else {
                ReleasePatch {
                    status: RunStatus::Waiting,
                    attempt: next_attempt,
                    wake_at: Some(now_ms + backoff_ms(next_attempt)),
                    last_error: Some(error.clone()),
                    pending_input: consumed_input.cloned(),
                }
            }
        }
        TickOutcome::Failed { error } => ReleasePatch {
            status: RunStatus::Failed,
            attempt: run.attempt,
            wake_at: None,
            last_error: Some(error.clone()),
            pending_input: None,
        },
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(attempt: u32, max_attempts: u32) -> RunRow {
        RunRow {
            run_id: "run_1".into(),
            session_id: "s1".into(),
            clog_id: "chat".into(),
            status: RunStatus::Pending,
            state: json!({}),
            locked_by: Some("inst_a".into()),
            lock_expires_at: Some(1_000),
            attempt,
            max_attempts,
            wake_at: None,
            pending_input: None,
            last_error: None,
            created_ts: 0,
            updated_ts: 0,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_ms(1), 2_000);
        assert_eq!(backoff_ms(2), 4_000);
        assert_eq!(backoff_ms(3), 8_000);
        assert_eq!(backoff_ms(5), 32_000);
        assert_eq!(backoff_ms(6), 60_000);
        assert_eq!(backoff_ms(40), 60_000);
    }

    #[test]
    fn test_ok_resets_everything() {
        let patch = release_patch(&run(2, 3), &TickOutcome::Ok, None, 0);
        assert_eq!(patch.status, RunStatus::Idle);
        assert_eq!(patch.attempt, 0);
        assert!(patch.wake_at.is_none());
        assert!(patch.last_error.is_none());
        assert!(patch.pending_input.is_none());
    }

    #[test]
    fn test_continue_re_enqueues_with_input() {
        let patch = release_patch(
            &run(1, 3),
            &TickOutcome::Continue { input: Some(json!({"step": 2})) },
            None,
            0,
        );
        assert_eq!(patch.status, RunStatus::Pending);
        assert_eq!(patch.attempt, 0);
        assert_eq!(patch.pending_input, Some(json!({"step": 2})));
    }

    #[test]
    fn test_wait_carries_wake_at() {
        let patch = release_patch(&run(0, 3), &TickOutcome::Wait { wake_at: 9_000 }, None, 0);
        assert_eq!(patch.status, RunStatus::Waiting);
        assert_eq!(patch.wake_at, Some(9_000));
    }

    #[test]
    fn test_retry_backs_off_and_restores_input() {
        let input = json!({"text": "hi"});
        let patch = release_patch(
            &run(0, 3),
            &TickOutcome::Retry { error: "boom".into() },
            Some(&input),
            10_000,
        );
        assert_eq!(patch.status, RunStatus::Waiting);
        assert_eq!(patch.attempt, 1);
        assert_eq!(patch.wake_at, Some(12_000));
        assert_eq!(patch.last_error.as_deref(), Some("boom"));
        assert_eq!(patch.pending_input, Some(input));
    }

    #[test]
    fn test_retry_exhaustion_is_terminal() {
        let patch = release_patch(
            &run(1, 2),
            &TickOutcome::Retry { error: "boom".into() },
            Some(&json!(1)),
            0,
        );
        assert_eq!(patch.status, RunStatus::Failed);
        assert_eq!(patch.attempt, 2);
        assert!(patch.wake_at.is_none());
        assert!(patch.pending_input.is_none());
    }

    #[test]
    fn test_single_attempt_fails_immediately() {
        let patch = release_patch(
            &run(0, 1),
            &TickOutcome::Retry { error: "boom".into() },
            None,
            0,
        );
        assert_eq!(patch.status, RunStatus::Failed);
        assert_eq!(patch.attempt, 1);
    }

    #[test]
    fn test_failed_bypasses_remaining_attempts() {
        let patch = release_patch(
            &run(0, 5),
            &TickOutcome::Failed { error: "fatal".into() },
            Some(&json!(1)),
            0,
        );
        assert_eq!(patch.status, RunStatus::Failed);
        // Attempt is left unchanged by an explicit failure.
        assert_eq!(patch.attempt, 0);
        assert!(patch.pending_input.is_none());
    }

    #[test]
    fn test_outcome_wire_shape() {
        let outcome: TickOutcome =
            serde_json::from_value(json!({"status": "wait", "wakeAt": 123})).unwrap();
        assert_eq!(outcome, TickOutcome::Wait { wake_at: 123 });

        let v = serde_json::to_value(TickOutcome::Retry { error: "x".into() }).unwrap();
        assert_eq!(v, json!({"status": "retry", "error": "x"}));
        assert_eq!(serde_json::to_value(TickOutcome::Ok).unwrap(), json!({"status": "ok"}));
    }
}
