//! The per-tick, per-adapter read ledger.
//!
//! Reads mint capabilities, writes consume them: a write may only target
//! a row identity that appears in the ledger of reads performed earlier
//! in the same tick. Membership is never revoked within a tick, and the
//! ledger never crosses an adapter boundary — peer calls start empty.

use std::collections::HashSet;

/// Record of the row identities an adapter has read this tick.
#[derive(Debug, Default)]
pub struct ReadLedger {
    global: bool,
    sessions: HashSet<String>,
    runs: HashSet<String>,
    tick_rows: HashSet<(String, String, String)>,
}

impl ReadLedger {
    pub fn record_global(&mut self) {
        self.global = true;
    }

    pub fn record_session(&mut self, session_id: &str) {
        self.sessions.insert(session_id.to_string());
    }

    pub fn record_run(&mut self, run_id: &str) {
        self.runs.insert(run_id.to_string());
    }

    pub fn record_tick_row(&mut self, run_id: &str, tick_id: &str, row_id: &str) {
        self.tick_rows
            .insert((run_id.to_string(), tick_id.to_string(), row_id.to_string()));
    }

    pub fn allows_global(&self) -> bool {
        self.global
    }

    pub fn allows_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn allows_run(&self, run_id: &str) -> bool {
        self.runs.contains(run_id)
    }

    pub fn allows_tick_row(&self, run_id: &str, tick_id: &str, row_id: &str) -> bool {
        self.tick_rows
            .contains(&(run_id.to_string(), tick_id.to_string(), row_id.to_string()))
    }

    /// Any row read of the tick unlocks the tick-entity delete.
    pub fn allows_any_row_of_tick(&self, run_id: &str, tick_id: &str) -> bool {
        self.tick_rows
            .iter()
            .any(|(r, t, _)| r == run_id && t == tick_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ledger_allows_nothing() {
        let ledger = ReadLedger::default();
        assert!(!ledger.allows_global());
        assert!(!ledger.allows_session("s1"));
        assert!(!ledger.allows_run("run_1"));
        assert!(!ledger.allows_tick_row("run_1", "tick_1", "r1"));
        assert!(!ledger.allows_any_row_of_tick("run_1", "tick_1"));
    }

    #[test]
    fn test_reads_mint_exactly_their_identity() {
        let mut ledger = ReadLedger::default();
        ledger.record_session("s1");
        ledger.record_tick_row("run_1", "tick_1", "r1");

        assert!(ledger.allows_session("s1"));
        assert!(!ledger.allows_session("s2"));
        assert!(ledger.allows_tick_row("run_1", "tick_1", "r1"));
        assert!(!ledger.allows_tick_row("run_1", "tick_1", "r2"));
        assert!(ledger.allows_any_row_of_tick("run_1", "tick_1"));
        assert!(!ledger.allows_any_row_of_tick("run_1", "tick_2"));
    }
}
