//! Time source and identifier generation.
//!
//! Everything in Ocean that consults the wall clock — lock expiry, backoff
//! deadlines, wake-at eligibility, event timestamps, the TTL sweep — goes
//! through a single [`Clock`] handle so tests can replace time atomically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cloneable handle over the system wall clock or a manually driven test
/// clock, reporting epoch milliseconds.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

enum ClockInner {
    System,
    Manual(AtomicI64),
}

impl Clock {
    /// The real wall clock.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(ClockInner::System),
        }
    }

    /// A manual clock starting at `start_ms`. Shared by cloning.
    pub fn manual(start_ms: i64) -> Self {
        Self {
            inner: Arc::new(ClockInner::Manual(AtomicI64::new(start_ms))),
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        match &*self.inner {
            ClockInner::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            ClockInner::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Advance a manual clock by `delta_ms`.
    ///
    /// # Panics
    ///
    /// Panics when called on the system clock.
    pub fn advance_ms(&self, delta_ms: i64) {
        match &*self.inner {
            ClockInner::System => panic!("cannot advance the system clock"),
            ClockInner::Manual(ms) => {
                ms.fetch_add(delta_ms, Ordering::SeqCst);
            }
        }
    }

    /// Set a manual clock to an absolute time.
    ///
    /// # Panics
    ///
    /// Panics when called on the system clock.
    pub fn set_ms(&self, now_ms: i64) {
        match &*self.inner {
            ClockInner::System => panic!("cannot set the system clock"),
            ClockInner::Manual(ms) => ms.store(now_ms, Ordering::SeqCst),
        }
    }

    /// True for clocks created with [`Clock::manual`].
    pub fn is_manual(&self) -> bool {
        matches!(&*self.inner, ClockInner::Manual(_))
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner {
            ClockInner::System => write!(f, "Clock::System"),
            ClockInner::Manual(ms) => {
                write!(f, "Clock::Manual({})", ms.load(Ordering::SeqCst))
            }
        }
    }
}

/// Generate a prefixed random identifier, e.g. `run_9f2c…` or `tick_04ab…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = Clock::manual(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(2_500);
        assert_eq!(clock.now_ms(), 3_500);
        clock.set_ms(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_manual_clock_shared_across_clones() {
        let clock = Clock::manual(0);
        let other = clock.clone();
        clock.advance_ms(42);
        assert_eq!(other.now_ms(), 42);
    }

    #[test]
    fn test_system_clock_is_sane() {
        let clock = Clock::system();
        // Past 2020-01-01 in epoch ms.
        assert!(clock.now_ms() > 1_577_836_800_000);
        assert!(!clock.is_manual());
    }

    #[test]
    #[should_panic(expected = "cannot advance")]
    fn test_system_clock_rejects_advance() {
        Clock::system().advance_ms(1);
    }

    #[test]
    fn test_new_id_prefix_and_uniqueness() {
        let a = new_id("run");
        let b = new_id("run");
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "run_".len() + 32);
    }
}
