//! Generation counters, entity ids, and an injectable clock.
//!
//! `check_session_eligibility` and `Session::is_expired` thread a bare
//! `now_ms: u64`; this module generalizes that into a `Clock` trait so
//! the simulation sweeper and claim deadlines can share one abstraction
//! instead of every call site re-deriving "now" from `SystemTime`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type EntityId = uuid::Uuid;

/// Monotonic optimistic-concurrency version stamped on resource providers,
/// consumers, and the global counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub const INITIAL: Generation = Generation(0);

    pub fn bumped(self) -> Generation {
        Generation(self.0 + 1)
    }

    pub fn matches(self, expected: Generation) -> bool {
        self.0 == expected.0
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source of "now", injectable so tests never depend on wall-clock sleeps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when explicitly advanced.
#[derive(Debug)]
pub struct FakeClock {
    now_ms: AtomicU64,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: AtomicU64::new(start_ms) }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
