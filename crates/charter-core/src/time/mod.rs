//! Time sourcing for the ledger.
//!
//! Timestamps are informational. Ordering comes from sequence numbers
//! alone. Two clocks stamp every event: the writer's clock fixes
//! `local_timestamp_ns` when a draft is built, and the store's clock fixes
//! `authority_timestamp_ns` at commit. Both are injected [`Clock`]s, so tests
//! and replays can drive time deterministically with [`ManualClock`].
//!
//! [`DriftMonitor`] compares the two and reports discrepancies without ever
//! affecting the write.

mod drift;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use drift::{
    DEFAULT_DRIFT_THRESHOLD, DriftMonitor, DriftObservation, DriftSink, DriftSinkError,
    MemoryDriftSink,
};

/// Source of wall-clock time in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in nanoseconds since the Unix epoch.
    fn now_ns(&self) -> u64;
}

/// The host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    // Nanoseconds since the epoch fit in u64 until the year 2554. The
    // ledger stores them as i64, which holds until 2262.
    #[allow(clippy::cast_possible_truncation)]
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start_ns`.
    #[must_use]
    pub const fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Jumps to `now_ns`.
    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    /// Moves the clock forward by `by`, saturating at `u64::MAX`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        let by = by.as_nanos().min(u128::from(u64::MAX)) as u64;
        let _ = self
            .now_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by))
            });
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
