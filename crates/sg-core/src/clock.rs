//! Time sources for leases, gate deadlines and escalation SLAs.
//!
//! Expiry is always decided against [`Clock::now`], a monotonic instant read
//! inside the transaction that checks it. Wall-clock time is only used for
//! audit timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Monotonic instant used for every expiry decision.
    fn now(&self) -> Instant;
    /// Wall-clock time for records and manifests.
    fn wall(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to. Used by tests to drive lease expiry
/// and SLA breaches without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move both the monotonic and the wall clock forward.
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = self.offset_ms.load(Ordering::SeqCst) as i64;
        self.wall_origin + chrono::Duration::milliseconds(offset)
    }
}

// ---------------------------------------------------------------------------
// SequenceCounter
// ---------------------------------------------------------------------------

/// Run-local monotonic sequence shared by approval and conflict records.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Resume after `last`, the highest sequence number already committed.
    pub fn starting_after(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    /// Allocate the next sequence number (first call returns 1).
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
