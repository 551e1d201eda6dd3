//! Monotonic time sources
//!
//! The loop never reads wall time directly; it goes through a `Clock` so
//! tests can move time deterministically. `advance_to` is the blocking
//! primitive behind parking: the system clock sleeps the calling thread,
//! the manual clock jumps its virtual offset.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source the loop schedules against.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block (or jump) until `deadline`. Returns immediately if the
    /// deadline has already passed.
    fn advance_to(&self, deadline: Instant);

    /// Block (or jump) for `dur`.
    fn advance(&self, dur: Duration) {
        let deadline = self.now() + dur;
        self.advance_to(deadline);
    }
}

/// Real monotonic time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn advance_to(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

/// Virtual time for tests: a fixed base instant plus a mutable offset.
///
/// A parked loop advances its clock to the next timer deadline, so a loop
/// driven by a `ManualClock` skips idle gaps instead of sleeping through
/// them. Pool workers run in real time regardless; tests that exercise the
/// pool should use `SystemClock` with small costs.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn advance_to(&self, deadline: Instant) {
        let mut offset = self.offset.lock();
        let target = deadline.saturating_duration_since(self.base);
        if target > *offset {
            *offset = target;
        }
    }
}
