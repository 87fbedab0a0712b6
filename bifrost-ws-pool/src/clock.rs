use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Monotonic millisecond clock, abstracted so pool eviction tests can
/// advance time deterministically instead of sleeping wall-clock time.
pub trait MonotonicClock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug)]
pub struct RealClock {
    epoch: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl MonotonicClock for RealClock {
    fn now_millis(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

#[derive(Debug)]
pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn new(start_millis: i64) -> Self {
        Self(AtomicI64::new(start_millis))
    }

    pub fn advance_millis(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::SeqCst);
    }
}

impl MonotonicClock for FakeClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
