//! Monotonic clock implementations.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use contracts::MonotonicClock;
use tokio::time::Instant;

/// Elapsed time since construction, from the runtime's monotonic clock.
///
/// Built on `tokio::time::Instant`, so a paused test runtime controls it too.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_nanos: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_nanos)),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.now.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, nanos: i64) -> i64 {
        self.now.fetch_add(nanos, Ordering::SeqCst) + nanos
    }
}

impl MonotonicClock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A device clock that runs offset from (and optionally drifting against) a base clock.
#[derive(Debug, Clone)]
pub struct SkewedClock<C> {
    base: C,
    offset_nanos: i64,
    drift_ppm: f64,
}

impl<C: MonotonicClock> SkewedClock<C> {
    pub fn new(base: C, offset_nanos: i64, drift_ppm: f64) -> Self {
        Self {
            base,
            offset_nanos,
            drift_ppm,
        }
    }

    pub fn offset_nanos(&self) -> i64 {
        self.offset_nanos
    }
}

impl<C: MonotonicClock> MonotonicClock for SkewedClock<C> {
    fn now_nanos(&self) -> i64 {
        let base = self.base.now_nanos();
        let drift = (base as f64 * self.drift_ppm / 1e6) as i64;
        base + self.offset_nanos + drift
    }
}
