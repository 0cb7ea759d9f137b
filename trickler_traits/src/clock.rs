//! Millisecond clock abstraction.
//!
//! Every consumer of time in this workspace works in whole milliseconds
//! (sample ticks, pacing delays, PD dt), so the trait surface is a single
//! monotonic `now_ms` plus a `sleep_ms` that implementations may simulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock {
    /// Milliseconds since an arbitrary epoch fixed at construction.
    fn now_ms(&self) -> u64;

    /// Sleep for `ms` milliseconds. Simulated clocks advance instead.
    fn sleep_ms(&self, ms: u64);
}

/// Real-time clock backed by `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let ms = self.epoch.elapsed().as_millis();
        ms.min(u128::from(u64::MAX)) as u64
    }

    fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

/// Deterministic clock for tests: time only moves when `advance` is called
/// or when code under test sleeps.
///
/// Not `cfg(test)`-gated because integration tests in dependent crates
/// (and the simulation backends) need it.
#[derive(Debug, Clone, Default)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_on_sleep() {
        let clk = TestClock::new();
        assert_eq!(clk.now_ms(), 0);
        clk.sleep_ms(250);
        clk.advance(50);
        assert_eq!(clk.now_ms(), 300);
    }

    #[test]
    fn monotonic_clock_is_monotonic() {
        let clk = MonotonicClock::new();
        let a = clk.now_ms();
        let b = clk.now_ms();
        assert!(b >= a);
    }
}
