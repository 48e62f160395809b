//! Wall-clock source for event timestamps and query windows.

use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Block for `duration` (used to pace writes).
    fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Deterministic clock for tests: every read returns the current value and
/// then advances it by `step` milliseconds; `pause` advances without sleeping.
#[derive(Debug)]
pub struct SteppingClock {
    next: AtomicI64,
    step: i64,
}

impl SteppingClock {
    pub fn new(start_millis: i64, step: i64) -> Self {
        Self {
            next: AtomicI64::new(start_millis),
            step,
        }
    }

    /// A clock frozen at `millis`.
    pub fn fixed(millis: i64) -> Self {
        Self::new(millis, 0)
    }

    /// The value the next read will return.
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Clock for SteppingClock {
    fn now_millis(&self) -> i64 {
        self.next.fetch_add(self.step, Ordering::SeqCst)
    }

    fn pause(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.next.fetch_add(millis, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepping_clock() {
        let clock = SteppingClock::new(1_000, 2);
        assert_eq!(clock.now_millis(), 1_000);
        assert_eq!(clock.now_millis(), 1_002);
        clock.pause(Duration::from_millis(10));
        assert_eq!(clock.peek(), 1_014);
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        let now = SystemClock.now_millis();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800_000);
    }
}
