//! Clock abstractions used by rate limiters, circuit breakers and other time-based primitives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock abstraction so timing can be faked in tests.
///
/// Readings are relative to an arbitrary epoch chosen by the implementation; only differences
/// between readings from the same clock are meaningful.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_nanos(&self) -> u64;

    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts; use a wall-clock-based implementation if you
/// need timing that survives restarts.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Wall clock reading nanoseconds since the Unix epoch.
///
/// Used where readings from several processes must be comparable, such as timestamps written
/// to a shared counter store. Not monotonic: NTP adjustments can move it backwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_nanos(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(duration_nanos)
            .unwrap_or(0)
    }
}

/// Manually driven clock. Clones share the same reading.
///
/// Unlike a real monotonic clock it can be moved backwards, which lets tests check that
/// limiters never hand out credit when time appears to run in reverse.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at an explicit reading.
    pub fn starting_at(at: Duration) -> Self {
        let clock = Self::new();
        clock.set(at);
        clock
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_nanos(by), Ordering::SeqCst);
    }

    /// Move the reading backwards, saturating at zero.
    pub fn rewind(&self, by: Duration) {
        let by = duration_nanos(by);
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(cur.saturating_sub(by)));
    }

    pub fn set(&self, at: Duration) {
        self.now.store(duration_nanos(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Saturating conversion used wherever durations are stored as `u64` nanoseconds.
pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_rewinds() {
        let clock = ManualClock::starting_at(Duration::from_secs(10));
        assert_eq!(clock.now_millis(), 10_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 10_250);

        clock.rewind(Duration::from_secs(1));
        assert_eq!(clock.now_millis(), 9_250);

        clock.rewind(Duration::from_secs(3600));
        assert_eq!(clock.now_nanos(), 0);
    }

    #[test]
    fn manual_clock_clones_share_reading() {
        let a = ManualClock::new();
        let b = a.clone();
        a.advance(Duration::from_secs(1));
        assert_eq!(b.now_millis(), 1_000);
    }

    #[test]
    fn wall_clock_is_past_the_epoch() {
        // 2020-01-01T00:00:00Z
        assert!(WallClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::default();
        let first = clock.now_nanos();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_nanos() > first);
    }
}
