//! Clock abstractions used by buckets to track resets and idleness.
//!
//! Buckets need two notions of time: a monotonic one for `expires_at` / idle tracking, and
//! the wall clock for converting the absolute `X-RateLimit-Reset` epoch header into a delay.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    /// Wall-clock time since the Unix epoch.
    fn unix_now(&self) -> Duration;
}

/// Monotonic clock backed by `tokio::time::Instant`.
///
/// Follows tokio's clock, so a paused runtime (`start_paused = true`) advances it
/// deterministically. The wall-clock half is derived from a `SystemTime` captured at
/// construction plus the monotonic offset, which keeps both halves consistent under a
/// paused runtime.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: tokio::time::Instant,
    wall_start: Duration,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        let wall_start = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { start: tokio::time::Instant::now(), wall_start }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn unix_now(&self) -> Duration {
        self.wall_start + self.start.elapsed()
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    unix: Duration,
}

impl ManualClock {
    /// Create a clock at monotonic zero whose wall clock reads `unix`.
    pub fn starting_at(unix: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(ManualState { now: Duration::ZERO, unix })) }
    }

    /// Move both halves of the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.now += by;
        state.unix += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    fn unix_now(&self) -> Duration {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).unix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_halves() {
        let clock = ManualClock::starting_at(Duration::from_secs(1_700_000_000));
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(1500));
        assert_eq!(clock.unix_now(), Duration::from_millis(1_700_000_001_500));
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_paused_runtime() {
        let clock = MonotonicClock::default();
        let wall = clock.unix_now();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(clock.now(), Duration::from_secs(3));
        assert_eq!(clock.unix_now(), wall + Duration::from_secs(3));
    }
}
