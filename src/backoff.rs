//! Backoff strategies for transport-level retries.
//!
//! Provides constant, linear, and exponential strategies with an optional fixed offset and an
//! optional cap. Attempt semantics: `attempt` is the zero-based index of the attempt that just
//! failed, so the first retry waits `delay(0)`.
//!
//! The engine's default pacing for recoverable transport failures and flaky gateway statuses is
//! `1 + 2 * attempt` seconds:
//!
//! ```rust
//! use std::time::Duration;
//! use sluice::Backoff;
//!
//! let backoff = Backoff::linear(Duration::from_secs(2)).with_offset(Duration::from_secs(1));
//! assert_eq!(backoff.delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.delay(1), Duration::from_secs(3));
//! assert_eq!(backoff.delay(3), Duration::from_secs(7));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for Linear or Exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffKind {
    Constant,
    Linear,
    Exponential,
}

/// Delay schedule applied between retries of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
    base: Duration,
    offset: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Same delay after every failure.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant, base: delay, offset: Duration::ZERO, max: None }
    }

    /// `base * attempt`, plus the offset.
    pub fn linear(base: Duration) -> Self {
        Self { kind: BackoffKind::Linear, base, offset: Duration::ZERO, max: None }
    }

    /// `base * 2^attempt`, plus the offset.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential, base, offset: Duration::ZERO, max: None }
    }

    /// Fixed amount added to every computed delay.
    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    /// Set a maximum delay for the backoff (linear or exponential).
    /// Returns an error if called on `Constant`, if `max` is zero, or if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match self.kind {
            BackoffKind::Constant => Err(BackoffError::ConstantDoesNotSupportMax),
            BackoffKind::Linear | BackoffKind::Exponential => {
                if max < self.base {
                    return Err(BackoffError::MaxLessThanBase { base: self.base, max });
                }
                self.max = Some(max);
                Ok(self)
            }
        }
    }

    /// Delay to wait after the attempt with zero-based index `attempt` failed.
    pub fn delay(&self, attempt: usize) -> Duration {
        let attempt_u32 = attempt.min(u32::MAX as usize) as u32;
        let raw = match self.kind {
            BackoffKind::Constant => self.base,
            BackoffKind::Linear => self.base.checked_mul(attempt_u32).unwrap_or(MAX_BACKOFF),
            BackoffKind::Exponential => {
                let multiplier = 2u128.saturating_pow(attempt_u32);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        let capped = self.max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.checked_add(self.offset).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::linear(Duration::from_secs(2)).with_offset(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_one_plus_two_per_attempt() {
        let backoff = Backoff::default();
        for attempt in 0..5 {
            assert_eq!(backoff.delay(attempt), Duration::from_secs(1 + 2 * attempt as u64));
        }
    }

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn cap_applies_before_offset() {
        let backoff = Backoff::linear(Duration::from_secs(10))
            .with_max(Duration::from_secs(25))
            .unwrap()
            .with_offset(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(11));
        assert_eq!(backoff.delay(9), Duration::from_secs(26));
    }

    #[test]
    fn with_max_validation() {
        assert!(matches!(
            Backoff::constant(Duration::from_secs(5)).with_max(Duration::from_secs(1)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        ));
        assert!(matches!(
            Backoff::linear(Duration::from_secs(100)).with_max(Duration::from_secs(50)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        assert!(matches!(
            Backoff::linear(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        ));
    }

    #[test]
    fn huge_attempts_saturate() {
        let exp = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(exp.delay(1_000_000_000), MAX_BACKOFF);
        let linear = Backoff::linear(Duration::from_secs(u64::MAX / 2));
        assert_eq!(linear.delay(1_000_000_000), MAX_BACKOFF);
    }
}
