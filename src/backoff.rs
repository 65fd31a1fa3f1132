//! Backoff schedule for the retry executor.
//!
//! The delay after failed attempt `n` (1-based) is `min(initial * multiplier^(n-1), max)`.
//! Attempt index `0` represents the initial call and never waits. Delays saturate at
//! [`MAX_BACKOFF`] to avoid overflow.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use floodgate::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2), 2.0).unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use crate::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Multiplicative backoff bounded by a ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Validated constructor. `multiplier` must be finite and `>= 1.0`; `max` must not be
    /// below `initial`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(multiplier));
        }
        if max < initial {
            return Err(ConfigError::InvalidInterval { initial, max });
        }
        Ok(Self { initial, max: max.min(MAX_BACKOFF), multiplier })
    }

    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        let delay = delay.min(MAX_BACKOFF);
        Self { initial: delay, max: delay, multiplier: 1.0 }
    }

    /// Doubling delay starting at `initial`, bounded only by [`MAX_BACKOFF`].
    pub fn exponential(initial: Duration) -> Self {
        Self { initial: initial.min(MAX_BACKOFF), max: MAX_BACKOFF, multiplier: 2.0 }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Calculate the delay for a given attempt number (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        let ceiling = self.max.as_nanos() as f64;
        if !scaled.is_finite() || scaled >= ceiling {
            return self.max;
        }
        Duration::from_nanos(scaled as u64)
    }
}

impl Default for Backoff {
    /// One second doubling up to thirty seconds.
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(30), multiplier: 2.0 }
    }
}
