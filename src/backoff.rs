//! Retry backoff for batch delivery.
//!
//! Attempt semantics: attempt index `0` is the initial send (no delay); the wait before retry `n`
//! is `base * multiplier^(n-1)`, capped at `max`. Delays are non-decreasing in `attempt` as long
//! as `multiplier >= 1.0`, which the constructor enforces.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use logrelay::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(0)); // initial send
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
    InvalidMultiplier(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::InvalidMultiplier(m) => {
                write!(f, "multiplier must be a finite value >= 1.0, got {}", m)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Exponential backoff with a configurable growth factor and cap.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    /// Doubling backoff starting at `base`, capped only by [`MAX_BACKOFF`].
    pub fn exponential(base: Duration) -> Self {
        Self { base, multiplier: 2.0, max: MAX_BACKOFF }
    }

    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { base: delay, multiplier: 1.0, max: MAX_BACKOFF }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        self.multiplier = multiplier;
        Ok(self)
    }

    /// Cap every computed delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = max.min(MAX_BACKOFF);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the given attempt (0 = initial send, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.multiplier.powi(exponent);
        let nanos = self.base.as_nanos() as f64 * factor;
        let cap = self.max.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }
}
