//! Jitter applied to retry delays so many pipelines recovering at once do not retry in lockstep.
//!
//! - `None`: deterministic delays, for tests or tightly controlled workflows.
//! - `Proportional`: multiply the delay by a uniform factor in `[1 - spread, 1 + spread]`.
//!   The default spread of `0.2` gives the `[0.8, 1.2]` band used by delivery retries.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Default proportional spread (±20%).
pub const DEFAULT_SPREAD: f64 = 0.2;

/// Invalid jitter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JitterError {
    spread: f64,
}

impl fmt::Display for JitterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jitter spread must be within [0.0, 1.0), got {}", self.spread)
    }
}

impl std::error::Error for JitterError {}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Uniform factor in `[1 - spread, 1 + spread]`
    Proportional { spread: f64 },
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Proportional { spread: DEFAULT_SPREAD }
    }
}

impl Jitter {
    pub fn proportional(spread: f64) -> Result<Self, JitterError> {
        if !(0.0..1.0).contains(&spread) {
            return Err(JitterError { spread });
        }
        if spread == 0.0 {
            return Ok(Jitter::None);
        }
        Ok(Jitter::Proportional { spread })
    }

    /// Largest factor this jitter can apply.
    pub fn upper_factor(&self) -> f64 {
        match self {
            Jitter::None => 1.0,
            Jitter::Proportional { spread } => 1.0 + spread,
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional { spread } => {
                if delay.is_zero() {
                    return delay;
                }
                let factor = rng.random_range((1.0 - spread)..=(1.0 + spread));
                delay.mul_f64(factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn proportional_jitter_stays_in_band() {
        let jitter = Jitter::default();
        let delay = Duration::from_secs(1);

        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(800));
            assert!(jittered <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn deterministic_rng_gives_repeatable_delays() {
        let jitter = Jitter::proportional(0.2).unwrap();
        let delay = Duration::from_millis(1000);

        let a = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(42));
        let b = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::default().apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn constructor_validates_spread() {
        assert_eq!(Jitter::proportional(0.0).unwrap(), Jitter::None);
        assert!(Jitter::proportional(1.0).is_err());
        assert!(Jitter::proportional(-0.1).is_err());
        assert!(Jitter::proportional(f64::NAN).is_err());
        assert_eq!(Jitter::default().upper_factor(), 1.2);
    }
}
