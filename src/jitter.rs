//! Jitter strategies to prevent thundering herd
//!
//! When to use which strategy:
//! - `None`: deterministic retries for tests or tightly controlled workflows.
//! - `Additive`: adds a uniform `[0, max]` offset on top of the computed delay. This is what the
//!   retry presets use (`max = 100ms`), so synchronized callers spread out without ever waiting
//!   less than the exponential floor.
//! - `Full`: uniform in `[0, delay]`, for callers that prefer spreading over a floor.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Default upper bound of the additive jitter.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Add a uniform random offset in `[0, max]`.
    Additive { max: Duration },
    /// Full jitter: random between 0 and delay
    Full,
}

impl Jitter {
    /// Additive jitter of up to 100ms.
    pub fn additive() -> Self {
        Jitter::Additive { max: DEFAULT_JITTER }
    }

    /// Create a full jitter strategy
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Additive { max } => {
                let upper = as_millis_saturated(*max);
                if upper == 0 {
                    return delay;
                }
                delay.saturating_add(Duration::from_millis(rng.random_range(0..=upper)))
            }
            Jitter::Full => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::additive()
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
