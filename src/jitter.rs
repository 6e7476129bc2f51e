//! Randomisation of retry delays.
//!
//! Callers that failed together would otherwise retry together. `Jitter::Factor(f)` spreads
//! each delay uniformly over `[delay * (1 - f), delay * (1 + f)]`.

use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("jitter factor must be within [0, 1], got {0}")]
pub struct InvalidJitter(pub f64);

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    /// Use the exact backoff delay
    #[default]
    None,
    /// Symmetric spread around the delay; the factor lies in `[0, 1]`.
    Factor(f64),
}

impl Jitter {
    pub fn factor(factor: f64) -> Result<Self, InvalidJitter> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(InvalidJitter(factor));
        }
        Ok(Jitter::Factor(factor))
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Factor(factor) => {
                let factor = factor.clamp(0.0, 1.0);
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                if millis == 0 || factor == 0.0 {
                    return delay;
                }
                let spread = (millis as f64 * factor) as u64;
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }
}
