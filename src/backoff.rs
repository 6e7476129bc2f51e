//! Delay schedules between retry attempts.
//!
//! `delay(n)` is the wait before re-attempt `n`; attempt `0` is the initial call and never
//! waits. The exponential schedule doubles from `base` and is capped at `max`, so with the
//! default 100ms / 1s pair the waits run 100ms, 200ms, 400ms, 800ms, 1s, 1s, ...
//!
//! ```rust
//! use std::time::Duration;
//! use reelguard::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(9), Duration::from_secs(1));
//! ```

use std::time::Duration;

/// Upper bound applied when arithmetic would overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("backoff max must be greater than zero")]
    MaxMustBePositive,
    #[error("backoff max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant(Duration),
    Exponential { base: Duration, max: Duration },
}

/// Delay schedule used by [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
}

impl Backoff {
    /// Same delay before every re-attempt.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant(delay.min(MAX_BACKOFF)) }
    }

    /// Doubling delay starting at `base`, never exceeding `max`.
    pub fn exponential(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        Ok(Self { schedule: Schedule::Exponential { base, max: max.min(MAX_BACKOFF) } })
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.schedule {
            Schedule::Constant(delay) => delay,
            Schedule::Exponential { base, max } => {
                let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
                let nanos = base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let capped = nanos.min(max.as_nanos());
                Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            schedule: Schedule::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
        }
    }
}
