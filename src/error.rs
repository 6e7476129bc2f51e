//! Error types for resilient calls and rate limiting
use std::fmt;
use std::time::Duration;

/// What went wrong on a single attempt of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// The attempt exceeded its per-attempt bound.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The transport returned an error.
    Call(E),
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "attempt timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Call(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Failure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Call(e) => Some(e),
            Self::Timeout { .. } => None,
        }
    }
}

impl<E> Failure<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Borrow the transport error, if this was not a timeout.
    pub fn as_call(&self) -> Option<&E> {
        match self {
            Self::Call(e) => Some(e),
            Self::Timeout { .. } => None,
        }
    }

    pub fn into_call(self) -> Option<E> {
        match self {
            Self::Call(e) => Some(e),
            Self::Timeout { .. } => None,
        }
    }
}

/// Final outcome of a resilient call that did not succeed.
///
/// Retries stay inside the wrapper; only this value crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError<E> {
    /// The breaker is open; no attempt was made.
    CircuitOpen {
        /// Time left before the breaker admits a half-open probe.
        remaining: Duration,
    },
    /// Every attempt failed with a retryable failure.
    RetryExhausted { attempts: usize, last: Failure<E> },
    /// An attempt failed with a failure classified as not worth retrying.
    Fatal(Failure<E>),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { remaining } => {
                write!(f, "circuit breaker open (next probe in {:?})", remaining)
            }
            Self::RetryExhausted { attempts, last } => {
                write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
            }
            Self::Fatal(failure) => write!(f, "{}", failure),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { last, .. } | Self::Fatal(last) => Some(last),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// True when the last attempt ended in a timeout, however it was classified.
    pub fn is_timeout(&self) -> bool {
        self.last_failure().is_some_and(Failure::is_timeout)
    }

    /// The failure of the last attempt made, if any attempt was made.
    pub fn last_failure(&self) -> Option<&Failure<E>> {
        match self {
            Self::RetryExhausted { last, .. } | Self::Fatal(last) => Some(last),
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Number of attempts made before giving up (0 when rejected by the breaker).
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            Self::CircuitOpen { .. } => Some(0),
            Self::Fatal(_) => None,
        }
    }

    /// Extract the transport error of the last attempt.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::RetryExhausted { last, .. } | Self::Fatal(last) => last.into_call(),
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Access circuit-open remaining duration if present.
    pub fn circuit_open_remaining(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { remaining } => Some(*remaining),
            _ => None,
        }
    }
}

/// Failures of the shared key-value store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A value under `key` could not be decoded.
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors returned by rate limiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    /// The bucket is empty; the caller must back off for `retry_after`.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },
    /// The per-key lock could not be taken within the wait budget.
    #[error("could not acquire lock {key} within {waited:?}")]
    LockAcquisitionFailed { key: String, waited: Duration },
    /// The shared store is unreachable.
    #[error("rate limiter backend unavailable: {0}")]
    BackendUnavailable(#[from] StoreError),
    /// Limiter configuration rejected.
    #[error("invalid rate limiter config: {0}")]
    InvalidConfig(String),
}

impl LimitError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Lock and store failures, where the caller picks fail-open or fail-closed.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::LockAcquisitionFailed { .. } | Self::BackendUnavailable(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whole seconds suitable for a `Retry-After` header, rounded to nearest.
    pub fn retry_after_header(&self) -> Option<String> {
        self.retry_after().map(|d| format!("{:.0}", d.as_secs_f64()))
    }
}
