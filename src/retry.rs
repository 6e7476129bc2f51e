//! Retry policy for classified attempts.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - The operation reports each attempt as a [`CallOutcome`]; only `Retryable` failures are
//!   re-attempted. A `Fatal` failure ends the sequence as [`ResilienceError::Fatal`].
//! - An `Err` returned by the operation itself (for example a breaker rejection) ends the
//!   sequence immediately and is returned unchanged.
//! - Before re-attempt `n` the policy sleeps `jitter(backoff.delay(n))` through its
//!   [`Sleeper`].
//!
//! ```rust
//! use std::time::Duration;
//! use reelguard::{Backoff, CallOutcome, Failure, Jitter, ResilienceError, RetryPolicy, Verdict};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::constant(Duration::from_millis(1)))
//!     .jitter(Jitter::None)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<&str>> = policy
//!     .execute(|_attempt| async {
//!         Ok(CallOutcome::Failure { verdict: Verdict::retryable(), failure: Failure::Call("busy") })
//!     })
//!     .await;
//! assert_eq!(result.unwrap_err().attempts(), Some(3));
//! # });
//! ```

use crate::classify::CallOutcome;
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;

/// Retry policy combining backoff, jitter, and sleeper.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Drive `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<CallOutcome<T, E>, ResilienceError<E>>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (verdict, failure) = match operation(attempt).await? {
                CallOutcome::Success(value) => return Ok(value),
                CallOutcome::Failure { verdict, failure } => (verdict, failure),
            };

            if !verdict.is_retryable() {
                tracing::debug!(target: "reelguard::retry", attempt, "fatal failure, not retrying");
                return Err(ResilienceError::Fatal(failure));
            }
            if attempt >= self.max_attempts {
                tracing::warn!(target: "reelguard::retry", attempts = attempt, "retries exhausted");
                return Err(ResilienceError::RetryExhausted { attempts: attempt, last: failure });
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            tracing::debug!(
                target: "reelguard::retry",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retryable failure, backing off"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Backoff::default(),
            jitter: Jitter::Factor(0.2),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

/// Builder for `RetryPolicy`. Starts from the defaults: 4 attempts, 100ms..1s exponential
/// backoff, 20% jitter.
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.policy.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.policy.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        if self.policy.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(self.policy)
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Verdict;
    use crate::{Failure, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn retryable(msg: &'static str) -> CallOutcome<u32, &'static str> {
        CallOutcome::Failure { verdict: Verdict::retryable(), failure: Failure::Call(msg) }
    }

    fn policy(sleeper: TrackingSleeper, attempts: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(attempts)
            .backoff(Backoff::default())
            .jitter(Jitter::None)
            .sleeper(sleeper)
            .build()
            .expect("builder")
    }

    #[tokio::test]
    async fn success_first_attempt_does_not_sleep() {
        let sleeper = TrackingSleeper::new();
        let result = policy(sleeper.clone(), 4)
            .execute(|_| async { Ok::<_, ResilienceError<&str>>(CallOutcome::Success(42)) })
            .await;
        assert_eq!(result, Ok(42));
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn succeeds_on_fourth_attempt_with_growing_delays() {
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);

        let result = policy(sleeper.clone(), 4)
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Ok::<_, ResilienceError<&str>>(retryable("unavailable"))
                    } else {
                        Ok(CallOutcome::Success(7))
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_last_failure() {
        let sleeper = TrackingSleeper::new();
        let result = policy(sleeper.clone(), 3)
            .execute(|_| async { Ok::<_, ResilienceError<&str>>(retryable("still down")) })
            .await;

        match result {
            Err(ResilienceError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, Failure::Call("still down"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(sleeper.calls().len(), 2);
    }

    #[tokio::test]
    async fn fatal_failure_stops_after_one_attempt() {
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);
        let result = policy(sleeper.clone(), 4)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Ok::<CallOutcome<u32, _>, ResilienceError<_>>(CallOutcome::Failure {
                        verdict: Verdict::fatal(false),
                        failure: Failure::Call("invalid argument"),
                    })
                }
            })
            .await;

        assert_eq!(result, Err(ResilienceError::Fatal(Failure::Call("invalid argument"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn operation_error_aborts_sequence() {
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);
        let result: Result<u32, _> = policy(sleeper.clone(), 4)
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Ok(retryable("unavailable"))
                    } else {
                        Err(ResilienceError::<&str>::CircuitOpen { remaining: Duration::from_secs(5) })
                    }
                }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = RetryPolicy::builder().max_attempts(0).build().unwrap_err();
        assert_eq!(err, BuildError::InvalidMaxAttempts(0));
    }

    #[test]
    fn default_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.jitter, Jitter::Factor(0.2));
    }
}
