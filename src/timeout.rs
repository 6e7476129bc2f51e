//! Per-attempt timeout.
//!
//! Each attempt of a resilient call gets its own bound; the retry budget as a whole is not
//! bounded here. An attempt that runs out is dropped, which cancels whatever it was awaiting.

use crate::error::Failure;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timeout duration must be non-zero")]
pub struct InvalidTimeout;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Result<Self, InvalidTimeout> {
        if duration.is_zero() {
            return Err(InvalidTimeout);
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run one attempt, mapping an overrun to [`Failure::Timeout`] and a transport error to
    /// [`Failure::Call`].
    pub async fn execute<T, E, Fut>(&self, attempt: Fut) -> Result<T, Failure<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, attempt).await {
            Ok(result) => result.map_err(Failure::Call),
            Err(_) => Err(Failure::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { duration: Duration::from_secs(10) }
    }
}
