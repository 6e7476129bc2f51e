//! Deserializable settings for the whole resilience layer.
//!
//! Durations use humantime notation (`"3s"`, `"100ms"`). Every field has a default, so a
//! deployment only lists what it overrides:
//!
//! ```rust
//! use reelguard::config::ResilienceSettings;
//!
//! let settings: ResilienceSettings = serde_json::from_str(
//!     r#"{ "service_prefix": "movie", "rate_limit": { "capacity": 5, "refill_interval": "1s" } }"#,
//! ).unwrap();
//! settings.validate().unwrap();
//! assert_eq!(settings.rate_limiter_config().unwrap().capacity(), 5);
//! ```

use crate::backoff::{Backoff, BackoffError};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy};
use crate::classify::{ClassifierConfig, StatusClassifier};
use crate::error::LimitError;
use crate::jitter::{InvalidJitter, Jitter};
use crate::rate_limit::{LockConfig, RateLimiterConfig};
use crate::resilient::ResilientCallWrapper;
use crate::retry::{BuildError, RetryPolicy};
use crate::timeout::{InvalidTimeout, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("service_prefix must not be empty")]
    MissingServicePrefix,
    #[error(transparent)]
    RateLimit(#[from] LimitError),
    #[error(transparent)]
    Retry(#[from] BuildError),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Jitter(#[from] InvalidJitter),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error(transparent)]
    Timeout(#[from] InvalidTimeout),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// First component of every store key owned by this service.
    pub service_prefix: String,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    /// Bound on a single outbound attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub classifier: ClassifierConfig,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            service_prefix: String::new(),
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            timeout: Duration::from_secs(10),
            classifier: ClassifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
    pub state_ttl_multiplier: u32,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_retry_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let lock = LockConfig::default();
        Self {
            capacity: 2,
            refill_interval: Duration::from_secs(3),
            state_ttl_multiplier: 2,
            lock_ttl: lock.ttl,
            lock_acquire_timeout: lock.acquire_timeout,
            lock_retry_interval: lock.retry_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter_factor: 0.2,
        }
    }
}

/// `threshold` out of the last `of` executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub threshold: usize,
    pub of: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: Ratio,
    pub success_threshold: Ratio,
    #[serde(with = "humantime_serde")]
    pub open_delay: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: Ratio { threshold: 4, of: 10 },
            success_threshold: Ratio { threshold: 6, of: 10 },
            open_delay: Duration::from_secs(5),
        }
    }
}

impl ResilienceSettings {
    /// Check every section without building anything that needs a runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_prefix.is_empty() {
            return Err(ConfigError::MissingServicePrefix);
        }
        self.rate_limiter_config()?;
        self.retry_policy()?;
        self.circuit_breaker_config().validate()?;
        self.timeout_policy()?;
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> Result<RateLimiterConfig, ConfigError> {
        let rl = &self.rate_limit;
        let config = RateLimiterConfig::new(rl.capacity, rl.refill_interval)?
            .with_state_ttl_multiplier(rl.state_ttl_multiplier)?
            .with_lock_config(LockConfig {
                ttl: rl.lock_ttl,
                acquire_timeout: rl.lock_acquire_timeout,
                retry_interval: rl.lock_retry_interval,
            })?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let retry = &self.retry;
        let policy = RetryPolicy::builder()
            .max_attempts(retry.max_attempts)
            .backoff(Backoff::exponential(retry.base_backoff, retry.max_backoff)?)
            .jitter(Jitter::factor(retry.jitter_factor)?)
            .build()?;
        Ok(policy)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let cb = &self.circuit_breaker;
        CircuitBreakerConfig::default()
            .with_failure_ratio(cb.failure_threshold.threshold, cb.failure_threshold.of)
            .with_success_ratio(cb.success_threshold.threshold, cb.success_threshold.of)
            .with_open_delay(cb.open_delay)
    }

    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, ConfigError> {
        Ok(TimeoutPolicy::new(self.timeout)?)
    }

    pub fn classifier(&self) -> StatusClassifier {
        StatusClassifier::new(self.classifier.clone())
    }

    /// Wrapper for outbound calls to `dependency`, with its own breaker.
    pub fn resilient_wrapper(&self, dependency: &str) -> Result<ResilientCallWrapper, ConfigError> {
        let breaker = CircuitBreakerPolicy::new(self.circuit_breaker_config())?.named(dependency);
        Ok(ResilientCallWrapper::builder(dependency)
            .retry(self.retry_policy()?)
            .breaker(breaker)
            .timeout(self.timeout_policy()?)
            .classifier(self.classifier())
            .build())
    }
}
