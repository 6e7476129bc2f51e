//! Convenient re-exports for common reelguard types.
pub use crate::{
    backoff::{Backoff, BackoffError},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy, CircuitState},
    classify::{classifier_fn, ClassifierConfig, ErrorClassifier, RpcStatus, StatusClassifier, StatusCode},
    config::ResilienceSettings,
    error::{Failure, LimitError, ResilienceError},
    jitter::Jitter,
    rate_limit::{
        BackendFailurePolicy, InMemoryStore, LimiterKey, RateLimitLayer, RateLimiter,
        RateLimiterConfig, RateLimiterRegistry, RequestIdentity, StateStore,
    },
    resilient::{ResilientCallLayer, ResilientCallWrapper},
    retry::RetryPolicy,
    timeout::TimeoutPolicy,
};
