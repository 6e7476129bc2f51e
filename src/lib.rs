#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # reelguard
//!
//! Resilience layer for services that call one another over RPC.
//!
//! Inbound traffic:
//! - **Distributed token buckets** whose state lives in a shared store (Redis via the
//!   `reelguard-redis` crate, or [`InMemoryStore`]) under a per-key distributed lock
//! - **A limiter registry** that caches buckets per caller and route and reclaims idle ones
//! - **Tower middleware** answering over-limit callers with a retry-after duration
//!
//! Outbound calls:
//! - **Error classification** by structured status code
//! - **Retry** with capped exponential backoff and jitter
//! - **Circuit breaking** over a sliding window of outcomes
//! - **Per-attempt timeouts**, all composed by [`ResilientCallWrapper`]
//!
//! ## Quick Start
//!
//! ```rust
//! use reelguard::prelude::*;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = Arc::new(InMemoryStore::new());
//! let registry = RateLimiterRegistry::builder(store).build().unwrap();
//!
//! let key = LimiterKey::new("movie", "10.0.0.7", "GET", "/movies");
//! let limiter = registry.get_or_create(key, RateLimiterConfig::default());
//! assert!(limiter.limit().await.is_ok());
//!
//! let users = ResilientCallWrapper::builder("user-service").build();
//! let name = users
//!     .invoke(|| async { Ok::<_, RpcStatus>("ada") })
//!     .await
//!     .unwrap();
//! assert_eq!(name, "ada");
//! # });
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod resilient;
pub mod retry;
pub mod sleeper;
pub mod timeout;

// Re-exports
pub use backoff::Backoff;
pub use circuit_breaker::{
    BreakerPermit, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitOpen, CircuitState,
};
pub use classify::{
    CallOutcome, Classification, ClassifierConfig, ErrorClassifier, HasStatusCode, RpcStatus,
    StatusClassifier, StatusCode, Verdict,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use error::{Failure, LimitError, ResilienceError, StoreError};
pub use jitter::Jitter;
pub use rate_limit::{
    InMemoryStore, LimiterKey, RateLimitLayer, RateLimiter, RateLimiterConfig,
    RateLimiterRegistry, StateStore, TokenBucket,
};
pub use resilient::{ResilientCallLayer, ResilientCallWrapper};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutPolicy;
