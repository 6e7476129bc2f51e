//! Distributed rate limiting.
//!
//! - [`TokenBucket`]: per-key bucket whose state lives in a shared [`StateStore`] and is only
//!   mutated under a [`StoreLock`].
//! - [`RateLimiterRegistry`]: process-local cache of buckets with idle reclamation.
//! - [`RateLimitLayer`]: tower middleware limiting inbound requests per caller and route.
//!
//! Store keys follow `<prefix>:rl:<caller>:<method>:<path>` for state and
//! `<prefix>:rll:<caller>:<method>:<path>` for locks.

pub mod bucket;
pub mod key;
pub mod lock;
pub mod middleware;
pub mod registry;
pub mod store;

pub use bucket::{RateLimiter, RateLimiterConfig, TokenBucket, TokenBucketState};
pub use key::LimiterKey;
pub use lock::{LockConfig, LockGuard, StoreLock};
pub use middleware::{
    BackendFailurePolicy, KeyExtractor, RateLimitLayer, RateLimitRejection, RateLimitService,
    RequestIdentity,
};
pub use registry::{RateLimiterRegistry, RateLimiterRegistryBuilder, RegisteredLimiter};
pub use store::{InMemoryStore, StateStore};
