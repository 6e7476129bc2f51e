//! Distributed token bucket.
//!
//! State lives in the shared store as JSON and is only read or written while holding the
//! bucket's [`StoreLock`], which linearizes takes across every process sharing the store.
//! Refill is discrete: one token per full `refill_interval` since the last refill, capped at
//! `capacity`. Partial intervals carry over, so a refill never loses elapsed time unless
//! the bucket is full.

use crate::clock::{Clock, SystemClock};
use crate::error::{LimitError, StoreError};
use crate::rate_limit::key::LimiterKey;
use crate::rate_limit::lock::{LockConfig, StoreLock};
use crate::rate_limit::store::StateStore;
use crate::sleeper::Sleeper;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Per-key limiter operations.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take `n` tokens. On an empty bucket fails with [`LimitError::RateLimitExceeded`].
    async fn take(&self, n: u64) -> Result<(), LimitError>;

    async fn limit(&self) -> Result<(), LimitError> {
        self.take(1).await
    }

    /// Refill the bucket to capacity and clear its lock.
    async fn reset(&self) -> Result<(), LimitError>;
}

/// Bucket sizing. Defaults: 2 tokens, one token back every 3s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    capacity: u64,
    refill_interval: Duration,
    state_ttl_multiplier: u32,
    lock: LockConfig,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            refill_interval: Duration::from_secs(3),
            state_ttl_multiplier: 2,
            lock: LockConfig::default(),
        }
    }
}

impl RateLimiterConfig {
    /// `capacity` must be at least 1 and `refill_interval` at least one second.
    pub fn new(capacity: u64, refill_interval: Duration) -> Result<Self, LimitError> {
        let config = Self { capacity, refill_interval, ..Self::default() };
        config.validate()?;
        Ok(config)
    }

    /// Stored state expires after `multiplier` refill intervals without writes.
    pub fn with_state_ttl_multiplier(mut self, multiplier: u32) -> Result<Self, LimitError> {
        self.state_ttl_multiplier = multiplier;
        self.validate()?;
        Ok(self)
    }

    pub fn with_lock_config(mut self, lock: LockConfig) -> Result<Self, LimitError> {
        self.lock = lock;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.capacity == 0 {
            return Err(LimitError::InvalidConfig("capacity must be >= 1".into()));
        }
        if self.refill_interval < Duration::from_secs(1) {
            return Err(LimitError::InvalidConfig(format!(
                "refill interval must be >= 1s (got {:?})",
                self.refill_interval
            )));
        }
        if self.state_ttl_multiplier == 0 {
            return Err(LimitError::InvalidConfig("state ttl multiplier must be >= 1".into()));
        }
        self.lock.validate()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn lock(&self) -> &LockConfig {
        &self.lock
    }

    pub fn state_ttl(&self) -> Duration {
        self.refill_interval.saturating_mul(self.state_ttl_multiplier)
    }

    fn refill_interval_millis(&self) -> u64 {
        u64::try_from(self.refill_interval.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: u64,
    /// Milliseconds on the bucket clock at which the last whole token was added.
    pub last_refill_at: u64,
}

impl TokenBucketState {
    pub fn full(capacity: u64, now: u64) -> Self {
        Self { tokens: capacity, last_refill_at: now }
    }

    /// Add one token per whole interval elapsed since the last refill.
    pub fn refill(&mut self, now: u64, interval_millis: u64, capacity: u64) {
        let elapsed = now.saturating_sub(self.last_refill_at);
        let added = elapsed / interval_millis.max(1);
        if self.tokens.saturating_add(added) >= capacity {
            self.tokens = capacity;
            self.last_refill_at = now;
        } else {
            self.tokens += added;
            self.last_refill_at = now - elapsed % interval_millis.max(1);
        }
    }
}

/// Token bucket for one [`LimiterKey`], backed by a [`StateStore`].
#[derive(Debug, Clone)]
pub struct TokenBucket {
    key: LimiterKey,
    state_key: String,
    lock_key: String,
    config: RateLimiterConfig,
    store: Arc<dyn StateStore>,
    lock: StoreLock,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(key: LimiterKey, config: RateLimiterConfig, store: Arc<dyn StateStore>) -> Self {
        let lock = StoreLock::new(store.clone(), config.lock);
        Self {
            state_key: key.state_key(),
            lock_key: key.lock_key(),
            key,
            config,
            store,
            lock,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read bucket time from `clock`. Every process sharing a store must agree on it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper used while waiting for the lock.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.lock = self.lock.with_sleeper(sleeper);
        self
    }

    pub fn key(&self) -> &LimiterKey {
        &self.key
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Current persisted state, without refilling or locking.
    pub async fn peek(&self) -> Result<Option<TokenBucketState>, LimitError> {
        self.load().await
    }

    async fn load(&self) -> Result<Option<TokenBucketState>, LimitError> {
        let Some(raw) = self.store.get(&self.state_key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            LimitError::BackendUnavailable(StoreError::Corrupt {
                key: self.state_key.clone(),
                reason: e.to_string(),
            })
        })
    }

    async fn save(&self, state: &TokenBucketState) -> Result<(), LimitError> {
        let raw = serde_json::to_string(state).map_err(|e| {
            LimitError::BackendUnavailable(StoreError::Corrupt {
                key: self.state_key.clone(),
                reason: e.to_string(),
            })
        })?;
        self.store.set(&self.state_key, &raw, self.config.state_ttl()).await?;
        Ok(())
    }

    async fn take_locked(&self, n: u64) -> Result<(), LimitError> {
        let now = self.clock.now_millis();
        let mut state = match self.load().await? {
            Some(state) => state,
            None => TokenBucketState::full(self.config.capacity, now),
        };
        state.refill(now, self.config.refill_interval_millis(), self.config.capacity);

        if state.tokens >= n {
            state.tokens -= n;
            self.save(&state).await?;
            return Ok(());
        }

        self.save(&state).await?;
        tracing::debug!(
            target: "reelguard::rate_limit",
            key = %self.key,
            tokens = state.tokens,
            retry_after_ms = self.config.refill_interval.as_millis() as u64,
            "rate limit exceeded"
        );
        Err(LimitError::RateLimitExceeded { retry_after: self.config.refill_interval })
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn take(&self, n: u64) -> Result<(), LimitError> {
        let guard = self.lock.acquire(&self.lock_key).await?;
        let result = self.take_locked(n).await;
        if let Err(error) = guard.release().await {
            // the lock expires on its own; the take outcome stands
            tracing::warn!(target: "reelguard::rate_limit", key = %self.key, %error, "lock release failed");
        }
        if let Err(error) = &result {
            if error.is_backend_failure() {
                tracing::warn!(target: "reelguard::rate_limit", key = %self.key, %error, "bucket backend failure");
            }
        }
        result
    }

    async fn reset(&self) -> Result<(), LimitError> {
        let state = TokenBucketState::full(self.config.capacity, self.clock.now_millis());
        self.save(&state).await?;
        self.lock.force_release(&self.lock_key).await?;
        tracing::debug!(target: "reelguard::rate_limit", key = %self.key, "bucket reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryStore;

    const INTERVAL: u64 = 3_000;

    fn bucket(clock: &ManualClock, store: &InMemoryStore) -> TokenBucket {
        TokenBucket::new(
            LimiterKey::new("svc", "caller", "GET", "/movies"),
            RateLimiterConfig::default(),
            Arc::new(store.clone()),
        )
        .with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn refill_adds_whole_intervals_and_keeps_remainder() {
        let mut state = TokenBucketState { tokens: 0, last_refill_at: 0 };
        state.refill(3_100, INTERVAL, 2);
        assert_eq!(state, TokenBucketState { tokens: 1, last_refill_at: 3_000 });

        state.refill(5_000, INTERVAL, 2);
        assert_eq!(state, TokenBucketState { tokens: 1, last_refill_at: 3_000 });
    }

    #[test]
    fn refill_caps_at_capacity_and_resets_clock() {
        let mut state = TokenBucketState { tokens: 1, last_refill_at: 0 };
        state.refill(60_000, INTERVAL, 2);
        assert_eq!(state, TokenBucketState { tokens: 2, last_refill_at: 60_000 });
    }

    #[tokio::test]
    async fn capacity_takes_succeed_then_fail_with_interval() {
        let clock = ManualClock::starting_at(1_000_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);

        assert_eq!(b.limit().await, Ok(()));
        assert_eq!(b.limit().await, Ok(()));
        assert_eq!(
            b.limit().await,
            Err(LimitError::RateLimitExceeded { retry_after: Duration::from_secs(3) })
        );
    }

    #[tokio::test]
    async fn failed_take_persists_refreshed_state() {
        let clock = ManualClock::starting_at(1_000_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);
        b.take(2).await.unwrap();

        clock.advance(1_000);
        assert!(b.take(1).await.unwrap_err().is_rate_limited());
        let state = b.peek().await.unwrap().expect("state persisted");
        assert_eq!(state, TokenBucketState { tokens: 0, last_refill_at: 1_000_000 });
    }

    #[tokio::test]
    async fn zero_take_refills_and_persists() {
        let clock = ManualClock::starting_at(1_000_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);

        assert_eq!(b.take(0).await, Ok(()));
        let state = b.peek().await.unwrap().expect("state persisted");
        assert_eq!(state, TokenBucketState { tokens: 2, last_refill_at: 1_000_000 });

        b.take(2).await.unwrap();
        clock.advance(3_100);
        assert_eq!(b.take(0).await, Ok(()));
        let state = b.peek().await.unwrap().expect("state persisted");
        assert_eq!(state, TokenBucketState { tokens: 1, last_refill_at: 1_003_000 });
    }

    #[tokio::test]
    async fn oversized_take_is_rate_limited_with_interval() {
        let clock = ManualClock::starting_at(1_000_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);

        assert_eq!(
            b.take(3).await,
            Err(LimitError::RateLimitExceeded { retry_after: Duration::from_secs(3) })
        );
        // the refreshed state is persisted and the bucket is still full
        let state = b.peek().await.unwrap().expect("state persisted");
        assert_eq!(state, TokenBucketState { tokens: 2, last_refill_at: 1_000_000 });
        assert_eq!(b.take(2).await, Ok(()));
    }

    #[tokio::test]
    async fn reset_refills_and_clears_lock() {
        let clock = ManualClock::new();
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);
        b.take(2).await.unwrap();
        store.set("svc:rll:caller:GET:/movies", "stuck", Duration::from_secs(2)).await.unwrap();

        b.reset().await.unwrap();

        assert!(store.get("svc:rll:caller:GET:/movies").await.unwrap().is_none());
        assert_eq!(b.take(2).await, Ok(()));
    }

    #[tokio::test]
    async fn corrupt_state_is_a_backend_failure() {
        let clock = ManualClock::new();
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);
        store.set("svc:rl:caller:GET:/movies", "not json", Duration::from_secs(6)).await.unwrap();

        let err = b.take(1).await.unwrap_err();
        assert!(matches!(err, LimitError::BackendUnavailable(StoreError::Corrupt { .. })));
        assert!(store.get("svc:rll:caller:GET:/movies").await.unwrap().is_none(), "lock released");
    }

    #[tokio::test]
    async fn store_outage_is_distinct_from_rate_limit() {
        let clock = ManualClock::new();
        let store = InMemoryStore::with_clock(clock.clone());
        let b = bucket(&clock, &store);
        store.set_unavailable(true);

        let err = b.take(1).await.unwrap_err();
        assert!(err.is_backend_failure());
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn config_validation() {
        assert!(RateLimiterConfig::new(0, Duration::from_secs(3)).is_err());
        assert!(RateLimiterConfig::new(2, Duration::from_millis(999)).is_err());
        assert!(RateLimiterConfig::default().with_state_ttl_multiplier(0).is_err());
        let config = RateLimiterConfig::new(5, Duration::from_secs(1)).unwrap();
        assert_eq!(config.state_ttl(), Duration::from_secs(2));
    }
}
