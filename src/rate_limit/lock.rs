//! Distributed lock over the shared store.
//!
//! A lock is a key written with `SET NX` semantics and a TTL, holding a random owner token.
//! Release is compare-and-delete on that token, so a holder whose lock expired and was
//! taken over cannot release the new owner's lock.

use crate::error::{LimitError, StoreError};
use crate::rate_limit::store::StateStore;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::Arc;
use std::time::Duration;

/// Lock timing. Defaults: 2s TTL, give up after waiting 1s, poll every 10ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Lifetime of the lock key; bounds how long a crashed holder blocks the bucket.
    pub ttl: Duration,
    pub acquire_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(10),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.ttl.is_zero() {
            return Err(LimitError::InvalidConfig("lock ttl must be > 0".into()));
        }
        if self.retry_interval.is_zero() {
            return Err(LimitError::InvalidConfig("lock retry interval must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoreLock {
    store: Arc<dyn StateStore>,
    config: LockConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl StoreLock {
    pub fn new(store: Arc<dyn StateStore>, config: LockConfig) -> Self {
        Self { store, config, sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Take the lock on `key`, polling until `acquire_timeout` worth of waiting has passed.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard, LimitError> {
        let token = uuid::Uuid::new_v4().to_string();
        let mut waited = Duration::ZERO;

        loop {
            if self.store.set_nx(key, &token, self.config.ttl).await? {
                tracing::trace!(target: "reelguard::lock", key, "lock acquired");
                return Ok(LockGuard {
                    store: self.store.clone(),
                    key: key.to_string(),
                    token,
                    released: false,
                });
            }

            if waited >= self.config.acquire_timeout {
                tracing::warn!(
                    target: "reelguard::lock",
                    key,
                    waited_ms = waited.as_millis() as u64,
                    "lock acquisition timed out"
                );
                return Err(LimitError::LockAcquisitionFailed { key: key.to_string(), waited });
            }

            let pause = self.config.retry_interval.min(self.config.acquire_timeout - waited);
            self.sleeper.sleep(pause).await;
            waited += pause;
        }
    }

    /// Delete the lock regardless of owner (administrative reset).
    pub async fn force_release(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }
}

/// Held lock. Release explicitly with [`LockGuard::release`]; a guard dropped without release
/// (a cancelled take) releases in a background task on the current tokio runtime.
#[derive(Debug)]
pub struct LockGuard {
    store: Arc<dyn StateStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Compare-and-delete the lock. If this future is dropped before the store answers,
    /// the guard's drop repeats the delete in the background.
    pub async fn release(mut self) -> Result<(), StoreError> {
        let outcome = self.store.delete_if_eq(&self.key, &self.token).await;
        self.released = true;
        if !outcome? {
            tracing::warn!(target: "reelguard::lock", key = %self.key, "lock expired before release");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                target: "reelguard::lock",
                key = %self.key,
                "no runtime to release abandoned lock; it will expire"
            );
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(error) = store.delete_if_eq(&key, &token).await {
                tracing::warn!(target: "reelguard::lock", key = %key, %error, "abandoned lock release failed");
            }
        });
    }
}
