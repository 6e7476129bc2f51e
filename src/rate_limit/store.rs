use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Shared key-value store holding bucket state and lock keys.
///
/// Every value carries a time-to-live so abandoned keys expire on their own. Implementations
/// must make `set_nx` and `delete_if_eq` atomic with respect to other callers, since the
/// distributed lock is built on them.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write with expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write only if `key` is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`. Returns whether it was deleted.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: u64,
}

/// Process-local store for tests and single-instance deployments.
///
/// Clones share the same data. Expiry is evaluated lazily against the store's clock.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, StoredValue>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_clock(MonotonicClock::default())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::default(),
            clock: Arc::new(clock),
            unavailable: Arc::default(),
        }
    }

    /// Simulate an outage: while set, every operation fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of keys that have not expired.
    pub fn live_keys(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().values().filter(|v| v.expires_at > now).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    /// Live value under `key`, dropping it first if it has expired.
    fn live<'a>(
        data: &'a mut HashMap<String, StoredValue>,
        key: &str,
        now: u64,
    ) -> Option<&'a StoredValue> {
        if data.get(key).is_some_and(|v| v.expires_at <= now) {
            data.remove(key);
        }
        data.get(key)
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut data = self.lock();
        Ok(Self::live(&mut data, key, now).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = self.expiry(ttl);
        self.lock().insert(key.to_string(), StoredValue { value: value.to_string(), expires_at });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl);
        let mut data = self.lock();
        if Self::live(&mut data, key, now).is_some() {
            return Ok(false);
        }
        data.insert(key.to_string(), StoredValue { value: value.to_string(), expires_at });
        Ok(true)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut data = self.lock();
        if Self::live(&mut data, key, now).is_some_and(|v| v.value == expected) {
            data.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().remove(key);
        Ok(())
    }
}
