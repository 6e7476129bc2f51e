//! Process-local registry of live token buckets.
//!
//! One bucket per [`LimiterKey`], created on first use and reclaimed by a background task
//! once it has been idle for longer than its refill interval. Bucket state itself lives in
//! the shared store, so reclaiming an entry only frees the local handle.

use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::error::LimitError;
use crate::rate_limit::bucket::{RateLimiter, RateLimiterConfig, TokenBucket};
use crate::rate_limit::key::LimiterKey;
use crate::rate_limit::store::StateStore;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
struct Entry {
    bucket: TokenBucket,
    ttl_millis: u64,
    last_access: AtomicU64,
    in_flight: AtomicUsize,
}

impl Entry {
    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::AcqRel);
    }

    fn is_expired(&self, now: u64) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
            && now.saturating_sub(self.last_access.load(Ordering::Acquire)) > self.ttl_millis
    }
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<LimiterKey, Arc<Entry>>,
    store: Arc<dyn StateStore>,
    /// Local idle tracking; never shared between processes.
    access_clock: Arc<dyn Clock>,
    bucket_clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl Inner {
    fn reclaim_expired(&self) -> usize {
        let now = self.access_clock.now_millis();
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if entry.is_expired(now) {
                tracing::trace!(target: "reelguard::registry", key = %key, "reclaiming idle limiter");
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            tracing::debug!(
                target: "reelguard::registry",
                removed,
                remaining = self.entries.len(),
                "reclaimed idle limiters"
            );
        }
        removed
    }
}

/// Owns the live limiters of one process and their reclamation loop.
///
/// Dropping the registry (or calling [`shutdown`](Self::shutdown)) stops the loop.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    inner: Arc<Inner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiterRegistry {
    pub fn builder(store: Arc<dyn StateStore>) -> RateLimiterRegistryBuilder {
        RateLimiterRegistryBuilder {
            store,
            gc_interval: RateLimiterConfig::default().refill_interval(),
            bucket_clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Return the live limiter for `key`, creating it from `config` if absent.
    ///
    /// Construction happens at most once per key even under concurrent calls. An existing
    /// entry keeps the config it was created with.
    pub fn get_or_create(&self, key: LimiterKey, config: RateLimiterConfig) -> RegisteredLimiter {
        let now = self.inner.access_clock.now_millis();
        let slot = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(target: "reelguard::registry", key = %key, "creating limiter");
                let bucket = TokenBucket::new(key, config, self.inner.store.clone())
                    .with_clock(self.inner.bucket_clock.clone())
                    .with_sleeper(self.inner.sleeper.clone());
                Arc::new(Entry {
                    bucket,
                    ttl_millis: u64::try_from(config.refill_interval().as_millis())
                        .unwrap_or(u64::MAX),
                    last_access: AtomicU64::new(now),
                    in_flight: AtomicUsize::new(0),
                })
            });
        // touched under the shard lock so a concurrent sweep sees the fresh access
        slot.touch(now);
        let entry = Arc::clone(slot.value());
        drop(slot);
        RegisteredLimiter {
            entry,
            registry: Arc::downgrade(&self.inner),
            clock: self.inner.access_clock.clone(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Run one reclamation sweep now. Returns how many entries were removed.
    pub fn reclaim_expired(&self) -> usize {
        self.inner.reclaim_expired()
    }

    /// Stop the reclamation loop. Entries stay until the registry is dropped.
    pub fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            tracing::debug!(target: "reelguard::registry", "reclamation loop stopped");
        }
    }
}

impl Drop for RateLimiterRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct RateLimiterRegistryBuilder {
    store: Arc<dyn StateStore>,
    gc_interval: Duration,
    bucket_clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimiterRegistryBuilder {
    /// Reclamation period; use the refill interval of the limiters being registered.
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Clock for bucket state timestamps (defaults to wall-clock time).
    pub fn bucket_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.bucket_clock = Arc::new(clock);
        self
    }

    /// Sleeper used while buckets wait for their lock.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the registry and spawn its reclamation loop on the current tokio runtime.
    pub fn build(self) -> Result<RateLimiterRegistry, LimitError> {
        if self.gc_interval.is_zero() {
            return Err(LimitError::InvalidConfig("gc interval must be > 0".into()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            LimitError::InvalidConfig("registry must be built inside a tokio runtime".into())
        })?;

        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            store: self.store,
            access_clock: Arc::new(MonotonicClock::default()),
            bucket_clock: self.bucket_clock,
            sleeper: self.sleeper,
        });
        let reaper = runtime.spawn(reclaim_loop(Arc::downgrade(&inner), self.gc_interval));

        Ok(RateLimiterRegistry { inner, reaper: Mutex::new(Some(reaper)) })
    }
}

async fn reclaim_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.reclaim_expired();
    }
}

/// Handle to a registered bucket. Every take refreshes the entry's last access, and a handle
/// whose entry was reclaimed registers it again before taking.
#[derive(Debug, Clone)]
pub struct RegisteredLimiter {
    entry: Arc<Entry>,
    registry: Weak<Inner>,
    clock: Arc<dyn Clock>,
}

impl RegisteredLimiter {
    pub fn bucket(&self) -> &TokenBucket {
        &self.entry.bucket
    }

    /// Mark the entry busy while holding its map shard, so no sweep interleaves.
    fn admit(&self) -> InFlight<'_> {
        let now = self.clock.now_millis();
        match self.registry.upgrade() {
            Some(inner) => {
                let slot = inner
                    .entries
                    .entry(self.entry.bucket.key().clone())
                    .or_insert_with(|| self.entry.clone());
                self.entry.in_flight.fetch_add(1, Ordering::AcqRel);
                self.entry.touch(now);
                drop(slot);
            }
            None => {
                self.entry.in_flight.fetch_add(1, Ordering::AcqRel);
                self.entry.touch(now);
            }
        }
        InFlight(&self.entry)
    }
}

struct InFlight<'a>(&'a Entry);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl RateLimiter for RegisteredLimiter {
    async fn take(&self, n: u64) -> Result<(), LimitError> {
        let _in_flight = self.admit();
        let result = self.entry.bucket.take(n).await;
        self.entry.touch(self.clock.now_millis());
        result
    }

    async fn reset(&self) -> Result<(), LimitError> {
        let _in_flight = self.admit();
        self.entry.bucket.reset().await
    }
}
