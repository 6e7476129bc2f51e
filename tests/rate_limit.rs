use reelguard::rate_limit::{LockConfig, StoreLock};
use reelguard::{
    InMemoryStore, LimitError, LimiterKey, ManualClock, MonotonicClock, RateLimiter,
    RateLimiterConfig, RateLimiterRegistry, StateStore, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn key(caller: &str, path: &str) -> LimiterKey {
    LimiterKey::new("movie", caller, "GET", path)
}

#[tokio::test(start_paused = true)]
async fn two_tokens_every_three_seconds_timeline() {
    let store = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store)
        .bucket_clock(MonotonicClock::default())
        .build()
        .unwrap();
    let limiter = registry.get_or_create(key("10.0.0.7", "/movies"), RateLimiterConfig::default());
    let start = Instant::now();

    // (offset ms, expected to pass)
    let timeline =
        [(0, true), (500, true), (1_000, false), (3_100, true), (5_000, false), (7_000, true), (7_100, false)];

    for (offset, allowed) in timeline {
        tokio::time::sleep_until(start + Duration::from_millis(offset)).await;
        let result = limiter.limit().await;
        if allowed {
            assert!(result.is_ok(), "request at {offset}ms should pass, got {result:?}");
        } else {
            let err = result.expect_err(&format!("request at {offset}ms should be limited"));
            assert!(err.is_rate_limited());
            assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
            assert_eq!(err.retry_after_header().as_deref(), Some("3"));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn callers_and_routes_have_independent_buckets() {
    let store = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store.clone()).build().unwrap();
    let config = RateLimiterConfig::default();

    let a = registry.get_or_create(key("a", "/movies"), config);
    a.limit().await.unwrap();
    a.limit().await.unwrap();
    assert!(a.limit().await.unwrap_err().is_rate_limited());

    let b = registry.get_or_create(key("b", "/movies"), config);
    let other_route = registry.get_or_create(key("a", "/theaters"), config);
    assert!(b.limit().await.is_ok());
    assert!(other_route.limit().await.is_ok());

    assert_eq!(registry.len(), 3);
    assert!(store.get("movie:rl:a:GET:/movies").await.unwrap().is_some());
    assert!(store.get("movie:rl:b:GET:/movies").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn reclaimed_entry_keeps_its_shared_state() {
    // Frozen clock: no refill, no store expiry.
    let clock = ManualClock::starting_at(1_000);
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let registry = RateLimiterRegistry::builder(store).bucket_clock(clock).build().unwrap();

    let limiter = registry.get_or_create(key("a", "/movies"), RateLimiterConfig::default());
    limiter.take(2).await.unwrap();
    drop(limiter);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(registry.is_empty(), "idle entry should be reclaimed");
    assert_eq!(registry.reclaim_expired(), 0);

    let again = registry.get_or_create(key("a", "/movies"), RateLimiterConfig::default());
    assert!(again.limit().await.unwrap_err().is_rate_limited());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_takes_never_overspend() {
    let store = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store)
        .bucket_clock(ManualClock::starting_at(1_000))
        .build()
        .unwrap();
    let config = RateLimiterConfig::new(5, Duration::from_secs(60)).unwrap();
    let limiter = registry.get_or_create(key("burst", "/movies"), config);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.limit().await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => allowed += 1,
            Err(err) => assert!(err.is_rate_limited(), "unexpected error {err:?}"),
        }
    }
    assert_eq!(allowed, 5);
}

#[tokio::test(start_paused = true)]
async fn held_lock_times_out_as_backend_failure() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store.clone()).build().unwrap();
    let k = key("a", "/movies");
    let limiter = registry.get_or_create(k.clone(), RateLimiterConfig::default());

    let other_instance = StoreLock::new(store.clone(), LockConfig::default());
    let held = other_instance.acquire(&k.lock_key()).await.unwrap();

    let err = limiter.limit().await.unwrap_err();
    assert!(matches!(err, LimitError::LockAcquisitionFailed { .. }));
    assert!(err.is_backend_failure());
    assert!(!err.is_rate_limited());

    held.release().await.unwrap();
    assert!(limiter.limit().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancelled_take_leaves_no_lock_behind() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store.clone()).build().unwrap();
    let k = key("a", "/movies");
    let limiter = registry.get_or_create(k.clone(), RateLimiterConfig::default());

    let held = StoreLock::new(store.clone(), LockConfig::default())
        .acquire(&k.lock_key())
        .await
        .unwrap();
    // the waiting take is dropped mid-poll
    let cancelled = tokio::time::timeout(Duration::from_millis(50), limiter.limit()).await;
    assert!(cancelled.is_err());
    held.release().await.unwrap();

    let started = Instant::now();
    limiter.limit().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(10), "lock should be free immediately");
    assert!(store.get(&k.lock_key()).await.unwrap().is_none());
}

/// Store whose compare-and-delete answers slowly.
#[derive(Debug)]
struct SlowRelease(InMemoryStore);

#[async_trait::async_trait]
impl StateStore for SlowRelease {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.0.get(key).await
    }
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.0.set(key, value, ttl).await
    }
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.0.set_nx(key, value, ttl).await
    }
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.0.delete_if_eq(key, expected).await
    }
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.0.delete(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn take_cancelled_during_unlock_frees_the_lock() {
    let inner = InMemoryStore::new();
    let registry = RateLimiterRegistry::builder(Arc::new(SlowRelease(inner.clone())))
        .bucket_clock(MonotonicClock::default())
        .build()
        .unwrap();
    let k = key("a", "/movies");
    let limiter = registry.get_or_create(k.clone(), RateLimiterConfig::default());

    let cancelled = tokio::time::timeout(Duration::from_millis(50), limiter.limit()).await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(inner.get(&k.lock_key()).await.unwrap().is_none());
    limiter.limit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reset_refills_the_bucket() {
    let store = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store).build().unwrap();
    let limiter = registry.get_or_create(key("a", "/movies"), RateLimiterConfig::default());

    limiter.take(2).await.unwrap();
    assert!(limiter.limit().await.is_err());
    limiter.reset().await.unwrap();
    limiter.take(2).await.unwrap();
}

#[tokio::test]
async fn store_outage_is_reported_not_treated_as_limit() {
    let store = Arc::new(InMemoryStore::new());
    let registry = RateLimiterRegistry::builder(store.clone()).build().unwrap();
    let limiter = registry.get_or_create(key("a", "/movies"), RateLimiterConfig::default());

    store.set_unavailable(true);
    let err = limiter.limit().await.unwrap_err();
    assert!(err.is_backend_failure());
    assert_eq!(err.retry_after(), None);

    store.set_unavailable(false);
    assert!(limiter.limit().await.is_ok());
}
