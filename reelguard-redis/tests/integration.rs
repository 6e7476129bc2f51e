use reelguard::{LimiterKey, RateLimiter, RateLimiterConfig, StateStore, TokenBucket};
use reelguard_redis::RedisStore;
use std::sync::Arc;
use std::time::Duration;

// Requires Redis running. If REELGUARD_TEST_REDIS_URL is unset, the tests skip.
async fn connect() -> Option<RedisStore> {
    let url = match std::env::var("REELGUARD_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set REELGUARD_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            return None;
        }
    };
    let store = RedisStore::connect(&url)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e));
    Some(store)
}

#[tokio::test]
async fn set_nx_and_compare_and_delete() {
    let Some(store) = connect().await else { return };
    let key = format!("reelguard-test:rll:{}", uuid::Uuid::new_v4());

    assert!(store.set_nx(&key, "owner-a", Duration::from_secs(5)).await.unwrap());
    assert!(!store.set_nx(&key, "owner-b", Duration::from_secs(5)).await.unwrap());
    assert!(!store.delete_if_eq(&key, "owner-b").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("owner-a"));
    assert!(store.delete_if_eq(&key, "owner-a").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn values_expire() {
    let Some(store) = connect().await else { return };
    let key = format!("reelguard-test:rl:{}", uuid::Uuid::new_v4());

    store.set(&key, "x", Duration::from_millis(50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn bucket_state_is_shared_between_instances() {
    let Some(store) = connect().await else { return };
    let store: Arc<dyn StateStore> = Arc::new(store);
    let prefix = format!("reelguard-test-{}", uuid::Uuid::new_v4());
    let key = LimiterKey::new(prefix, "10.0.0.7", "GET", "/movies");
    let config = RateLimiterConfig::new(2, Duration::from_secs(3)).unwrap();

    // Two buckets over one key behave like two service instances.
    let a = TokenBucket::new(key.clone(), config, store.clone());
    let b = TokenBucket::new(key.clone(), config, store.clone());

    a.limit().await.unwrap();
    b.limit().await.unwrap();
    let err = a.limit().await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

    store.delete(&key.state_key()).await.unwrap();
}
