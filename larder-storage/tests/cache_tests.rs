//! TTL cache, read-through cache and facade scenarios.

use std::time::Duration;

use larder_core::{now_millis, CacheRecord, FacadeTtls, KeyRange, RevalidatePolicy, EXPIRES_AT_INDEX};
use larder_storage::{DomainCaches, ExpiringCache, ReadThroughCache};
use larder_test_utils::fetchers::CountingFetcher;
use larder_test_utils::fixtures::{self, CACHE};
use larder_test_utils::{LarderError, LarderResult};
use serde_json::json;

#[tokio::test]
async fn entry_is_served_until_ttl_then_evicted() -> LarderResult<()> {
    let cache = ExpiringCache::open(fixtures::memory_engine(), CACHE).await?;

    cache
        .set_cache("p1", &json!({"name": "Widget"}), Duration::from_millis(100))
        .await?;
    let hit: Option<serde_json::Value> = cache.get_cache("p1").await?;
    assert_eq!(hit, Some(json!({"name": "Widget"})));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let miss: Option<serde_json::Value> = cache.get_cache("p1").await?;
    assert_eq!(miss, None);

    // the read deleted the record, not just hid it
    assert_eq!(cache.engine().get(CACHE, "p1").await?, None);
    assert_eq!(cache.stats().lazy_evictions, 1);
    Ok(())
}

#[tokio::test]
async fn persisted_layout_round_trips() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    let cache = ExpiringCache::new(engine.clone(), CACHE)?;
    cache
        .set_cache_at("p1", &json!({"name": "Widget"}), Duration::from_millis(1000), 5_000)
        .await?;

    let raw = engine.get(CACHE, "p1").await?;
    assert_eq!(
        raw,
        Some(json!({
            "key": "p1",
            "value": {"data": {"name": "Widget"}, "timestamp": 5_000, "expiresAt": 6_000}
        }))
    );
    Ok(())
}

#[tokio::test]
async fn clear_expired_removes_exactly_the_expired() -> LarderResult<()> {
    let cache = ExpiringCache::new(fixtures::memory_engine(), CACHE)?;
    let now = now_millis();

    cache.set_cache_at("past", &1, Duration::from_millis(10), now - 1_000).await?;
    cache.set_cache_at("edge", &2, Duration::ZERO, now).await?;
    cache.set_cache_at("future", &3, Duration::from_secs(60), now).await?;

    let removed = cache.clear_expired_at(now).await?;
    assert_eq!(removed, 2);
    assert!(cache.peek("past").await?.is_none());
    assert!(cache.peek("edge").await?.is_none());
    assert!(cache.peek("future").await?.is_some());

    assert_eq!(cache.clear_expired_at(now).await?, 0);
    Ok(())
}

#[tokio::test]
async fn expiry_query_is_ascending_and_bounded() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    let cache = ExpiringCache::new(engine.clone(), CACHE)?;

    for (key, ttl) in [("c", 300), ("a", 100), ("late", 10_000), ("b", 200)] {
        cache.set_cache_at(key, &key, Duration::from_millis(ttl), 0).await?;
    }

    let expired = engine
        .query(CACHE, EXPIRES_AT_INDEX, &KeyRange::at_most(1_000))
        .await?;
    let records: Vec<CacheRecord> = expired
        .into_iter()
        .map(CacheRecord::from_json)
        .collect::<Result<_, _>>()?;

    let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(records.windows(2).all(|w| w[0].value.expires_at <= w[1].value.expires_at));
    assert!(records.iter().all(|r| r.value.expires_at <= 1_000));
    Ok(())
}

#[tokio::test]
async fn stale_while_revalidate_three_calls() -> LarderResult<()> {
    let cache = ReadThroughCache::new(fixtures::memory_engine(), CACHE, RevalidatePolicy::ServeStale)?;
    let fetch_a = CountingFetcher::new();
    let fetch_b = CountingFetcher::new();
    let fetch_c = CountingFetcher::new();
    let ttl = Duration::from_secs(60);

    // empty cache: waits for A and persists it
    let first = cache
        .stale_while_revalidate("k", fetch_a.returning("A".to_string()), ttl, CACHE)
        .await?;
    assert!(first.was_cache_miss());
    assert_eq!(first.value(), "A");
    assert_eq!(fetch_a.calls(), 1);

    // A is served at once while B is fetched in the background
    let mut second = cache
        .stale_while_revalidate("k", fetch_b.returning("B".to_string()), ttl, CACHE)
        .await?;
    assert!(second.was_cache_hit());
    assert_eq!(second.value(), "A");
    second.wait_for_refresh().await;
    assert_eq!(fetch_b.calls(), 1);

    let mut third = cache
        .stale_while_revalidate("k", fetch_c.returning("C".to_string()), ttl, CACHE)
        .await?;
    assert_eq!(third.value(), "B");
    third.wait_for_refresh().await;
    Ok(())
}

#[tokio::test]
async fn miss_path_failure_propagates_and_writes_nothing() -> LarderResult<()> {
    let cache = ReadThroughCache::new(fixtures::memory_engine(), CACHE, RevalidatePolicy::default())?;
    let fetcher = CountingFetcher::new();

    let result = cache
        .get("k", fetcher.failing::<String>("k", "backend down"), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(LarderError::Fetch(_))));
    assert_eq!(cache.engine().count(CACHE).await?, 0);
    Ok(())
}

#[tokio::test]
async fn background_failure_keeps_cached_value() -> LarderResult<()> {
    let cache = ReadThroughCache::new(fixtures::memory_engine(), CACHE, RevalidatePolicy::default())?;
    cache.put("k", "A", Duration::from_secs(60), CACHE).await?;

    let fetcher = CountingFetcher::new();
    let mut read = cache
        .get("k", fetcher.failing::<String>("k", "backend down"), Duration::from_secs(60))
        .await?;
    assert_eq!(read.value(), "A");
    read.wait_for_refresh().await;

    assert_eq!(fetcher.calls(), 1);
    let still: Option<String> = cache.get_cached("k", CACHE).await?;
    assert_eq!(still.as_deref(), Some("A"));
    assert_eq!(cache.stats().refresh_failures, 1);
    Ok(())
}

#[tokio::test]
async fn serve_stale_serves_expired_entries() -> LarderResult<()> {
    let cache = ReadThroughCache::new(fixtures::memory_engine(), CACHE, RevalidatePolicy::ServeStale)?;
    cache.put("k", "old", Duration::from_millis(1), CACHE).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fetcher = CountingFetcher::new();
    let mut read = cache
        .get("k", fetcher.returning("new".to_string()), Duration::from_secs(60))
        .await?;
    assert!(read.was_cache_hit());
    assert_eq!(read.value(), "old");
    read.wait_for_refresh().await;

    let fresh: Option<String> = cache.get_cached("k", CACHE).await?;
    assert_eq!(fresh.as_deref(), Some("new"));
    Ok(())
}

#[tokio::test]
async fn facades_share_partition_with_distinct_keys() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    let cache = ReadThroughCache::new(engine.clone(), CACHE, RevalidatePolicy::default())?;
    let ttls = FacadeTtls {
        referrals: Duration::from_millis(1),
        ..FacadeTtls::default()
    };
    let caches = DomainCaches::new(&cache, &ttls);

    caches.products.cache("42", &json!({"name": "Widget"})).await?;
    caches.referrals.cache("42", &json!({"code": "R"})).await?;
    assert_eq!(engine.count(CACHE).await?, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let product: Option<serde_json::Value> = caches.products.get_cached("42").await?;
    let referral: Option<serde_json::Value> = caches.referrals.get_cached("42").await?;
    assert_eq!(product, Some(json!({"name": "Widget"})));
    assert_eq!(referral, None);
    assert!(engine.get(CACHE, "products:42").await?.is_some());
    Ok(())
}
