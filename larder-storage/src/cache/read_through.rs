//! Read-through cache with stale-while-revalidate.
//!
//! A lookup serves whatever the cache holds and refreshes it in the
//! background. Only a miss waits for the fetcher. The [`RevalidatePolicy`]
//! decides whether an entry past its TTL still counts as a hit.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use larder_core::{now_millis, LarderResult, RevalidatePolicy, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::expiring::ExpiringCache;
use super::freshness::CacheRead;
use super::stats::{CacheCounters, CacheStats};
use crate::backend::StorageProvider;
use crate::engine::StoreEngine;

/// (partition, key) pairs with a refresh in flight.
type InFlight = Arc<Mutex<HashSet<(String, String)>>>;

/// Clears an in-flight slot when the refresh task ends, however it ends.
struct InFlightGuard {
    in_flight: InFlight,
    slot: (String, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.slot);
        }
    }
}

/// Stale-while-revalidate cache over TTL partitions of one engine.
pub struct ReadThroughCache<P: StorageProvider> {
    engine: StoreEngine<P>,
    partition: Arc<str>,
    policy: RevalidatePolicy,
    counters: Arc<CacheCounters>,
    in_flight: InFlight,
}

impl<P: StorageProvider> Clone for ReadThroughCache<P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            partition: Arc::clone(&self.partition),
            policy: self.policy,
            counters: Arc::clone(&self.counters),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<P: StorageProvider> std::fmt::Debug for ReadThroughCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("partition", &self.partition)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<P: StorageProvider> ReadThroughCache<P> {
    /// Create a cache whose default partition is `partition`.
    pub fn new(
        engine: StoreEngine<P>,
        partition: &str,
        policy: RevalidatePolicy,
    ) -> LarderResult<Self> {
        let counters = Arc::new(CacheCounters::new());
        // fail fast on a partition that cannot hold TTL entries
        ExpiringCache::with_counters(engine.clone(), partition, Arc::clone(&counters))?;
        Ok(Self {
            engine,
            partition: Arc::from(partition),
            policy,
            counters,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn policy(&self) -> RevalidatePolicy {
        self.policy
    }

    pub fn engine(&self) -> &StoreEngine<P> {
        &self.engine
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// TTL view of `partition` sharing this cache's counters.
    pub fn expiring(&self, partition: &str) -> LarderResult<ExpiringCache<P>> {
        ExpiringCache::with_counters(self.engine.clone(), partition, Arc::clone(&self.counters))
    }

    /// Look up `key` in the default partition.
    pub async fn get<T, F, Fut>(&self, key: &str, fetcher: F, ttl: Duration) -> LarderResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = LarderResult<T>> + Send + 'static,
    {
        let partition = Arc::clone(&self.partition);
        self.stale_while_revalidate(key, fetcher, ttl, &partition)
            .await
    }

    /// Serve `key` from `partition`, refreshing it with `fetcher`.
    ///
    /// - A usable cached value is returned at once and `fetcher` runs in a
    ///   spawned task that writes its result with `ttl`. A failing refresh is
    ///   logged and counted, never returned. At most one refresh per key is
    ///   in flight; further hits skip it.
    /// - Otherwise `fetcher` is awaited, its result written with `ttl` and
    ///   returned. Its error is returned as is.
    ///
    /// Under [`RevalidatePolicy::ServeStale`] every cached value is usable;
    /// under [`RevalidatePolicy::WithinTtl`] only unexpired ones are.
    pub async fn stale_while_revalidate<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Duration,
        partition: &str,
    ) -> LarderResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = LarderResult<T>> + Send + 'static,
    {
        let cache = self.expiring(partition)?;

        let usable = match (self.policy, cache.peek(key).await?) {
            (RevalidatePolicy::ServeStale, entry) => entry,
            (RevalidatePolicy::WithinTtl, entry) => {
                entry.filter(|e| !e.is_expired_at(now_millis()))
            }
        };

        if let Some(entry) = usable {
            match serde_json::from_value::<T>(entry.data.clone()) {
                Ok(value) => {
                    CacheCounters::bump(&self.counters.hits);
                    let refresh = self.spawn_refresh(cache, key, fetcher, ttl)?;
                    return Ok(CacheRead::from_cache(value, &entry, refresh));
                }
                // an entry of another shape is replaced like a miss
                Err(e) => warn!(
                    error = %e,
                    partition = %partition,
                    key = %key,
                    "Cached value does not decode, refetching"
                ),
            }
        }

        CacheCounters::bump(&self.counters.misses);
        let value = fetcher().await?;
        let data = serde_json::to_value(&value)?;
        let entry = cache.set_cache(key, &data, ttl).await?;
        Ok(CacheRead::from_fetch(value, &entry))
    }

    fn spawn_refresh<T, F, Fut>(
        &self,
        cache: ExpiringCache<P>,
        key: &str,
        fetcher: F,
        ttl: Duration,
    ) -> LarderResult<Option<JoinHandle<()>>>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = LarderResult<T>> + Send + 'static,
    {
        let slot = (cache.partition().to_string(), key.to_string());
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?;
            if !in_flight.insert(slot.clone()) {
                debug!(partition = %slot.0, key = %slot.1, "Refresh already in flight");
                return Ok(None);
            }
        }

        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            slot,
        };
        let counters = Arc::clone(&self.counters);
        let key = key.to_string();

        Ok(Some(tokio::spawn(async move {
            let _guard = guard;
            let outcome = match fetcher().await.and_then(|value| Ok(serde_json::to_value(value)?)) {
                Ok(data) => cache.set_cache(&key, &data, ttl).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => CacheCounters::bump(&counters.refreshes),
                Err(e) => {
                    CacheCounters::bump(&counters.refresh_failures);
                    warn!(
                        error = %e,
                        partition = %cache.partition(),
                        key = %key,
                        "Background refresh failed"
                    );
                }
            }
        })))
    }

    /// The live value for `key` in `partition`, honoring its TTL.
    pub async fn get_cached<T: DeserializeOwned>(
        &self,
        key: &str,
        partition: &str,
    ) -> LarderResult<Option<T>> {
        self.expiring(partition)?.get_cache(key).await
    }

    /// Write `value` for `key` in `partition` with `ttl`.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        partition: &str,
    ) -> LarderResult<()> {
        self.expiring(partition)?.set_cache(key, value, ttl).await?;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str, partition: &str) -> LarderResult<bool> {
        self.expiring(partition)?.invalidate(key).await
    }
}
