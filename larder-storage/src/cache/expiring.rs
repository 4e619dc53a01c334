//! TTL cache over one store partition.
//!
//! Entries are stored as `{ key, value: { data, timestamp, expiresAt } }` and
//! expire once `now > expiresAt`. Expired entries are removed two ways: a read
//! that finds one deletes it before reporting a miss, and
//! [`ExpiringCache::clear_expired_cache`] sweeps the `expiresAt` index.

use std::sync::Arc;
use std::time::Duration;

use larder_core::{
    now_millis, CacheEntry, CacheRecord, KeyRange, LarderResult, StorageError, TimestampMs,
    CACHE_KEY_PATH, EXPIRES_AT_INDEX, EXPIRES_AT_PATH,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::stats::{CacheCounters, CacheStats};
use crate::backend::StorageProvider;
use crate::engine::StoreEngine;

/// TTL-governed view of one partition.
pub struct ExpiringCache<P: StorageProvider> {
    engine: StoreEngine<P>,
    partition: Arc<str>,
    counters: Arc<CacheCounters>,
}

impl<P: StorageProvider> Clone for ExpiringCache<P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            partition: Arc::clone(&self.partition),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<P: StorageProvider> std::fmt::Debug for ExpiringCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl<P: StorageProvider> ExpiringCache<P> {
    /// Wrap `partition` without sweeping. The partition must be keyed by
    /// `key` and declare the `expiresAt` index on `value.expiresAt`, as
    /// [`PartitionSchema::expiring_cache`](larder_core::PartitionSchema::expiring_cache) does.
    pub fn new(engine: StoreEngine<P>, partition: &str) -> LarderResult<Self> {
        Self::with_counters(engine, partition, Arc::new(CacheCounters::new()))
    }

    pub(crate) fn with_counters(
        engine: StoreEngine<P>,
        partition: &str,
        counters: Arc<CacheCounters>,
    ) -> LarderResult<Self> {
        let declared = engine
            .schema()
            .partition(partition)
            .ok_or_else(|| StorageError::UnknownPartition {
                partition: partition.to_string(),
            })?;
        if declared.key_path != CACHE_KEY_PATH {
            return Err(StorageError::InvalidKey {
                partition: partition.to_string(),
                key_path: declared.key_path.clone(),
                reason: format!("TTL partitions are keyed by `{CACHE_KEY_PATH}`"),
            }
            .into());
        }
        let index = declared
            .index(EXPIRES_AT_INDEX)
            .ok_or_else(|| StorageError::UnknownIndex {
                partition: partition.to_string(),
                index: EXPIRES_AT_INDEX.to_string(),
            })?;
        // the sweep scans this index, so it must cover the stored expiry
        if index.key_path != EXPIRES_AT_PATH {
            return Err(StorageError::InvalidKey {
                partition: partition.to_string(),
                key_path: index.key_path.clone(),
                reason: format!("the `{EXPIRES_AT_INDEX}` index must be on `{EXPIRES_AT_PATH}`"),
            }
            .into());
        }

        Ok(Self {
            engine,
            partition: Arc::from(partition),
            counters,
        })
    }

    /// Wrap `partition` and remove whatever already expired.
    pub async fn open(engine: StoreEngine<P>, partition: &str) -> LarderResult<Self> {
        let cache = Self::new(engine, partition)?;
        cache.clear_expired_cache().await?;
        Ok(cache)
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn engine(&self) -> &StoreEngine<P> {
        &self.engine
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &Arc<CacheCounters> {
        &self.counters
    }

    /// Store `data` under `key` for `ttl`, replacing any previous entry.
    pub async fn set_cache<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        ttl: Duration,
    ) -> LarderResult<CacheEntry> {
        self.set_cache_at(key, data, ttl, now_millis()).await
    }

    /// [`set_cache`](Self::set_cache) with an explicit creation time.
    pub async fn set_cache_at<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        ttl: Duration,
        now: TimestampMs,
    ) -> LarderResult<CacheEntry> {
        let entry = CacheEntry::new(serde_json::to_value(data)?, now, ttl);
        let record = CacheRecord::new(key, entry.clone()).to_json()?;
        self.engine.put(&self.partition, record).await?;
        Ok(entry)
    }

    /// The stored entry, expired or not. Never evicts.
    pub async fn peek(&self, key: &str) -> LarderResult<Option<CacheEntry>> {
        match self.engine.get(&self.partition, key).await? {
            Some(record) => Ok(Some(CacheRecord::from_json(record)?.value)),
            None => Ok(None),
        }
    }

    /// The live entry for `key`. An expired entry is deleted and reported
    /// as a miss.
    pub async fn get_entry(&self, key: &str) -> LarderResult<Option<CacheEntry>> {
        self.get_entry_at(key, now_millis()).await
    }

    /// [`get_entry`](Self::get_entry) as of `now`.
    pub async fn get_entry_at(
        &self,
        key: &str,
        now: TimestampMs,
    ) -> LarderResult<Option<CacheEntry>> {
        let Some(entry) = self.peek(key).await? else {
            CacheCounters::bump(&self.counters.misses);
            return Ok(None);
        };

        if entry.is_expired_at(now) {
            self.engine.delete(&self.partition, key).await?;
            CacheCounters::bump(&self.counters.lazy_evictions);
            CacheCounters::bump(&self.counters.misses);
            debug!(
                partition = %self.partition,
                key = %key,
                expires_at = entry.expires_at,
                "Evicted expired cache entry on read"
            );
            return Ok(None);
        }

        CacheCounters::bump(&self.counters.hits);
        Ok(Some(entry))
    }

    /// The live data for `key`, decoded as `T`.
    pub async fn get_cache<T: DeserializeOwned>(&self, key: &str) -> LarderResult<Option<T>> {
        match self.get_entry(key).await? {
            Some(entry) => Ok(Some(serde_json::from_value(entry.data)?)),
            None => Ok(None),
        }
    }

    /// Remove `key` regardless of expiry. Returns whether it existed.
    pub async fn invalidate(&self, key: &str) -> LarderResult<bool> {
        self.engine.delete(&self.partition, key).await
    }

    /// Delete every entry with `expiresAt <= now`, oldest first. Returns the
    /// number removed.
    pub async fn clear_expired_cache(&self) -> LarderResult<u64> {
        self.clear_expired_at(now_millis()).await
    }

    /// [`clear_expired_cache`](Self::clear_expired_cache) as of `now`.
    pub async fn clear_expired_at(&self, now: TimestampMs) -> LarderResult<u64> {
        let removed = self
            .engine
            .delete_range(&self.partition, EXPIRES_AT_INDEX, &KeyRange::at_most(now))
            .await?;
        CacheCounters::add(&self.counters.swept, removed);
        Ok(removed)
    }

    /// Entries with `expiresAt <= now`, ascending by expiry.
    pub async fn expired_at(&self, now: TimestampMs) -> LarderResult<Vec<CacheRecord>> {
        self.engine
            .query(&self.partition, EXPIRES_AT_INDEX, &KeyRange::at_most(now))
            .await?
            .into_iter()
            .map(|record| CacheRecord::from_json(record).map_err(Into::into))
            .collect()
    }
}
