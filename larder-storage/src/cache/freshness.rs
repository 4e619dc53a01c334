//! Read metadata for read-through lookups.
//!
//! A [`CacheRead`] carries the value together with when it was cached, when
//! it expires, whether it came from the cache, and the handle of the
//! background refresh a cache hit scheduled.

use chrono::{DateTime, Utc};
use larder_core::{CacheEntry, TimestampMs};
use std::time::Duration;
use tokio::task::JoinHandle;

fn to_datetime(ms: TimestampMs) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of a read-through lookup.
#[derive(Debug)]
pub struct CacheRead<T> {
    value: T,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    was_cache_hit: bool,
    refresh: Option<JoinHandle<()>>,
}

impl<T> CacheRead<T> {
    /// A value served from the cache.
    pub fn from_cache(value: T, entry: &CacheEntry, refresh: Option<JoinHandle<()>>) -> Self {
        Self {
            value,
            cached_at: to_datetime(entry.timestamp),
            expires_at: to_datetime(entry.expires_at),
            was_cache_hit: true,
            refresh,
        }
    }

    /// A value just fetched and written through as `entry`.
    pub fn from_fetch(value: T, entry: &CacheEntry) -> Self {
        Self {
            value,
            cached_at: to_datetime(entry.timestamp),
            expires_at: to_datetime(entry.expires_at),
            was_cache_hit: false,
            refresh: None,
        }
    }

    /// Consume the wrapper and return the underlying value.
    ///
    /// A pending background refresh keeps running.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// True once the entry's TTL has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Calculate how stale the data is.
    pub fn staleness(&self) -> Duration {
        (Utc::now() - self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether this read scheduled a background refresh.
    pub fn refresh_scheduled(&self) -> bool {
        self.refresh.is_some()
    }

    /// Wait until the scheduled refresh, if any, has finished.
    ///
    /// Refresh failures are already logged by the task itself.
    pub async fn wait_for_refresh(&mut self) {
        if let Some(handle) = self.refresh.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background refresh task did not complete");
            }
        }
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            expires_at: self.expires_at,
            was_cache_hit: self.was_cache_hit,
            refresh: self.refresh,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
