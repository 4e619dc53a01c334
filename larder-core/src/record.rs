//! Persisted layout of TTL cache records.
//!
//! On disk a cache record is `{ key, value: { data, timestamp, expiresAt } }`.
//! The outer wrapper belongs to the storage contract; the inner fields are
//! the cache entry itself. Timestamps are epoch milliseconds.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Epoch milliseconds.
pub type TimestampMs = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Convert a TTL to milliseconds, saturating.
pub fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// A cache entry as stored under `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Value,
    /// Creation time.
    pub timestamp: TimestampMs,
    /// Always `timestamp + ttl`.
    pub expires_at: TimestampMs,
}

impl CacheEntry {
    pub fn new(data: Value, created_at: TimestampMs, ttl: Duration) -> Self {
        Self {
            data,
            timestamp: created_at,
            expires_at: created_at.saturating_add(ttl_millis(ttl)),
        }
    }

    /// Logically dead once `now > expiresAt`.
    pub fn is_expired_at(&self, now: TimestampMs) -> bool {
        now > self.expires_at
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(self.timestamp).max(0) as u64)
    }
}

/// The full record stored in a cache partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub value: CacheEntry,
}

impl CacheRecord {
    pub fn new(key: impl Into<String>, entry: CacheEntry) -> Self {
        Self {
            key: key.into(),
            value: entry,
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
