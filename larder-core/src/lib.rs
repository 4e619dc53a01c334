//! LARDER Core - Shared Types
//!
//! Schema declarations, keys and key ranges, the persisted cache record
//! layout, configuration and the error taxonomy. Storage behavior lives in
//! larder-storage.

pub mod config;
pub mod error;
pub mod key;
pub mod record;
pub mod schema;

pub use config::{FacadeTtls, RevalidatePolicy, StoreConfig};
pub use error::{ConfigError, FetchError, LarderError, LarderResult, SchemaError, StorageError};
pub use key::{resolve_path, KeyRange, KeyValue};
pub use record::{now_millis, ttl_millis, CacheEntry, CacheRecord, TimestampMs};
pub use schema::{
    plan_upgrade, IndexSchema, PartitionSchema, SchemaCatalog, StoreSchema, UpgradePlan,
    CACHE_KEY_PATH, EXPIRES_AT_INDEX, EXPIRES_AT_PATH,
};

/// A stored record. Partitions hold arbitrary structured values.
pub type Record = serde_json::Value;
