//! LARDER Storage - Partitioned Store and Caches
//!
//! A schema-declared, partitioned key-value store with secondary indexes,
//! plus the caching strategies built on it: a TTL cache with lazy and active
//! eviction, a stale-while-revalidate read-through cache, and named domain
//! facades. Storage is pluggable; an in-memory and an LMDB provider ship
//! with the crate.

pub mod backend;
pub mod cache;
pub mod engine;
pub mod store;

pub use backend::{
    ConfiguredConnection, ConfiguredProvider, Connection, LmdbConnection, LmdbError,
    LmdbProvider, MemoryConnection, MemoryProvider, StorageProvider, WriteMode,
};
pub use cache::{
    expiry_sweep_task, CacheCounters, CacheFacade, CacheRead, CacheStats, DomainCaches,
    ExpiringCache, ExpirySweeper, ReadThroughCache, SweeperMetrics, SweeperSnapshot,
};
pub use engine::StoreEngine;
pub use store::LarderStore;
