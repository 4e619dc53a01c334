//! Cache layers built on the store engine.
//!
//! - [`ExpiringCache`]: TTL entries in one partition, evicted lazily on read
//!   and actively by [`ExpiringCache::clear_expired_cache`].
//! - [`ReadThroughCache`]: stale-while-revalidate over TTL partitions.
//! - [`CacheFacade`]: a named cache with a fixed TTL.
//! - [`ExpirySweeper`]: background task that sweeps a TTL partition.
//!
//! # Example
//!
//! ```ignore
//! let cache = ReadThroughCache::new(engine, "cache", RevalidatePolicy::ServeStale)?;
//!
//! // First call waits for the fetcher, later calls answer from the cache
//! // and refresh in the background.
//! let read = cache.get("p1", move || fetch_product("p1"), Duration::from_secs(300)).await?;
//! if read.was_cache_hit() && read.is_expired() {
//!     tracing::debug!("Served a stale product");
//! }
//! ```

pub mod expiring;
pub mod facade;
pub mod freshness;
pub mod read_through;
pub mod stats;
pub mod sweeper;

pub use expiring::ExpiringCache;
pub use facade::{CacheFacade, DomainCaches};
pub use freshness::CacheRead;
pub use read_through::ReadThroughCache;
pub use stats::{CacheCounters, CacheStats};
pub use sweeper::{
    expiry_sweep_task, ExpirySweeper, SweeperMetrics, SweeperSnapshot, MIN_SWEEP_INTERVAL,
};
