//! Named domain caches.
//!
//! A facade is a fixed (name, partition, TTL) over a [`ReadThroughCache`].
//! Facades share one TTL partition; their keys are stored as
//! `<facade>:<key>` so they never collide.

use std::future::Future;
use std::time::Duration;

use larder_core::{FacadeTtls, LarderResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::freshness::CacheRead;
use super::read_through::ReadThroughCache;
use crate::backend::StorageProvider;

pub const PRODUCTS: &str = "products";
pub const SESSIONS: &str = "sessions";
pub const PROFILES: &str = "profiles";
pub const REFERRALS: &str = "referrals";
pub const FLAGS: &str = "flags";

/// One named cache with a fixed TTL.
pub struct CacheFacade<P: StorageProvider> {
    name: String,
    partition: String,
    ttl: Duration,
    cache: ReadThroughCache<P>,
}

impl<P: StorageProvider> Clone for CacheFacade<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            partition: self.partition.clone(),
            ttl: self.ttl,
            cache: self.cache.clone(),
        }
    }
}

impl<P: StorageProvider> std::fmt::Debug for CacheFacade<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFacade")
            .field("name", &self.name)
            .field("partition", &self.partition)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<P: StorageProvider> CacheFacade<P> {
    /// A facade over the cache's default partition.
    pub fn new(cache: ReadThroughCache<P>, name: impl Into<String>, ttl: Duration) -> Self {
        let partition = cache.partition().to_string();
        Self {
            name: name.into(),
            partition,
            ttl,
            cache,
        }
    }

    /// Place the facade in another TTL partition.
    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn products(cache: ReadThroughCache<P>, ttls: &FacadeTtls) -> Self {
        Self::new(cache, PRODUCTS, ttls.products)
    }

    pub fn sessions(cache: ReadThroughCache<P>, ttls: &FacadeTtls) -> Self {
        Self::new(cache, SESSIONS, ttls.sessions)
    }

    pub fn profiles(cache: ReadThroughCache<P>, ttls: &FacadeTtls) -> Self {
        Self::new(cache, PROFILES, ttls.profiles)
    }

    pub fn referrals(cache: ReadThroughCache<P>, ttls: &FacadeTtls) -> Self {
        Self::new(cache, REFERRALS, ttls.referrals)
    }

    pub fn flags(cache: ReadThroughCache<P>, ttls: &FacadeTtls) -> Self {
        Self::new(cache, FLAGS, ttls.flags)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stored key for `key`.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    /// Write `value` with the facade TTL.
    pub async fn cache<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> LarderResult<()> {
        self.cache
            .put(&self.storage_key(key), value, self.ttl, &self.partition)
            .await
    }

    /// The live value for `key`, if any.
    pub async fn get_cached<T: DeserializeOwned>(&self, key: &str) -> LarderResult<Option<T>> {
        self.cache
            .get_cached(&self.storage_key(key), &self.partition)
            .await
    }

    /// Stale-while-revalidate lookup with the facade TTL.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, fetcher: F) -> LarderResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = LarderResult<T>> + Send + 'static,
    {
        self.cache
            .stale_while_revalidate(&self.storage_key(key), fetcher, self.ttl, &self.partition)
            .await
    }

    pub async fn invalidate(&self, key: &str) -> LarderResult<bool> {
        self.cache
            .invalidate(&self.storage_key(key), &self.partition)
            .await
    }
}

/// The standard set of domain facades.
pub struct DomainCaches<P: StorageProvider> {
    pub products: CacheFacade<P>,
    pub sessions: CacheFacade<P>,
    pub profiles: CacheFacade<P>,
    pub referrals: CacheFacade<P>,
    pub flags: CacheFacade<P>,
}

impl<P: StorageProvider> DomainCaches<P> {
    pub fn new(cache: &ReadThroughCache<P>, ttls: &FacadeTtls) -> Self {
        Self {
            products: CacheFacade::products(cache.clone(), ttls),
            sessions: CacheFacade::sessions(cache.clone(), ttls),
            profiles: CacheFacade::profiles(cache.clone(), ttls),
            referrals: CacheFacade::referrals(cache.clone(), ttls),
            flags: CacheFacade::flags(cache.clone(), ttls),
        }
    }
}

impl<P: StorageProvider> std::fmt::Debug for DomainCaches<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainCaches")
            .field("products", &self.products)
            .field("sessions", &self.sessions)
            .field("profiles", &self.profiles)
            .field("referrals", &self.referrals)
            .field("flags", &self.flags)
            .finish()
    }
}

impl<P: StorageProvider> Clone for DomainCaches<P> {
    fn clone(&self) -> Self {
        Self {
            products: self.products.clone(),
            sessions: self.sessions.clone(),
            profiles: self.profiles.clone(),
            referrals: self.referrals.clone(),
            flags: self.flags.clone(),
        }
    }
}
