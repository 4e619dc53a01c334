//! Everything a host needs, opened from one [`StoreConfig`].

use larder_core::{ConfigError, LarderResult, PartitionSchema, StoreConfig, StoreSchema};

use crate::backend::ConfiguredProvider;
use crate::cache::{DomainCaches, ExpiringCache, ExpirySweeper, ReadThroughCache};
use crate::engine::StoreEngine;

/// Engine, TTL cache, read-through cache and domain facades over one store.
#[derive(Debug)]
pub struct LarderStore {
    config: StoreConfig,
    engine: StoreEngine<ConfiguredProvider>,
    expiring: ExpiringCache<ConfiguredProvider>,
    read_through: ReadThroughCache<ConfiguredProvider>,
    facades: DomainCaches<ConfiguredProvider>,
}

impl LarderStore {
    /// Open the store described by `config` with `schema`.
    ///
    /// `schema` must declare `config.cache_partition` as a TTL partition.
    /// Expired entries are swept once before returning.
    pub async fn open(config: StoreConfig, schema: StoreSchema) -> LarderResult<Self> {
        config.validate()?;

        let declares_cache = schema
            .partition(&config.cache_partition)
            .is_some_and(PartitionSchema::is_expiring_cache);
        if !declares_cache {
            return Err(ConfigError::InvalidValue {
                field: "cache_partition".to_string(),
                value: config.cache_partition.clone(),
                reason: "schema does not declare it as a TTL partition".to_string(),
            }
            .into());
        }

        let engine = StoreEngine::new(ConfiguredProvider::from_config(&config), schema)?;
        let read_through = ReadThroughCache::new(
            engine.clone(),
            &config.cache_partition,
            config.revalidate_policy,
        )?;
        let expiring = read_through.expiring(&config.cache_partition)?;
        expiring.clear_expired_cache().await?;
        let facades = DomainCaches::new(&read_through, &config.facade_ttls);

        Ok(Self {
            config,
            engine,
            expiring,
            read_through,
            facades,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn engine(&self) -> &StoreEngine<ConfiguredProvider> {
        &self.engine
    }

    pub fn expiring(&self) -> &ExpiringCache<ConfiguredProvider> {
        &self.expiring
    }

    pub fn read_through(&self) -> &ReadThroughCache<ConfiguredProvider> {
        &self.read_through
    }

    pub fn facades(&self) -> &DomainCaches<ConfiguredProvider> {
        &self.facades
    }

    /// Start sweeping the cache partition every `config.sweep_interval`.
    pub fn spawn_sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::spawn(self.expiring.clone(), self.config.sweep_interval)
    }

    pub async fn close(&self) {
        self.engine.close().await;
    }

    pub async fn delete_all(&self) -> LarderResult<()> {
        self.engine.delete_all().await
    }
}
