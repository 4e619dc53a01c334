//! Provider selected from [`StoreConfig`].

use async_trait::async_trait;
use larder_core::{KeyRange, KeyValue, Record, SchemaCatalog, StorageError, StoreConfig, StoreSchema};

use super::{
    Connection, LmdbConnection, LmdbProvider, MemoryConnection, MemoryProvider, StorageProvider,
    WriteMode,
};

/// Either built-in provider.
#[derive(Debug)]
pub enum ConfiguredProvider {
    Memory(MemoryProvider),
    Lmdb(LmdbProvider),
}

impl ConfiguredProvider {
    /// LMDB when `storage_path` is set, otherwise in-memory.
    pub fn from_config(config: &StoreConfig) -> Self {
        match &config.storage_path {
            Some(path) => Self::Lmdb(LmdbProvider::new(path.clone(), config.map_size_mb)),
            None => Self::Memory(MemoryProvider::new()),
        }
    }
}

#[derive(Debug)]
pub enum ConfiguredConnection {
    Memory(MemoryConnection),
    Lmdb(LmdbConnection),
}

macro_rules! dispatch {
    ($self:ident, $conn:ident => $body:expr) => {
        match $self {
            ConfiguredConnection::Memory($conn) => $body,
            ConfiguredConnection::Lmdb($conn) => $body,
        }
    };
}

#[async_trait]
impl StorageProvider for ConfiguredProvider {
    type Connection = ConfiguredConnection;

    fn name(&self) -> &'static str {
        match self {
            Self::Memory(p) => p.name(),
            Self::Lmdb(p) => p.name(),
        }
    }

    async fn open(&self, schema: &StoreSchema) -> Result<ConfiguredConnection, StorageError> {
        match self {
            Self::Memory(p) => p.open(schema).await.map(ConfiguredConnection::Memory),
            Self::Lmdb(p) => p.open(schema).await.map(ConfiguredConnection::Lmdb),
        }
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(p) => p.destroy().await,
            Self::Lmdb(p) => p.destroy().await,
        }
    }
}

#[async_trait]
impl Connection for ConfiguredConnection {
    fn catalog(&self) -> &SchemaCatalog {
        dispatch!(self, c => c.catalog())
    }

    async fn get(&self, partition: &str, key: &KeyValue) -> Result<Option<Record>, StorageError> {
        dispatch!(self, c => c.get(partition, key).await)
    }

    async fn get_all(&self, partition: &str) -> Result<Vec<Record>, StorageError> {
        dispatch!(self, c => c.get_all(partition).await)
    }

    async fn write(
        &self,
        partition: &str,
        record: Record,
        mode: WriteMode,
    ) -> Result<(), StorageError> {
        dispatch!(self, c => c.write(partition, record, mode).await)
    }

    async fn delete(&self, partition: &str, key: &KeyValue) -> Result<bool, StorageError> {
        dispatch!(self, c => c.delete(partition, key).await)
    }

    async fn clear(&self, partition: &str) -> Result<(), StorageError> {
        dispatch!(self, c => c.clear(partition).await)
    }

    async fn count(&self, partition: &str) -> Result<u64, StorageError> {
        dispatch!(self, c => c.count(partition).await)
    }

    async fn query(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Record>, StorageError> {
        dispatch!(self, c => c.query(partition, index, range).await)
    }

    async fn delete_range(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<u64, StorageError> {
        dispatch!(self, c => c.delete_range(partition, index, range).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_follows_storage_path() {
        let memory = ConfiguredProvider::from_config(&StoreConfig::default());
        assert_eq!(memory.name(), "memory");

        let lmdb = ConfiguredProvider::from_config(&StoreConfig::new().with_storage_path("/tmp/x"));
        assert_eq!(lmdb.name(), "lmdb");
    }
}
