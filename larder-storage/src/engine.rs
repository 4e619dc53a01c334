//! Partitioned store engine.
//!
//! [`StoreEngine`] is a cheap, cloneable handle over one storage provider and
//! one declared schema. The connection is opened on first use and shared by
//! every clone; `close` drops it for all of them and the next call opens a
//! fresh one.

use std::sync::Arc;

use larder_core::{
    KeyRange, KeyValue, LarderResult, Record, StorageError, StoreSchema,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::{Connection, StorageProvider, WriteMode};

struct EngineInner<P: StorageProvider> {
    provider: P,
    schema: StoreSchema,
    connection: RwLock<Option<Arc<P::Connection>>>,
}

/// Handle to a partitioned store.
pub struct StoreEngine<P: StorageProvider> {
    inner: Arc<EngineInner<P>>,
}

impl<P: StorageProvider> Clone for StoreEngine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: StorageProvider> std::fmt::Debug for StoreEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEngine")
            .field("provider", &self.inner.provider.name())
            .field("version", &self.inner.schema.version)
            .finish()
    }
}

impl<P: StorageProvider> StoreEngine<P> {
    /// Create an engine. Nothing is opened until the first operation.
    pub fn new(provider: P, schema: StoreSchema) -> LarderResult<Self> {
        schema.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                provider,
                schema,
                connection: RwLock::new(None),
            }),
        })
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.inner.schema
    }

    /// Whether a connection is currently open.
    pub async fn is_open(&self) -> bool {
        self.inner.connection.read().await.is_some()
    }

    /// Open the connection if it is not open yet.
    ///
    /// Callers that arrive while an open is in flight wait for it and share
    /// its connection. A failed open leaves the engine closed, so a later
    /// call tries again.
    pub async fn init(&self) -> LarderResult<()> {
        self.connection().await?;
        Ok(())
    }

    async fn connection(&self) -> Result<Arc<P::Connection>, StorageError> {
        if let Some(conn) = self.inner.connection.read().await.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let mut slot = self.inner.connection.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let conn = Arc::new(self.inner.provider.open(&self.inner.schema).await?);
        debug!(
            provider = self.inner.provider.name(),
            version = self.inner.schema.version,
            "Opened store connection"
        );
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Release the connection. The next operation re-opens it.
    pub async fn close(&self) {
        if self.inner.connection.write().await.take().is_some() {
            debug!(provider = self.inner.provider.name(), "Closed store connection");
        }
    }

    /// Close the engine and remove every partition and the schema catalog.
    pub async fn delete_all(&self) -> LarderResult<()> {
        let mut slot = self.inner.connection.write().await;
        slot.take();
        self.inner.provider.destroy().await?;
        debug!(provider = self.inner.provider.name(), "Destroyed store");
        Ok(())
    }

    /// Insert a record. Fails with `KeyCollision` if its primary key exists.
    pub async fn add(&self, partition: &str, record: Record) -> LarderResult<()> {
        let conn = self.connection().await?;
        conn.write(partition, record, WriteMode::Insert).await?;
        Ok(())
    }

    /// Insert or overwrite a record.
    pub async fn put(&self, partition: &str, record: Record) -> LarderResult<()> {
        let conn = self.connection().await?;
        conn.write(partition, record, WriteMode::Upsert).await?;
        Ok(())
    }

    pub async fn put_as<T: Serialize>(&self, partition: &str, value: &T) -> LarderResult<()> {
        self.put(partition, serde_json::to_value(value)?).await
    }

    pub async fn get(&self, partition: &str, key: impl Into<KeyValue>) -> LarderResult<Option<Record>> {
        let conn = self.connection().await?;
        Ok(conn.get(partition, &key.into()).await?)
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        partition: &str,
        key: impl Into<KeyValue>,
    ) -> LarderResult<Option<T>> {
        match self.get(partition, key).await? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    /// All records of a partition, in primary-key order.
    pub async fn get_all(&self, partition: &str) -> LarderResult<Vec<Record>> {
        let conn = self.connection().await?;
        Ok(conn.get_all(partition).await?)
    }

    /// Records whose `index` key lies in `range`, ascending by that key and
    /// then by primary key.
    pub async fn query(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> LarderResult<Vec<Record>> {
        let conn = self.connection().await?;
        Ok(conn.query(partition, index, range).await?)
    }

    /// Delete a record. Returns whether it existed.
    pub async fn delete(&self, partition: &str, key: impl Into<KeyValue>) -> LarderResult<bool> {
        let conn = self.connection().await?;
        Ok(conn.delete(partition, &key.into()).await?)
    }

    /// Delete every record whose `index` key lies in `range`.
    pub async fn delete_range(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> LarderResult<u64> {
        let conn = self.connection().await?;
        Ok(conn.delete_range(partition, index, range).await?)
    }

    pub async fn clear(&self, partition: &str) -> LarderResult<()> {
        let conn = self.connection().await?;
        conn.clear(partition).await?;
        Ok(())
    }

    pub async fn count(&self, partition: &str) -> LarderResult<u64> {
        let conn = self.connection().await?;
        Ok(conn.count(partition).await?)
    }

    /// Upsert records one at a time.
    ///
    /// Not atomic as a unit: the first failure stops the batch with
    /// `StorageError::PartialBatch`, records before it stay written and
    /// records after it are not attempted. Returns the number written.
    pub async fn bulk_put<I>(&self, partition: &str, records: I) -> LarderResult<usize>
    where
        I: IntoIterator<Item = Record>,
    {
        let conn = self.connection().await?;
        let mut committed = 0;
        for record in records {
            if let Err(e) = conn.write(partition, record, WriteMode::Upsert).await {
                return Err(batch_failure(partition, committed, e).into());
            }
            committed += 1;
        }
        Ok(committed)
    }

    /// Delete keys one at a time, with the same partial-failure rules as
    /// [`bulk_put`](Self::bulk_put). Missing keys are not failures.
    pub async fn bulk_delete<I, K>(&self, partition: &str, keys: I) -> LarderResult<usize>
    where
        I: IntoIterator<Item = K>,
        K: Into<KeyValue>,
    {
        let conn = self.connection().await?;
        let mut committed = 0;
        for key in keys {
            if let Err(e) = conn.delete(partition, &key.into()).await {
                return Err(batch_failure(partition, committed, e).into());
            }
            committed += 1;
        }
        Ok(committed)
    }
}

fn batch_failure(partition: &str, committed: usize, source: StorageError) -> StorageError {
    warn!(
        error = %source,
        partition = %partition,
        failed_at = committed,
        "Batch write rejected"
    );
    StorageError::PartialBatch {
        partition: partition.to_string(),
        failed_at: committed,
        committed,
        source: Box::new(source),
    }
}
