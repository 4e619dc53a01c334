//! Storage provider and connection traits.
//!
//! A [`StorageProvider`] knows how to open a [`Connection`] for a schema and
//! how to destroy everything it stores. The engine holds at most one
//! connection at a time and shares it across all partitions.
//!
//! Both built-in backends keep records under their encoded primary key and
//! every secondary index as a set of composite keys
//! `[encoded index key][encoded primary key]`. Because key encodings are
//! order-preserving and self-delimiting, an ascending scan over an index
//! yields records by index key, ties broken by primary key.

pub mod configured;
pub mod lmdb;
pub mod memory;

use async_trait::async_trait;
use larder_core::{
    IndexSchema, KeyRange, KeyValue, PartitionSchema, Record, SchemaCatalog, StorageError,
    StoreSchema,
};

pub use configured::{ConfiguredConnection, ConfiguredProvider};
pub use lmdb::{LmdbConnection, LmdbError, LmdbProvider};
pub use memory::{MemoryConnection, MemoryProvider};

/// How a single-record write treats an existing primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `KeyCollision` if the key exists.
    Insert,
    /// Overwrite unconditionally.
    Upsert,
}

/// Opens connections to one underlying store.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    type Connection: Connection;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Open a connection, creating whatever `schema` declares that the store
    /// is missing when `schema.version` is newer than the stored version.
    ///
    /// Fails with `StorageError::Initialization` when the backing storage is
    /// unavailable and with `StorageError::SchemaDowngrade` when the store is
    /// at a newer version.
    async fn open(&self, schema: &StoreSchema) -> Result<Self::Connection, StorageError>;

    /// Remove every partition and the schema catalog.
    ///
    /// Called with no connection open.
    async fn destroy(&self) -> Result<(), StorageError>;
}

/// An open connection. Every single-record write, including its index
/// maintenance, is atomic. Nothing spans more than one record except
/// `clear` and `delete_range`.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// The schema catalog the connection was opened with.
    fn catalog(&self) -> &SchemaCatalog;

    async fn get(&self, partition: &str, key: &KeyValue) -> Result<Option<Record>, StorageError>;

    /// All records in primary-key order.
    async fn get_all(&self, partition: &str) -> Result<Vec<Record>, StorageError>;

    async fn write(&self, partition: &str, record: Record, mode: WriteMode)
        -> Result<(), StorageError>;

    /// Returns whether a record was removed.
    async fn delete(&self, partition: &str, key: &KeyValue) -> Result<bool, StorageError>;

    async fn clear(&self, partition: &str) -> Result<(), StorageError>;

    async fn count(&self, partition: &str) -> Result<u64, StorageError>;

    /// Records whose `index` key lies in `range`, ascending by index key.
    async fn query(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Record>, StorageError>;

    /// Delete every record whose `index` key lies in `range`, sweeping the
    /// index forward. Returns the number removed.
    async fn delete_range(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<u64, StorageError>;
}

// ============================================================================
// SHARED RECORD / INDEX HELPERS
// ============================================================================

/// Look up a partition in a catalog.
pub(crate) fn partition_schema<'a>(
    catalog: &'a SchemaCatalog,
    partition: &str,
) -> Result<&'a PartitionSchema, StorageError> {
    catalog
        .partition(partition)
        .ok_or_else(|| StorageError::UnknownPartition {
            partition: partition.to_string(),
        })
}

/// Look up an index on a partition.
pub(crate) fn index_schema<'a>(
    partition: &'a PartitionSchema,
    index: &str,
) -> Result<&'a IndexSchema, StorageError> {
    partition
        .index(index)
        .ok_or_else(|| StorageError::UnknownIndex {
            partition: partition.name.clone(),
            index: index.to_string(),
        })
}

/// Extract the primary key of `record`.
pub(crate) fn primary_key(
    partition: &PartitionSchema,
    record: &Record,
) -> Result<KeyValue, StorageError> {
    KeyValue::extract(record, &partition.key_path).ok_or_else(|| StorageError::InvalidKey {
        partition: partition.name.clone(),
        key_path: partition.key_path.clone(),
        reason: "primary key must resolve to a number or a string".to_string(),
    })
}

/// One entry a record contributes to a secondary index.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry<'a> {
    pub index: &'a IndexSchema,
    pub key: KeyValue,
    /// `[encoded index key][encoded primary key]`
    pub composite: Vec<u8>,
    /// Length of the encoded index key at the front of `composite`.
    pub prefix_len: usize,
}

impl IndexEntry<'_> {
    pub fn prefix(&self) -> &[u8] {
        &self.composite[..self.prefix_len]
    }
}

/// Index entries for `record`. Records whose index key path does not resolve
/// to a key are left out of that index.
pub(crate) fn index_entries<'a>(
    partition: &'a PartitionSchema,
    record: &Record,
    pk_bytes: &[u8],
) -> Vec<IndexEntry<'a>> {
    partition
        .indexes
        .iter()
        .filter_map(|index| index_entry(index, record, pk_bytes))
        .collect()
}

/// The entry `record` contributes to one index, if any.
pub(crate) fn index_entry<'a>(
    index: &'a IndexSchema,
    record: &Record,
    pk_bytes: &[u8],
) -> Option<IndexEntry<'a>> {
    let key = KeyValue::extract(record, &index.key_path)?;
    let mut composite = key.encode();
    let prefix_len = composite.len();
    composite.extend_from_slice(pk_bytes);
    Some(IndexEntry {
        index,
        key,
        composite,
        prefix_len,
    })
}

/// Split a composite index key into the index key and the primary key bytes.
pub(crate) fn split_composite(bytes: &[u8]) -> Option<(KeyValue, &[u8])> {
    let (key, used) = KeyValue::decode_prefix(bytes)?;
    Some((key, &bytes[used..]))
}

pub(crate) fn constraint_violation(partition: &str, entry: &IndexEntry<'_>) -> StorageError {
    StorageError::ConstraintViolation {
        partition: partition.to_string(),
        index: entry.index.name.clone(),
        key: entry.key.to_string(),
    }
}

/// Encoded scan start for `range` as a byte bound.
pub(crate) fn scan_start(start: &Option<Vec<u8>>) -> std::ops::Bound<&[u8]> {
    match start {
        Some(bytes) => std::ops::Bound::Included(bytes.as_slice()),
        None => std::ops::Bound::Unbounded,
    }
}

pub(crate) fn key_collision(partition: &PartitionSchema, key: &KeyValue) -> StorageError {
    StorageError::KeyCollision {
        partition: partition.name.clone(),
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> PartitionSchema {
        PartitionSchema::new("users", "id")
            .with_index(IndexSchema::unique("email", "contact.email"))
            .with_index(IndexSchema::new("age", "age"))
    }

    #[test]
    fn test_primary_key_extraction() {
        let pk = primary_key(&users(), &json!({"id": 7})).expect("pk");
        assert_eq!(pk, KeyValue::from(7));

        let err = primary_key(&users(), &json!({"id": true})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }

    #[test]
    fn test_index_entries_skip_unresolvable_paths() {
        let schema = users();
        let record = json!({"id": 1, "age": 30});
        let pk = KeyValue::from(1).encode();
        let entries = index_entries(&schema, &record, &pk);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index.name, "age");
        assert_eq!(entries[0].prefix(), KeyValue::from(30).encode().as_slice());
    }

    #[test]
    fn test_split_composite() {
        let schema = users();
        let record = json!({"id": "u1", "contact": {"email": "a@b.c"}});
        let pk = KeyValue::from("u1").encode();
        let entries = index_entries(&schema, &record, &pk);

        let (key, rest) = split_composite(&entries[0].composite).expect("split");
        assert_eq!(key, KeyValue::from("a@b.c"));
        assert_eq!(rest, pk.as_slice());
    }

    #[test]
    fn test_lookup_errors() {
        let catalog = SchemaCatalog::default();
        assert!(matches!(
            partition_schema(&catalog, "nope"),
            Err(StorageError::UnknownPartition { .. })
        ));
        assert!(matches!(
            index_schema(&users(), "nope"),
            Err(StorageError::UnknownIndex { .. })
        ));
    }
}
