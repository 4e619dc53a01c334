//! Process-local storage provider.
//!
//! Data lives in the provider, not in the connection, so closing and
//! re-opening the engine keeps every record. `destroy` drops all of it.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use larder_core::{
    plan_upgrade, IndexSchema, KeyRange, KeyValue, PartitionSchema, Record, SchemaCatalog,
    StorageError, StoreSchema,
};

use super::{
    constraint_violation, index_entries, index_entry, index_schema, key_collision,
    partition_schema, primary_key, scan_start, split_composite, Connection, StorageProvider,
    WriteMode,
};

/// Composite index key -> primary key bytes.
type IndexMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
struct MemoryPartition {
    /// Encoded primary key -> record.
    records: BTreeMap<Vec<u8>, Record>,
    indexes: HashMap<String, IndexMap>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    catalog: Option<SchemaCatalog>,
    partitions: HashMap<String, MemoryPartition>,
}

/// In-memory storage provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    store: Arc<RwLock<MemoryStore>>,
    opens: Arc<AtomicUsize>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many connections have been opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Version recorded in the store, if it has ever been opened.
    pub fn stored_version(&self) -> Option<u32> {
        self.store
            .read()
            .ok()
            .and_then(|s| s.catalog.as_ref().map(|c| c.version))
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    type Connection = MemoryConnection;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, schema: &StoreSchema) -> Result<MemoryConnection, StorageError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        // Opening suspends like any other storage call.
        tokio::task::yield_now().await;

        let mut store = self.store.write().map_err(|_| StorageError::LockPoisoned)?;
        let plan = plan_upgrade(store.catalog.as_ref(), schema)?;

        for declared in &plan.new_partitions {
            let partition = store.partitions.entry(declared.name.clone()).or_default();
            for index in &declared.indexes {
                partition.indexes.entry(index.name.clone()).or_default();
            }
        }

        for (name, index) in &plan.new_indexes {
            let partition = store
                .partitions
                .get_mut(name)
                .ok_or_else(|| StorageError::UnknownPartition {
                    partition: name.clone(),
                })?;
            backfill_index(name, index, partition)?;
        }

        store.catalog = Some(plan.catalog.clone());

        Ok(MemoryConnection {
            store: Arc::clone(&self.store),
            catalog: plan.catalog,
        })
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let mut store = self.store.write().map_err(|_| StorageError::LockPoisoned)?;
        *store = MemoryStore::default();
        Ok(())
    }
}

/// Populate a newly declared index from the records already present.
fn backfill_index(
    partition_name: &str,
    index: &IndexSchema,
    partition: &mut MemoryPartition,
) -> Result<(), StorageError> {
    let mut map = IndexMap::new();
    for (pk_bytes, record) in &partition.records {
        let Some(entry) = index_entry(index, record, pk_bytes) else {
            continue;
        };
        if index.unique {
            if let Some(owner) = unique_owner(&map, entry.prefix()) {
                if owner != pk_bytes {
                    return Err(constraint_violation(partition_name, &entry));
                }
            }
        }
        map.insert(entry.composite, pk_bytes.clone());
    }
    partition.indexes.insert(index.name.clone(), map);
    Ok(())
}

/// Primary key currently holding `prefix` in a unique index.
fn unique_owner<'m>(map: &'m IndexMap, prefix: &[u8]) -> Option<&'m Vec<u8>> {
    map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .next()
        .filter(|(composite, _)| composite.starts_with(prefix))
        .map(|(_, pk)| pk)
}

/// Remove a record and its index entries. Returns whether it existed.
fn remove_record(schema: &PartitionSchema, partition: &mut MemoryPartition, pk_bytes: &[u8]) -> bool {
    let Some(old) = partition.records.remove(pk_bytes) else {
        return false;
    };
    for entry in index_entries(schema, &old, pk_bytes) {
        if let Some(map) = partition.indexes.get_mut(&entry.index.name) {
            map.remove(&entry.composite);
        }
    }
    true
}

/// Connection to a [`MemoryProvider`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<RwLock<MemoryStore>>,
    catalog: SchemaCatalog,
}

impl MemoryConnection {
    fn with_partition<R>(
        &self,
        partition: &str,
        f: impl FnOnce(&MemoryPartition) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let store = self.store.read().map_err(|_| StorageError::LockPoisoned)?;
        let part = store
            .partitions
            .get(partition)
            .ok_or_else(|| StorageError::UnknownPartition {
                partition: partition.to_string(),
            })?;
        f(part)
    }

    fn with_partition_mut<R>(
        &self,
        partition: &str,
        f: impl FnOnce(&mut MemoryPartition) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut store = self.store.write().map_err(|_| StorageError::LockPoisoned)?;
        let part = store
            .partitions
            .get_mut(partition)
            .ok_or_else(|| StorageError::UnknownPartition {
                partition: partition.to_string(),
            })?;
        f(part)
    }

    /// Primary keys of records whose `index` key lies in `range`, in index order.
    fn scan_index(
        part: &MemoryPartition,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let map = part
            .indexes
            .get(index)
            .ok_or_else(|| StorageError::UnknownIndex {
                partition: partition.to_string(),
                index: index.to_string(),
            })?;

        let start = range.encoded_start();
        let mut pks = Vec::new();
        for (composite, pk) in map.range::<[u8], _>((scan_start(&start), Bound::Unbounded)) {
            let Some((key, _)) = split_composite(composite) else {
                continue;
            };
            if range.is_above(&key) {
                break;
            }
            if range.contains(&key) {
                pks.push(pk.clone());
            }
        }
        Ok(pks)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    async fn get(&self, partition: &str, key: &KeyValue) -> Result<Option<Record>, StorageError> {
        partition_schema(&self.catalog, partition)?;
        let pk_bytes = key.encode();
        self.with_partition(partition, |part| Ok(part.records.get(&pk_bytes).cloned()))
    }

    async fn get_all(&self, partition: &str) -> Result<Vec<Record>, StorageError> {
        partition_schema(&self.catalog, partition)?;
        self.with_partition(partition, |part| Ok(part.records.values().cloned().collect()))
    }

    async fn write(
        &self,
        partition: &str,
        record: Record,
        mode: WriteMode,
    ) -> Result<(), StorageError> {
        let schema = partition_schema(&self.catalog, partition)?;
        let pk = primary_key(schema, &record)?;
        let pk_bytes = pk.encode();

        self.with_partition_mut(partition, |part| {
            let previous = part.records.get(&pk_bytes);
            if previous.is_some() && mode == WriteMode::Insert {
                return Err(key_collision(schema, &pk));
            }

            let entries = index_entries(schema, &record, &pk_bytes);
            for entry in entries.iter().filter(|e| e.index.unique) {
                let owner = part
                    .indexes
                    .get(&entry.index.name)
                    .and_then(|map| unique_owner(map, entry.prefix()));
                if owner.is_some_and(|owner| owner != &pk_bytes) {
                    return Err(constraint_violation(partition, entry));
                }
            }

            let stale: Vec<(String, Vec<u8>)> = previous
                .map(|old| {
                    index_entries(schema, old, &pk_bytes)
                        .into_iter()
                        .map(|e| (e.index.name.clone(), e.composite))
                        .collect()
                })
                .unwrap_or_default();
            for (index, composite) in stale {
                if let Some(map) = part.indexes.get_mut(&index) {
                    map.remove(&composite);
                }
            }

            for entry in entries {
                part.indexes
                    .entry(entry.index.name.clone())
                    .or_default()
                    .insert(entry.composite, pk_bytes.clone());
            }
            part.records.insert(pk_bytes.clone(), record);
            Ok(())
        })
    }

    async fn delete(&self, partition: &str, key: &KeyValue) -> Result<bool, StorageError> {
        let schema = partition_schema(&self.catalog, partition)?;
        let pk_bytes = key.encode();
        self.with_partition_mut(partition, |part| Ok(remove_record(schema, part, &pk_bytes)))
    }

    async fn clear(&self, partition: &str) -> Result<(), StorageError> {
        partition_schema(&self.catalog, partition)?;
        self.with_partition_mut(partition, |part| {
            part.records.clear();
            for map in part.indexes.values_mut() {
                map.clear();
            }
            Ok(())
        })
    }

    async fn count(&self, partition: &str) -> Result<u64, StorageError> {
        partition_schema(&self.catalog, partition)?;
        self.with_partition(partition, |part| Ok(part.records.len() as u64))
    }

    async fn query(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Record>, StorageError> {
        let schema = partition_schema(&self.catalog, partition)?;
        index_schema(schema, index)?;
        self.with_partition(partition, |part| {
            let pks = Self::scan_index(part, partition, index, range)?;
            Ok(pks
                .iter()
                .filter_map(|pk| part.records.get(pk).cloned())
                .collect())
        })
    }

    async fn delete_range(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<u64, StorageError> {
        let schema = partition_schema(&self.catalog, partition)?;
        index_schema(schema, index)?;
        self.with_partition_mut(partition, |part| {
            let pks = Self::scan_index(part, partition, index, range)?;
            let mut removed = 0;
            for pk in pks {
                if remove_record(schema, part, &pk) {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_core::IndexSchema;
    use serde_json::json;

    fn schema(version: u32) -> StoreSchema {
        StoreSchema::new(version).with_partition(
            PartitionSchema::new("users", "id").with_index(IndexSchema::unique("email", "email")),
        )
    }

    #[tokio::test]
    async fn test_insert_collides_upsert_overwrites() {
        let provider = MemoryProvider::new();
        let conn = provider.open(&schema(1)).await.expect("open");

        conn.write("users", json!({"id": 1, "email": "a"}), WriteMode::Insert)
            .await
            .expect("first insert");
        let err = conn
            .write("users", json!({"id": 1, "email": "b"}), WriteMode::Insert)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyCollision { .. }));

        conn.write("users", json!({"id": 1, "email": "b"}), WriteMode::Upsert)
            .await
            .expect("upsert");
        let stored = conn.get("users", &KeyValue::from(1)).await.expect("get");
        assert_eq!(stored, Some(json!({"id": 1, "email": "b"})));
    }

    #[tokio::test]
    async fn test_overwrite_releases_old_unique_key() {
        let provider = MemoryProvider::new();
        let conn = provider.open(&schema(1)).await.expect("open");

        conn.write("users", json!({"id": 1, "email": "a"}), WriteMode::Upsert)
            .await
            .expect("write");
        conn.write("users", json!({"id": 1, "email": "b"}), WriteMode::Upsert)
            .await
            .expect("rewrite");
        // "a" is free again
        conn.write("users", json!({"id": 2, "email": "a"}), WriteMode::Upsert)
            .await
            .expect("reuse released key");

        let err = conn
            .write("users", json!({"id": 3, "email": "b"}), WriteMode::Upsert)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_data_survives_reopen_and_destroy_clears() {
        let provider = MemoryProvider::new();
        {
            let conn = provider.open(&schema(1)).await.expect("open");
            conn.write("users", json!({"id": 1, "email": "a"}), WriteMode::Upsert)
                .await
                .expect("write");
        }

        let conn = provider.open(&schema(1)).await.expect("reopen");
        assert_eq!(conn.count("users").await.expect("count"), 1);
        drop(conn);

        provider.destroy().await.expect("destroy");
        assert_eq!(provider.stored_version(), None);
        let conn = provider.open(&schema(1)).await.expect("open after destroy");
        assert_eq!(conn.count("users").await.expect("count"), 0);
        assert_eq!(provider.open_count(), 3);
    }

    #[tokio::test]
    async fn test_upgrade_backfills_new_index() {
        let provider = MemoryProvider::new();
        let v1 = StoreSchema::new(1).with_partition(PartitionSchema::new("users", "id"));
        let conn = provider.open(&v1).await.expect("open v1");
        conn.write("users", json!({"id": 1, "age": 40}), WriteMode::Upsert)
            .await
            .expect("write");
        conn.write("users", json!({"id": 2, "age": 20}), WriteMode::Upsert)
            .await
            .expect("write");
        drop(conn);

        let v2 = StoreSchema::new(2)
            .with_partition(PartitionSchema::new("users", "id").with_index(IndexSchema::new("age", "age")));
        let conn = provider.open(&v2).await.expect("open v2");
        let by_age = conn
            .query("users", "age", &KeyRange::all())
            .await
            .expect("query");
        assert_eq!(by_age, vec![json!({"id": 2, "age": 20}), json!({"id": 1, "age": 40})]);
    }

    #[tokio::test]
    async fn test_downgrade_rejected() {
        let provider = MemoryProvider::new();
        provider.open(&schema(2)).await.expect("open v2");
        let err = provider.open(&schema(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::SchemaDowngrade { .. }));
    }
}
