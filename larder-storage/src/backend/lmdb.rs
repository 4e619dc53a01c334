//! LMDB-backed storage provider.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each partition gets its own
//! named database for records (`rec:<partition>`) and one per secondary index
//! (`idx:<partition>:<index>`). The schema catalog is kept as JSON in the
//! `meta` database.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Every single-record write, including its
//! index maintenance, runs in one write transaction. Reads use read
//! transactions and never observe a half-applied write.

use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use larder_core::{
    plan_upgrade, IndexSchema, KeyRange, KeyValue, PartitionSchema, Record, SchemaCatalog,
    StorageError, StoreSchema,
};
use tracing::{debug, warn};

use super::{
    constraint_violation, index_entries, index_entry, index_schema, key_collision,
    partition_schema, primary_key, scan_start, split_composite, Connection, StorageProvider,
    WriteMode,
};

/// Default maximum number of named databases in one environment.
pub const DEFAULT_MAX_DBS: u32 = 128;

const META_DB: &str = "meta";
const CATALOG_KEY: &[u8] = b"catalog";

/// How long `destroy` waits for outstanding handles before removing files.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

type BytesDb = Database<Bytes, Bytes>;

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored bytes are not valid JSON.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for StorageError {
    fn from(e: LmdbError) -> Self {
        match e {
            LmdbError::EnvOpen(_) | LmdbError::Io(_) => StorageError::Initialization {
                reason: e.to_string(),
            },
            LmdbError::Deserialization(reason) => StorageError::Serialization { reason },
            LmdbError::DbOpen(_) | LmdbError::Transaction(_) => StorageError::TransactionFailed {
                reason: e.to_string(),
            },
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

fn records_db_name(partition: &str) -> String {
    format!("rec:{partition}")
}

fn index_db_name(partition: &str, index: &str) -> String {
    format!("idx:{partition}:{index}")
}

/// LMDB storage provider rooted at one directory.
///
/// The environment is opened lazily on the first `open` and reused by later
/// connections until `destroy`.
pub struct LmdbProvider {
    path: PathBuf,
    map_size_mb: usize,
    max_dbs: u32,
    env: Mutex<Option<Env>>,
}

impl std::fmt::Debug for LmdbProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbProvider")
            .field("path", &self.path)
            .field("map_size_mb", &self.map_size_mb)
            .field("max_dbs", &self.max_dbs)
            .finish()
    }
}

impl LmdbProvider {
    /// Create a provider.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the database in megabytes
    pub fn new(path: impl Into<PathBuf>, map_size_mb: usize) -> Self {
        Self {
            path: path.into(),
            map_size_mb,
            max_dbs: DEFAULT_MAX_DBS,
            env: Mutex::new(None),
        }
    }

    pub fn with_max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn environment(&self) -> Result<Env, StorageError> {
        let mut slot = self.env.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(env) = slot.as_ref() {
            return Ok(env.clone());
        }

        std::fs::create_dir_all(&self.path).map_err(|e| StorageError::Initialization {
            reason: format!("cannot create {}: {e}", self.path.display()),
        })?;

        // SAFETY: the environment is opened once per provider and the
        // directory is not opened by any other handle in this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(self.map_size_mb.saturating_mul(1024 * 1024))
                .max_dbs(self.max_dbs)
                .open(&self.path)
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        *slot = Some(env.clone());
        Ok(env)
    }
}

/// Handles for one partition.
#[derive(Debug, Clone)]
struct PartitionDbs {
    records: BytesDb,
    indexes: HashMap<String, BytesDb>,
}

fn create_partition_dbs(
    env: &Env,
    wtxn: &mut RwTxn<'_>,
    partition: &PartitionSchema,
) -> Result<PartitionDbs, LmdbError> {
    let records: BytesDb = env
        .create_database(wtxn, Some(records_db_name(&partition.name).as_str()))
        .map_err(|e| LmdbError::DbOpen(e.to_string()))?;

    let mut indexes = HashMap::new();
    for index in &partition.indexes {
        let db: BytesDb = env
            .create_database(wtxn, Some(index_db_name(&partition.name, &index.name).as_str()))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        indexes.insert(index.name.clone(), db);
    }

    Ok(PartitionDbs { records, indexes })
}

fn read_catalog(env: &Env, wtxn: &mut RwTxn<'_>) -> Result<(BytesDb, Option<SchemaCatalog>), StorageError> {
    let meta: BytesDb = env
        .create_database(wtxn, Some(META_DB))
        .map_err(|e| LmdbError::DbOpen(e.to_string()))?;

    let catalog = match meta.get(wtxn, CATALOG_KEY).map_err(txn_err)? {
        Some(bytes) => Some(
            serde_json::from_slice(bytes)
                .map_err(|e| LmdbError::Deserialization(e.to_string()))?,
        ),
        None => None,
    };

    Ok((meta, catalog))
}

/// First primary key holding `prefix` in a unique index.
fn unique_owner(
    txn: &RoTxn<'_>,
    db: &BytesDb,
    prefix: &[u8],
) -> Result<Option<Vec<u8>>, LmdbError> {
    let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Included(prefix), Bound::Unbounded);
    let mut iter = db.range(txn, &bounds).map_err(txn_err)?;
    match iter.next() {
        Some(Ok((composite, pk))) if composite.starts_with(prefix) => Ok(Some(pk.to_vec())),
        Some(Err(e)) => Err(txn_err(e)),
        _ => Ok(None),
    }
}

fn backfill_index(
    wtxn: &mut RwTxn<'_>,
    partition_name: &str,
    index: &IndexSchema,
    dbs: &PartitionDbs,
) -> Result<u64, StorageError> {
    let Some(index_db) = dbs.indexes.get(&index.name) else {
        return Err(StorageError::UnknownIndex {
            partition: partition_name.to_string(),
            index: index.name.clone(),
        });
    };

    let mut rows = Vec::new();
    for item in dbs.records.iter(wtxn).map_err(txn_err)? {
        let (pk, bytes) = item.map_err(txn_err)?;
        let record: Record = serde_json::from_slice(bytes)
            .map_err(|e| LmdbError::Deserialization(e.to_string()))?;
        rows.push((pk.to_vec(), record));
    }

    let mut written = 0;
    for (pk, record) in &rows {
        let Some(entry) = index_entry(index, record, pk) else {
            continue;
        };
        if index.unique {
            if let Some(owner) = unique_owner(wtxn, index_db, entry.prefix())? {
                if &owner != pk {
                    return Err(constraint_violation(partition_name, &entry));
                }
            }
        }
        index_db
            .put(wtxn, &entry.composite, pk)
            .map_err(txn_err)?;
        written += 1;
    }
    Ok(written)
}

#[async_trait]
impl StorageProvider for LmdbProvider {
    type Connection = LmdbConnection;

    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn open(&self, schema: &StoreSchema) -> Result<LmdbConnection, StorageError> {
        let env = self.environment()?;
        let mut wtxn = env.write_txn().map_err(txn_err)?;

        let (meta, stored) = read_catalog(&env, &mut wtxn)?;
        let plan = plan_upgrade(stored.as_ref(), schema)?;

        let mut partitions = HashMap::new();
        for partition in plan.catalog.partitions.values() {
            let dbs = create_partition_dbs(&env, &mut wtxn, partition)?;
            partitions.insert(partition.name.clone(), dbs);
        }

        for (partition_name, index) in &plan.new_indexes {
            let dbs = partitions
                .get(partition_name)
                .ok_or_else(|| StorageError::UnknownPartition {
                    partition: partition_name.clone(),
                })?;
            let written = backfill_index(&mut wtxn, partition_name, index, dbs)?;
            debug!(
                partition = %partition_name,
                index = %index.name,
                entries = written,
                "Backfilled index"
            );
        }

        if !plan.is_noop() {
            let bytes = serde_json::to_vec(&plan.catalog)?;
            meta.put(&mut wtxn, CATALOG_KEY, &bytes).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        Ok(LmdbConnection {
            env,
            catalog: plan.catalog,
            partitions,
        })
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let env = self
            .env
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .take();

        if let Some(env) = env {
            let closing = env.prepare_for_closing();
            if !closing.wait_timeout(CLOSE_WAIT) {
                warn!(path = %self.path.display(), "LMDB environment still referenced during destroy");
            }
        }

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LmdbError::Io(e).into()),
        }
    }
}

/// Connection to an [`LmdbProvider`].
pub struct LmdbConnection {
    env: Env,
    catalog: SchemaCatalog,
    partitions: HashMap<String, PartitionDbs>,
}

impl std::fmt::Debug for LmdbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbConnection")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl LmdbConnection {
    fn dbs(&self, partition: &str) -> Result<(&PartitionSchema, &PartitionDbs), StorageError> {
        let schema = partition_schema(&self.catalog, partition)?;
        let dbs = self
            .partitions
            .get(partition)
            .ok_or_else(|| StorageError::UnknownPartition {
                partition: partition.to_string(),
            })?;
        Ok((schema, dbs))
    }

    fn index_db<'a>(
        schema: &PartitionSchema,
        dbs: &'a PartitionDbs,
        index: &str,
    ) -> Result<&'a BytesDb, StorageError> {
        index_schema(schema, index)?;
        dbs.indexes.get(index).ok_or_else(|| StorageError::UnknownIndex {
            partition: schema.name.clone(),
            index: index.to_string(),
        })
    }

    /// Primary keys whose index key lies in `range`, in index order.
    fn scan_index(
        txn: &RoTxn<'_>,
        db: &BytesDb,
        range: &KeyRange,
    ) -> Result<Vec<Vec<u8>>, LmdbError> {
        let start = range.encoded_start();
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (scan_start(&start), Bound::Unbounded);

        let mut pks = Vec::new();
        for item in db.range(txn, &bounds).map_err(txn_err)? {
            let (composite, pk) = item.map_err(txn_err)?;
            let Some((key, _)) = split_composite(composite) else {
                continue;
            };
            if range.is_above(&key) {
                break;
            }
            if range.contains(&key) {
                pks.push(pk.to_vec());
            }
        }
        Ok(pks)
    }

    fn decode(bytes: &[u8]) -> Result<Record, LmdbError> {
        serde_json::from_slice(bytes).map_err(|e| LmdbError::Deserialization(e.to_string()))
    }

    /// Remove a record and its index entries inside `wtxn`.
    fn remove_in(
        wtxn: &mut RwTxn<'_>,
        schema: &PartitionSchema,
        dbs: &PartitionDbs,
        pk: &[u8],
    ) -> Result<bool, StorageError> {
        let old = match dbs.records.get(wtxn, pk).map_err(txn_err)? {
            Some(bytes) => Self::decode(bytes)?,
            None => return Ok(false),
        };
        for entry in index_entries(schema, &old, pk) {
            if let Some(db) = dbs.indexes.get(&entry.index.name) {
                db.delete(wtxn, &entry.composite).map_err(txn_err)?;
            }
        }
        dbs.records.delete(wtxn, pk).map_err(txn_err)?;
        Ok(true)
    }
}

#[async_trait]
impl Connection for LmdbConnection {
    fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    async fn get(&self, partition: &str, key: &KeyValue) -> Result<Option<Record>, StorageError> {
        let (_, dbs) = self.dbs(partition)?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match dbs.records.get(&rtxn, &key.encode()).map_err(txn_err)? {
            Some(bytes) => Ok(Some(Self::decode(bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self, partition: &str) -> Result<Vec<Record>, StorageError> {
        let (_, dbs) = self.dbs(partition)?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut records = Vec::new();
        for item in dbs.records.iter(&rtxn).map_err(txn_err)? {
            let (_, bytes) = item.map_err(txn_err)?;
            records.push(Self::decode(bytes)?);
        }
        Ok(records)
    }

    async fn write(
        &self,
        partition: &str,
        record: Record,
        mode: WriteMode,
    ) -> Result<(), StorageError> {
        let (schema, dbs) = self.dbs(partition)?;
        let pk = primary_key(schema, &record)?;
        let pk_bytes = pk.encode();
        let value = serde_json::to_vec(&record)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let previous = match dbs.records.get(&wtxn, &pk_bytes).map_err(txn_err)? {
            Some(bytes) => Some(Self::decode(bytes)?),
            None => None,
        };
        if previous.is_some() && mode == WriteMode::Insert {
            return Err(key_collision(schema, &pk));
        }

        let entries = index_entries(schema, &record, &pk_bytes);
        for entry in entries.iter().filter(|e| e.index.unique) {
            let Some(db) = dbs.indexes.get(&entry.index.name) else {
                continue;
            };
            if let Some(owner) = unique_owner(&wtxn, db, entry.prefix())? {
                if owner != pk_bytes {
                    return Err(constraint_violation(partition, entry));
                }
            }
        }

        if let Some(old) = &previous {
            for entry in index_entries(schema, old, &pk_bytes) {
                if let Some(db) = dbs.indexes.get(&entry.index.name) {
                    db.delete(&mut wtxn, &entry.composite).map_err(txn_err)?;
                }
            }
        }
        for entry in &entries {
            if let Some(db) = dbs.indexes.get(&entry.index.name) {
                db.put(&mut wtxn, &entry.composite, &pk_bytes)
                    .map_err(txn_err)?;
            }
        }
        dbs.records
            .put(&mut wtxn, &pk_bytes, &value)
            .map_err(txn_err)?;

        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &KeyValue) -> Result<bool, StorageError> {
        let (schema, dbs) = self.dbs(partition)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let removed = Self::remove_in(&mut wtxn, schema, dbs, &key.encode())?;
        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }

    async fn clear(&self, partition: &str) -> Result<(), StorageError> {
        let (_, dbs) = self.dbs(partition)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        dbs.records.clear(&mut wtxn).map_err(txn_err)?;
        for db in dbs.indexes.values() {
            db.clear(&mut wtxn).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn count(&self, partition: &str) -> Result<u64, StorageError> {
        let (_, dbs) = self.dbs(partition)?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(dbs.records.len(&rtxn).map_err(txn_err)?)
    }

    async fn query(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Record>, StorageError> {
        let (schema, dbs) = self.dbs(partition)?;
        let db = Self::index_db(schema, dbs, index)?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;

        let mut records = Vec::new();
        for pk in Self::scan_index(&rtxn, db, range)? {
            if let Some(bytes) = dbs.records.get(&rtxn, &pk).map_err(txn_err)? {
                records.push(Self::decode(bytes)?);
            }
        }
        Ok(records)
    }

    async fn delete_range(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<u64, StorageError> {
        let (schema, dbs) = self.dbs(partition)?;
        let db = Self::index_db(schema, dbs, index)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let pks = Self::scan_index(&wtxn, db, range)?;
        let mut removed = 0;
        for pk in &pks {
            if Self::remove_in(&mut wtxn, schema, dbs, pk)? {
                removed += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }
}
