//! Versioned schema declarations and upgrade planning.
//!
//! A schema is an ordered list of partitions, each with a primary key path
//! and a set of secondary indexes, plus a version number. Opening a store at a
//! higher version than the one on disk creates whatever the new version
//! declares that the store does not have yet. Nothing is ever dropped by an
//! upgrade.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{SchemaError, StorageError};

/// Primary key path of TTL cache partitions.
pub const CACHE_KEY_PATH: &str = "key";

/// Name of the expiry index on TTL cache partitions.
pub const EXPIRES_AT_INDEX: &str = "expiresAt";

/// Key path of the expiry index on TTL cache partitions.
pub const EXPIRES_AT_PATH: &str = "value.expiresAt";

/// Secondary index declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
        }
    }

    pub fn unique(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::new(name, key_path)
        }
    }
}

/// Partition declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSchema {
    pub name: String,
    pub key_path: String,
    pub indexes: Vec<IndexSchema>,
}

impl PartitionSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            indexes: Vec::new(),
        }
    }

    /// Add a secondary index.
    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// A TTL cache partition: keyed by `key`, indexed on `value.expiresAt`.
    pub fn expiring_cache(name: impl Into<String>) -> Self {
        Self::new(name, CACHE_KEY_PATH).with_index(IndexSchema::new(EXPIRES_AT_INDEX, EXPIRES_AT_PATH))
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Whether this partition has the layout of [`expiring_cache`](Self::expiring_cache).
    pub fn is_expiring_cache(&self) -> bool {
        self.key_path == CACHE_KEY_PATH
            && self
                .index(EXPIRES_AT_INDEX)
                .is_some_and(|i| i.key_path == EXPIRES_AT_PATH)
    }
}

/// Full store schema at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub version: u32,
    pub partitions: Vec<PartitionSchema>,
}

impl StoreSchema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            partitions: Vec::new(),
        }
    }

    /// Add a partition.
    pub fn with_partition(mut self, partition: PartitionSchema) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionSchema> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Validate the declaration.
    ///
    /// Validates:
    /// - version >= 1
    /// - partition names are unique
    /// - index names are unique within a partition
    /// - no key path is empty
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.version == 0 {
            return Err(SchemaError::InvalidVersion {
                version: self.version,
            });
        }

        let mut seen = HashSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.name.as_str()) {
                return Err(SchemaError::DuplicatePartition {
                    partition: partition.name.clone(),
                });
            }
            if partition.key_path.trim().is_empty() {
                return Err(SchemaError::EmptyKeyPath {
                    target: partition.name.clone(),
                });
            }

            let mut index_names = HashSet::new();
            for index in &partition.indexes {
                if !index_names.insert(index.name.as_str()) {
                    return Err(SchemaError::DuplicateIndex {
                        partition: partition.name.clone(),
                        index: index.name.clone(),
                    });
                }
                if index.key_path.trim().is_empty() {
                    return Err(SchemaError::EmptyKeyPath {
                        target: format!("{}.{}", partition.name, index.name),
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// CATALOG & UPGRADE PLANNING
// ============================================================================

/// What a store actually contains, as recorded by its backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub version: u32,
    /// Partition declarations keyed by name.
    pub partitions: BTreeMap<String, PartitionSchema>,
}

impl SchemaCatalog {
    pub fn partition(&self, name: &str) -> Option<&PartitionSchema> {
        self.partitions.get(name)
    }
}

/// Steps needed to bring a store up to a requested schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    /// Version found in the store, `None` for a fresh store.
    pub from: Option<u32>,
    pub to: u32,
    pub new_partitions: Vec<PartitionSchema>,
    /// `(partition, index)` pairs to create on partitions that already exist.
    pub new_indexes: Vec<(String, IndexSchema)>,
    /// The catalog after applying the plan.
    pub catalog: SchemaCatalog,
}

impl UpgradePlan {
    pub fn is_noop(&self) -> bool {
        self.from == Some(self.to) && self.new_partitions.is_empty() && self.new_indexes.is_empty()
    }
}

/// Plan the upgrade from `existing` (if any) to `target`.
///
/// At an unchanged version the existing catalog is kept as-is; partitions
/// declared without a version bump are not created.
pub fn plan_upgrade(
    existing: Option<&SchemaCatalog>,
    target: &StoreSchema,
) -> Result<UpgradePlan, StorageError> {
    let Some(existing) = existing else {
        return Ok(UpgradePlan {
            from: None,
            to: target.version,
            new_partitions: target.partitions.clone(),
            new_indexes: Vec::new(),
            catalog: SchemaCatalog {
                version: target.version,
                partitions: target
                    .partitions
                    .iter()
                    .map(|p| (p.name.clone(), p.clone()))
                    .collect(),
            },
        });
    };

    if existing.version > target.version {
        return Err(StorageError::SchemaDowngrade {
            stored: existing.version,
            requested: target.version,
        });
    }

    let mut plan = UpgradePlan {
        from: Some(existing.version),
        to: target.version,
        catalog: existing.clone(),
        ..Default::default()
    };

    if existing.version == target.version {
        return Ok(plan);
    }

    for declared in &target.partitions {
        match plan.catalog.partitions.get_mut(&declared.name) {
            None => {
                plan.new_partitions.push(declared.clone());
                plan.catalog
                    .partitions
                    .insert(declared.name.clone(), declared.clone());
            }
            Some(current) => {
                for index in &declared.indexes {
                    if current.index(&index.name).is_none() {
                        plan.new_indexes.push((declared.name.clone(), index.clone()));
                        current.indexes.push(index.clone());
                    }
                }
            }
        }
    }
    plan.catalog.version = target.version;

    Ok(plan)
}
