//! Error types for LARDER operations

use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("Key already exists in {partition}: {key}")]
    KeyCollision { partition: String, key: String },

    #[error("Unique index {index} on {partition} already holds {key}")]
    ConstraintViolation {
        partition: String,
        index: String,
        key: String,
    },

    #[error("Unknown partition: {partition}")]
    UnknownPartition { partition: String },

    #[error("Unknown index {index} on {partition}")]
    UnknownIndex { partition: String, index: String },

    #[error("Invalid key at {key_path} in {partition}: {reason}")]
    InvalidKey {
        partition: String,
        key_path: String,
        reason: String,
    },

    /// A bulk write stopped at `failed_at`; the `committed` items before it
    /// remain written.
    #[error("Batch write to {partition} failed at item {failed_at} ({committed} committed): {source}")]
    PartialBatch {
        partition: String,
        failed_at: usize,
        committed: usize,
        source: Box<StorageError>,
    },

    #[error("Stored schema version {stored} is newer than requested version {requested}")]
    SchemaDowngrade { stored: u32, requested: u32 },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// The error that actually stopped a batch, or `self` for single writes.
    pub fn root_cause(&self) -> &StorageError {
        match self {
            StorageError::PartialBatch { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Schema declaration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Schema version must be at least 1, got {version}")]
    InvalidVersion { version: u32 },

    #[error("Partition declared twice: {partition}")]
    DuplicatePartition { partition: String },

    #[error("Index {index} declared twice on {partition}")]
    DuplicateIndex { partition: String, index: String },

    #[error("Empty key path for {target}")]
    EmptyKeyPath { target: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Remote fetcher errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed for {key}: {reason}")]
    Failed { key: String, reason: String },

    #[error("Fetch task for {key} was aborted")]
    Aborted { key: String },
}

impl FetchError {
    pub fn failed(key: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::Failed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Master error type for all LARDER errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LarderError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

impl LarderError {
    /// Returns the storage error if this is one.
    pub fn as_storage(&self) -> Option<&StorageError> {
        match self {
            LarderError::Storage(e) => Some(e),
            _ => None,
        }
    }

    /// True for `StorageError::KeyCollision`, including inside a failed batch.
    pub fn is_key_collision(&self) -> bool {
        matches!(
            self.as_storage().map(StorageError::root_cause),
            Some(StorageError::KeyCollision { .. })
        )
    }

    /// True for initialization failures, which a later call may retry.
    pub fn is_initialization(&self) -> bool {
        matches!(self, LarderError::Storage(StorageError::Initialization { .. }))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for LarderError {
    fn from(e: serde_json::Error) -> Self {
        LarderError::Storage(e.into())
    }
}

/// Result type alias for LARDER operations.
pub type LarderResult<T> = Result<T, LarderError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_key_collision() {
        let err = StorageError::KeyCollision {
            partition: "products".to_string(),
            key: "\"p1\"".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Key already exists"));
        assert!(msg.contains("products"));
        assert!(msg.contains("p1"));
    }

    #[test]
    fn test_partial_batch_display_and_root_cause() {
        let inner = StorageError::ConstraintViolation {
            partition: "users".to_string(),
            index: "email".to_string(),
            key: "\"a@b.c\"".to_string(),
        };
        let err = StorageError::PartialBatch {
            partition: "users".to_string(),
            failed_at: 1,
            committed: 1,
            source: Box::new(inner.clone()),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("failed at item 1"));
        assert!(msg.contains("1 committed"));
        assert!(msg.contains("email"));
        assert_eq!(err.root_cause(), &inner);
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "map_size_mb".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("map_size_mb"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_larder_error_from_variants() {
        let storage = LarderError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, LarderError::Storage(_)));

        let schema = LarderError::from(SchemaError::InvalidVersion { version: 0 });
        assert!(matches!(schema, LarderError::Schema(_)));

        let config = LarderError::from(ConfigError::MissingRequired {
            field: "storage_path".to_string(),
        });
        assert!(matches!(config, LarderError::Config(_)));

        let fetch = LarderError::from(FetchError::failed("k", "offline"));
        assert!(matches!(fetch, LarderError::Fetch(_)));
    }

    #[test]
    fn test_key_collision_detected_inside_batch() {
        let err = LarderError::from(StorageError::PartialBatch {
            partition: "p".to_string(),
            failed_at: 0,
            committed: 0,
            source: Box::new(StorageError::KeyCollision {
                partition: "p".to_string(),
                key: "1".to_string(),
            }),
        });
        assert!(err.is_key_collision());
        assert!(!err.is_initialization());
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = LarderError::from(bad);
        assert!(matches!(
            err,
            LarderError::Storage(StorageError::Serialization { .. })
        ));
    }
}
