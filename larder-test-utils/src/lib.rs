//! LARDER Test Utilities
//!
//! Shared test infrastructure for the LARDER workspace:
//! - A fault-injecting storage provider
//! - Counting fetchers for read-through tests
//! - Proptest generators for keys and records
//! - Fixtures for common schemas and engines
//! - Assertions for LARDER error variants

pub use larder_core::{
    IndexSchema, KeyRange, KeyValue, LarderError, LarderResult, PartitionSchema, Record,
    SchemaCatalog, StorageError, StoreSchema,
};
pub use larder_storage::{
    Connection, LmdbProvider, MemoryConnection, MemoryProvider, StorageProvider, StoreEngine,
    WriteMode,
};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// In-memory provider that fails on demand.
///
/// - `fail_next_opens(n)`: the next `n` opens fail with `Initialization`
/// - `fail_key(k)`: writes and deletes of primary key `k` fail with
///   `TransactionFailed`, in every partition
#[derive(Debug, Clone, Default)]
pub struct FaultyProvider {
    inner: MemoryProvider,
    failing_opens: Arc<AtomicUsize>,
    failing_keys: Arc<Mutex<BTreeSet<KeyValue>>>,
}

impl FaultyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped provider, for open counts and stored versions.
    pub fn inner(&self) -> &MemoryProvider {
        &self.inner
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_key(&self, key: impl Into<KeyValue>) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(key.into());
        }
    }

    pub fn clear_faults(&self) {
        self.failing_opens.store(0, Ordering::SeqCst);
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.clear();
        }
    }
}

#[async_trait]
impl StorageProvider for FaultyProvider {
    type Connection = FaultyConnection;

    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn open(&self, schema: &StoreSchema) -> Result<FaultyConnection, StorageError> {
        let fail = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StorageError::Initialization {
                reason: "injected: storage unavailable".to_string(),
            });
        }

        Ok(FaultyConnection {
            inner: self.inner.open(schema).await?,
            failing_keys: Arc::clone(&self.failing_keys),
        })
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        self.inner.destroy().await
    }
}

/// Connection of a [`FaultyProvider`].
#[derive(Debug)]
pub struct FaultyConnection {
    inner: MemoryConnection,
    failing_keys: Arc<Mutex<BTreeSet<KeyValue>>>,
}

impl FaultyConnection {
    fn check(&self, key: &KeyValue) -> Result<(), StorageError> {
        let failing = self
            .failing_keys
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains(key);
        if failing {
            return Err(StorageError::TransactionFailed {
                reason: format!("injected: write of {key} rejected"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for FaultyConnection {
    fn catalog(&self) -> &SchemaCatalog {
        self.inner.catalog()
    }

    async fn get(&self, partition: &str, key: &KeyValue) -> Result<Option<Record>, StorageError> {
        self.inner.get(partition, key).await
    }

    async fn get_all(&self, partition: &str) -> Result<Vec<Record>, StorageError> {
        self.inner.get_all(partition).await
    }

    async fn write(
        &self,
        partition: &str,
        record: Record,
        mode: WriteMode,
    ) -> Result<(), StorageError> {
        let pk = self
            .catalog()
            .partition(partition)
            .and_then(|p| KeyValue::extract(&record, &p.key_path));
        if let Some(pk) = pk {
            self.check(&pk)?;
        }
        self.inner.write(partition, record, mode).await
    }

    async fn delete(&self, partition: &str, key: &KeyValue) -> Result<bool, StorageError> {
        self.check(key)?;
        self.inner.delete(partition, key).await
    }

    async fn clear(&self, partition: &str) -> Result<(), StorageError> {
        self.inner.clear(partition).await
    }

    async fn count(&self, partition: &str) -> Result<u64, StorageError> {
        self.inner.count(partition).await
    }

    async fn query(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Record>, StorageError> {
        self.inner.query(partition, index, range).await
    }

    async fn delete_range(
        &self,
        partition: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<u64, StorageError> {
        self.inner.delete_range(partition, index, range).await
    }
}

// ============================================================================
// FETCHERS
// ============================================================================

pub mod fetchers {
    //! Fetchers that count how often they run.

    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use larder_core::FetchError;

    /// Hands out fetch closures and counts their invocations.
    #[derive(Debug, Clone, Default)]
    pub struct CountingFetcher {
        calls: Arc<AtomicUsize>,
    }

    impl CountingFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// How many handed-out fetchers have run.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// A fetcher resolving to `value`.
        pub fn returning<T>(
            &self,
            value: T,
        ) -> impl FnOnce() -> BoxFuture<'static, LarderResult<T>> + Send + 'static
        where
            T: Send + 'static,
        {
            let calls = Arc::clone(&self.calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(value) }.boxed()
            }
        }

        /// A fetcher failing with `FetchError::Failed`.
        pub fn failing<T>(
            &self,
            key: &str,
            reason: &str,
        ) -> impl FnOnce() -> BoxFuture<'static, LarderResult<T>> + Send + 'static
        where
            T: Send + 'static,
        {
            let calls = Arc::clone(&self.calls);
            let error = FetchError::failed(key, reason);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(error.into()) }.boxed()
            }
        }
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, ranges and records.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// Generate a finite numeric key.
    pub fn arb_number_key() -> impl Strategy<Value = KeyValue> {
        (-1.0e12f64..1.0e12f64).prop_map(KeyValue::Number)
    }

    /// Generate a text key, including empty strings and NUL bytes.
    pub fn arb_text_key() -> impl Strategy<Value = KeyValue> {
        prop_oneof![
            "[a-z]{0,8}".prop_map(KeyValue::Text),
            prop::collection::vec(prop_oneof![Just('\0'), Just('a'), Just('\u{7f}')], 0..6)
                .prop_map(|chars| KeyValue::Text(chars.into_iter().collect())),
        ]
    }

    /// Generate any key.
    pub fn arb_key_value() -> impl Strategy<Value = KeyValue> {
        prop_oneof![arb_number_key(), arb_text_key()]
    }

    /// Generate a key range over small integers.
    pub fn arb_int_range() -> impl Strategy<Value = KeyRange> {
        prop_oneof![
            Just(KeyRange::all()),
            (0i64..50).prop_map(KeyRange::only),
            (0i64..50).prop_map(KeyRange::at_most),
            (0i64..50).prop_map(KeyRange::below),
            (0i64..50).prop_map(KeyRange::at_least),
            (0i64..50).prop_map(KeyRange::above),
            (0i64..50, 0i64..50, any::<bool>(), any::<bool>())
                .prop_map(|(lo, hi, lo_open, hi_open)| KeyRange::between(lo, hi, lo_open, hi_open)),
        ]
    }

    /// Generate a `users` record with a unique id and an optional age.
    pub fn arb_user(id: i64) -> impl Strategy<Value = Record> {
        proptest::option::of(0i64..50).prop_map(move |age| match age {
            Some(age) => json!({"id": id, "age": age}),
            None => json!({"id": id}),
        })
    }

    /// Generate `n` users with distinct ids `0..n`.
    pub fn arb_users(max: usize) -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec(proptest::option::of(0i64..50), 0..max).prop_map(|ages| {
            ages.into_iter()
                .enumerate()
                .map(|(id, age)| match age {
                    Some(age) => json!({"id": id, "age": age}),
                    None => json!({"id": id}),
                })
                .collect()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built schemas, records and engines.

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Name of the TTL partition in [`test_schema`].
    pub const CACHE: &str = "cache";
    /// Name of the plain partition in [`test_schema`].
    pub const USERS: &str = "users";

    /// `cache` (TTL) and `users` (unique `email`, plain `age`) at `version`.
    pub fn test_schema_v(version: u32) -> StoreSchema {
        StoreSchema::new(version)
            .with_partition(PartitionSchema::expiring_cache(CACHE))
            .with_partition(
                PartitionSchema::new(USERS, "id")
                    .with_index(IndexSchema::unique("email", "email"))
                    .with_index(IndexSchema::new("age", "age")),
            )
    }

    pub fn test_schema() -> StoreSchema {
        test_schema_v(1)
    }

    pub fn user(id: i64, email: &str, age: i64) -> Record {
        json!({"id": id, "email": email, "age": age})
    }

    pub fn memory_engine() -> StoreEngine<MemoryProvider> {
        memory_engine_with(MemoryProvider::new(), test_schema())
    }

    pub fn memory_engine_with(
        provider: MemoryProvider,
        schema: StoreSchema,
    ) -> StoreEngine<MemoryProvider> {
        StoreEngine::new(provider, schema).expect("test schema should be valid")
    }

    /// LMDB engine in a fresh temporary directory. Keep the `TempDir` alive
    /// for as long as the engine.
    pub fn lmdb_engine() -> (StoreEngine<LmdbProvider>, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let provider = LmdbProvider::new(dir.path().join("store"), 10);
        let engine = StoreEngine::new(provider, test_schema()).expect("test schema should be valid");
        (engine, dir)
    }

    /// Engine over a [`FaultyProvider`]; the returned provider shares its
    /// fault switches.
    pub fn faulty_engine() -> (StoreEngine<FaultyProvider>, FaultyProvider) {
        let provider = FaultyProvider::new();
        let engine = StoreEngine::new(provider.clone(), test_schema())
            .expect("test schema should be valid");
        (engine, provider)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for LARDER-specific error variants.

    use super::*;

    /// Assert that a LarderResult is a key collision.
    #[track_caller]
    pub fn assert_key_collision<T: std::fmt::Debug>(result: &LarderResult<T>) {
        match result {
            Err(LarderError::Storage(StorageError::KeyCollision { .. })) => {}
            other => panic!("Expected KeyCollision, got: {:?}", other),
        }
    }

    /// Assert that a LarderResult is an initialization failure.
    #[track_caller]
    pub fn assert_initialization_error<T: std::fmt::Debug>(result: &LarderResult<T>) {
        match result {
            Err(LarderError::Storage(StorageError::Initialization { .. })) => {}
            other => panic!("Expected Initialization error, got: {:?}", other),
        }
    }

    /// Assert that a batch stopped at `failed_at` and return the error that
    /// stopped it.
    #[track_caller]
    pub fn assert_partial_batch<T: std::fmt::Debug>(
        result: &LarderResult<T>,
        failed_at: usize,
    ) -> StorageError {
        match result {
            Err(LarderError::Storage(StorageError::PartialBatch {
                failed_at: at,
                committed,
                source,
                ..
            })) => {
                assert_eq!(*at, failed_at, "Batch failed at the wrong item");
                assert_eq!(*committed, failed_at, "Items before the failure should be committed");
                (**source).clone()
            }
            other => panic!("Expected PartialBatch at {failed_at}, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_faulty_provider_fails_opens_then_recovers() {
        let (engine, provider) = fixtures::faulty_engine();
        provider.fail_next_opens(1);

        assertions::assert_initialization_error(&engine.init().await);
        assert!(engine.init().await.is_ok());
    }

    #[tokio::test]
    async fn test_faulty_provider_fails_keys() {
        let (engine, provider) = fixtures::faulty_engine();
        provider.fail_key(2);

        let result = engine
            .bulk_put(
                fixtures::USERS,
                vec![
                    fixtures::user(1, "a", 1),
                    fixtures::user(2, "b", 2),
                    fixtures::user(3, "c", 3),
                ],
            )
            .await;
        let cause = assertions::assert_partial_batch(&result, 1);
        assert!(matches!(cause, StorageError::TransactionFailed { .. }));

        provider.clear_faults();
        assert!(engine.put(fixtures::USERS, fixtures::user(2, "b", 2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_counting_fetcher() {
        let fetcher = fetchers::CountingFetcher::new();
        let ok = fetcher.returning(7u32)().await;
        let err = fetcher.failing::<u32>("k", "down")().await;

        assert_eq!(ok, Ok(7));
        assert!(matches!(err, Err(LarderError::Fetch(_))));
        assert_eq!(fetcher.calls(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_keys_round_trip(key in generators::arb_key_value()) {
            prop_assert_eq!(KeyValue::decode(&key.encode()), Some(key));
        }

        #[test]
        fn prop_generated_users_have_distinct_ids(users in generators::arb_users(20)) {
            let ids: BTreeSet<_> = users.iter().map(|u| u["id"].to_string()).collect();
            prop_assert_eq!(ids.len(), users.len());
        }
    }
}
