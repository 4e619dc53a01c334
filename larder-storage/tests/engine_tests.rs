//! Store engine behavior across lifecycle, batches and schema upgrades.

use futures_util::future::join_all;
use larder_core::{IndexSchema, PartitionSchema, StorageError, StoreSchema};
use larder_storage::{MemoryProvider, StoreEngine};
use larder_test_utils::fixtures::{self, USERS};
use larder_test_utils::{assertions, LarderError, LarderResult};
use serde_json::json;

#[tokio::test]
async fn add_collides_and_put_overwrites() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    engine.add(USERS, fixtures::user(1, "a@x", 30)).await?;

    let collision = engine.add(USERS, fixtures::user(1, "b@x", 31)).await;
    assertions::assert_key_collision(&collision);
    assert_eq!(engine.get(USERS, 1).await?, Some(fixtures::user(1, "a@x", 30)));

    engine.put(USERS, fixtures::user(1, "b@x", 31)).await?;
    assert_eq!(engine.get(USERS, 1).await?, Some(fixtures::user(1, "b@x", 31)));
    assert_eq!(engine.count(USERS).await?, 1);
    Ok(())
}

#[tokio::test]
async fn bulk_put_keeps_prefix_and_skips_rest() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    engine.put(USERS, fixtures::user(100, "dup@x", 1)).await?;

    let result = engine
        .bulk_put(
            USERS,
            vec![
                fixtures::user(1, "a@x", 1),
                fixtures::user(2, "dup@x", 2),
                fixtures::user(3, "c@x", 3),
            ],
        )
        .await;

    let cause = assertions::assert_partial_batch(&result, 1);
    assert!(matches!(cause, StorageError::ConstraintViolation { .. }));
    assert!(engine.get(USERS, 1).await?.is_some());
    assert!(engine.get(USERS, 2).await?.is_none());
    assert!(engine.get(USERS, 3).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn bulk_delete_stops_at_failing_key() -> LarderResult<()> {
    let (engine, provider) = fixtures::faulty_engine();
    engine
        .bulk_put(
            USERS,
            (1..=3).map(|i| fixtures::user(i, &format!("{i}@x"), i)),
        )
        .await?;

    provider.fail_key(2);
    let result = engine.bulk_delete(USERS, [1, 2, 3]).await;
    assertions::assert_partial_batch(&result, 1);

    assert!(engine.get(USERS, 1).await?.is_none());
    assert!(engine.get(USERS, 2).await?.is_some());
    assert!(engine.get(USERS, 3).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn close_then_get_reinitializes() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    engine.put(USERS, fixtures::user(1, "a@x", 1)).await?;

    engine.close().await;
    assert!(!engine.is_open().await);

    assert!(engine.get(USERS, 1).await?.is_some());
    assert!(engine.is_open().await);
    Ok(())
}

#[tokio::test]
async fn close_is_shared_by_clones() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    let other = engine.clone();
    engine.init().await?;
    assert!(other.is_open().await);

    other.close().await;
    assert!(!engine.is_open().await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_init_opens_once() -> LarderResult<()> {
    let provider = MemoryProvider::new();
    let engine = fixtures::memory_engine_with(provider.clone(), fixtures::test_schema());

    let results = join_all((0..16).map(|_| {
        let engine = engine.clone();
        async move { engine.count(USERS).await }
    }))
    .await;

    for result in results {
        assert_eq!(result?, 0);
    }
    assert_eq!(provider.open_count(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_init_is_retried() -> LarderResult<()> {
    let (engine, provider) = fixtures::faulty_engine();
    provider.fail_next_opens(2);

    assertions::assert_initialization_error(&engine.get(USERS, 1).await);
    assertions::assert_initialization_error(&engine.init().await);
    assert!(!engine.is_open().await);

    engine.init().await?;
    assert!(engine.is_open().await);
    assert_eq!(provider.inner().open_count(), 1);
    Ok(())
}

#[tokio::test]
async fn upgrade_adds_partition_and_backfills_index() -> LarderResult<()> {
    let provider = MemoryProvider::new();
    let v1 = StoreSchema::new(1).with_partition(PartitionSchema::new("orders", "id"));
    let engine = StoreEngine::new(provider.clone(), v1)?;
    engine
        .bulk_put(
            "orders",
            vec![
                json!({"id": "o1", "total": 30}),
                json!({"id": "o2", "total": 10}),
                json!({"id": "o3"}),
            ],
        )
        .await?;
    engine.close().await;

    let v2 = StoreSchema::new(2)
        .with_partition(
            PartitionSchema::new("orders", "id").with_index(IndexSchema::new("total", "total")),
        )
        .with_partition(PartitionSchema::new("invoices", "id"));
    let upgraded = StoreEngine::new(provider.clone(), v2)?;

    let by_total = upgraded
        .query("orders", "total", &larder_core::KeyRange::all())
        .await?;
    let ids: Vec<_> = by_total.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!("o2"), json!("o1")]);

    assert_eq!(upgraded.count("invoices").await?, 0);
    assert_eq!(provider.stored_version(), Some(2));
    Ok(())
}

#[tokio::test]
async fn same_version_does_not_add_partitions() -> LarderResult<()> {
    let provider = MemoryProvider::new();
    let v1 = StoreSchema::new(1).with_partition(PartitionSchema::new("orders", "id"));
    StoreEngine::new(provider.clone(), v1)?.init().await?;

    let v1_with_extra = StoreSchema::new(1)
        .with_partition(PartitionSchema::new("orders", "id"))
        .with_partition(PartitionSchema::new("late", "id"));
    let engine = StoreEngine::new(provider, v1_with_extra)?;

    let err = engine.count("late").await.unwrap_err();
    assert!(matches!(
        err,
        LarderError::Storage(StorageError::UnknownPartition { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn downgrade_fails_initialization() -> LarderResult<()> {
    let provider = MemoryProvider::new();
    fixtures::memory_engine_with(provider.clone(), fixtures::test_schema_v(3))
        .init()
        .await?;

    let older = fixtures::memory_engine_with(provider, fixtures::test_schema_v(2));
    let err = older.init().await.unwrap_err();
    assert_eq!(
        err,
        LarderError::Storage(StorageError::SchemaDowngrade {
            stored: 3,
            requested: 2
        })
    );
    Ok(())
}

#[tokio::test]
async fn delete_all_tears_down_everything() -> LarderResult<()> {
    let provider = MemoryProvider::new();
    let engine = fixtures::memory_engine_with(provider.clone(), fixtures::test_schema_v(2));
    engine.put(USERS, fixtures::user(1, "a@x", 1)).await?;

    engine.delete_all().await?;
    assert!(!engine.is_open().await);
    assert_eq!(provider.stored_version(), None);

    // a lower version is accepted after teardown
    let fresh = fixtures::memory_engine_with(provider, fixtures::test_schema_v(1));
    assert_eq!(fresh.count(USERS).await?, 0);
    Ok(())
}

#[tokio::test]
async fn records_without_index_key_are_not_indexed() -> LarderResult<()> {
    let engine = fixtures::memory_engine();
    engine.put(USERS, json!({"id": 1, "age": 5})).await?;
    engine.put(USERS, json!({"id": 2, "age": "n/a", "email": true})).await?;
    engine.put(USERS, json!({"id": 3})).await?;

    let aged = engine.query(USERS, "age", &larder_core::KeyRange::all()).await?;
    assert_eq!(aged.len(), 2);
    let mailed = engine.query(USERS, "email", &larder_core::KeyRange::all()).await?;
    assert!(mailed.is_empty());
    Ok(())
}
