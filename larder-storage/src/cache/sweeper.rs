//! Expiry Sweeper Background Task
//!
//! Periodically runs [`ExpiringCache::clear_expired_cache`] so entries that
//! are never read again still leave storage. Lazy eviction on read bounds
//! what callers see; the sweeper bounds how much dead data is kept.
//!
//! ```ignore
//! let sweeper = ExpirySweeper::spawn(cache, Duration::from_secs(300));
//! // ...
//! let totals = sweeper.shutdown().await;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::expiring::ExpiringCache;
use crate::backend::StorageProvider;

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for expiry sweeps.
#[derive(Debug, Default)]
pub struct SweeperMetrics {
    /// Total sweep cycles completed
    pub cycles: AtomicU64,

    /// Total expired entries removed since startup
    pub removed: AtomicU64,

    /// Total sweep failures
    pub errors: AtomicU64,
}

impl SweeperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SweeperSnapshot {
        SweeperSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweeper metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweeperSnapshot {
    pub cycles: u64,
    pub removed: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Shortest interval between sweeps. Shorter requests are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Sweep `cache` every `every` until the shutdown signal is received.
///
/// The first sweep runs immediately. Sweep failures are logged and counted;
/// the task keeps running.
pub async fn expiry_sweep_task<P: StorageProvider>(
    cache: ExpiringCache<P>,
    every: Duration,
    metrics: Arc<SweeperMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweeperMetrics> {
    let every = every.max(MIN_SWEEP_INTERVAL);
    let mut sweep_interval = interval(every);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        partition = %cache.partition(),
        interval_ms = every.as_millis() as u64,
        "Expiry sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // a dropped sender also stops the sweeper
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!(partition = %cache.partition(), "Expiry sweeper shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(&cache, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        partition = %cache.partition(),
        cycles = snapshot.cycles,
        removed = snapshot.removed,
        errors = snapshot.errors,
        "Expiry sweeper completed"
    );

    metrics
}

async fn sweep_once<P: StorageProvider>(cache: &ExpiringCache<P>, metrics: &SweeperMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    match cache.clear_expired_cache().await {
        Ok(0) => {
            tracing::trace!(partition = %cache.partition(), "Expiry sweep found nothing to remove");
        }
        Ok(removed) => {
            metrics.removed.fetch_add(removed, Ordering::Relaxed);
            tracing::info!(
                partition = %cache.partition(),
                removed,
                "Expiry sweep removed entries"
            );
        }
        Err(e) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, partition = %cache.partition(), "Expiry sweep failed");
        }
    }
}

/// Handle to a spawned [`expiry_sweep_task`].
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Arc<SweeperMetrics>>,
    metrics: Arc<SweeperMetrics>,
}

impl ExpirySweeper {
    /// Spawn a sweeper on the current tokio runtime.
    pub fn spawn<P: StorageProvider>(cache: ExpiringCache<P>, every: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(SweeperMetrics::new());
        let handle = tokio::spawn(expiry_sweep_task(
            cache,
            every,
            Arc::clone(&metrics),
            shutdown_rx,
        ));
        Self {
            shutdown_tx,
            handle,
            metrics,
        }
    }

    pub fn metrics(&self) -> SweeperSnapshot {
        self.metrics.snapshot()
    }

    /// Signal shutdown and wait for the task to finish.
    pub async fn shutdown(self) -> SweeperSnapshot {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Expiry sweeper task panicked or was cancelled");
        }
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryProvider;
    use crate::engine::StoreEngine;
    use larder_core::{PartitionSchema, StoreSchema};

    fn cache() -> ExpiringCache<MemoryProvider> {
        let schema = StoreSchema::new(1).with_partition(PartitionSchema::expiring_cache("cache"));
        let engine = StoreEngine::new(MemoryProvider::new(), schema).expect("schema");
        ExpiringCache::new(engine, "cache").expect("cache")
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = cache();
        cache
            .set_cache_at("gone", &1, Duration::ZERO, 0)
            .await
            .expect("set");
        cache
            .set_cache("kept", &2, Duration::from_secs(60))
            .await
            .expect("set");

        let sweeper = ExpirySweeper::spawn(cache.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let totals = sweeper.shutdown().await;

        assert!(totals.cycles >= 1);
        assert_eq!(totals.removed, 1);
        assert_eq!(totals.errors, 0);
        assert!(cache.peek("gone").await.expect("peek").is_none());
        assert!(cache.peek("kept").await.expect("peek").is_some());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_task() {
        let (tx, rx) = watch::channel(false);
        let metrics = Arc::new(SweeperMetrics::new());
        let task = tokio::spawn(expiry_sweep_task(
            cache(),
            Duration::from_secs(3600),
            Arc::clone(&metrics),
            rx,
        ));
        drop(tx);

        let finished = task.await.expect("task");
        assert_eq!(finished.snapshot().errors, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let sweeper = ExpirySweeper::spawn(cache(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let totals = sweeper.shutdown().await;

        assert!(totals.cycles >= 1);
        assert_eq!(totals.errors, 0);
    }
}
