use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::queue::{Clock, QueueStore, StoreError};
use crate::recovery::{AlertKind, Alerter};
use crate::scheduling::eligibility::MANUAL_REVIEW_CEILING;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub freed: u64,
    /// Items past the manual-review ceiling, summed over all scopes.
    pub poisoned: usize,
}

/// Frees leases older than the staleness threshold. Leases never expire on
/// their own; this sweep is what reclaims work from crashed workers.
pub struct LockRecovery {
    stores: Vec<Arc<dyn QueueStore>>,
    clock: Arc<dyn Clock>,
    alerter: Arc<dyn Alerter>,
    staleness: Duration,
    interval: Duration,
}

impl LockRecovery {
    pub fn new(
        stores: Vec<Arc<dyn QueueStore>>,
        clock: Arc<dyn Clock>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            stores,
            clock,
            alerter,
            staleness: DEFAULT_STALENESS,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass over every scope. A failing scope is logged and skipped so
    /// the others still get swept.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for store in &self.stores {
            match self.sweep_store(store.as_ref()).await {
                Ok((freed, poisoned)) => {
                    report.freed += freed;
                    report.poisoned += poisoned;
                }
                Err(e) => {
                    tracing::error!(scope = %store.scope(), "Lock recovery sweep failed: {}", e);
                }
            }
        }
        report
    }

    async fn sweep_store(&self, store: &dyn QueueStore) -> Result<(u64, usize), StoreError> {
        let now = self.clock.now();
        let threshold = self.staleness.as_secs();
        // Stale means strictly older than the threshold.
        let cutoff = now.saturating_sub(threshold.saturating_add(1));

        let stale: Vec<String> = store
            .leased()
            .await?
            .into_iter()
            .filter(|item| item.lease_time <= cutoff)
            .map(|item| item.id)
            .collect();

        // Re-checked by the store: a worker may have re-leased an id since it
        // was listed.
        let freed = if stale.is_empty() {
            0
        } else {
            store.free_stale(&stale, cutoff).await?
        };
        if freed > 0 {
            tracing::info!(scope = %store.scope(), "Freed {} stale leases", freed);
        }

        let poisoned = store.poisoned(MANUAL_REVIEW_CEILING).await?;
        if !poisoned.is_empty() {
            for item in &poisoned {
                tracing::warn!(
                    scope = %store.scope(),
                    "Item {} ({} at block {}) needs manual review after {} attempts",
                    item.id, item.item_type, item.block, item.attempt_count
                );
            }
            self.alerter.alert(
                AlertKind::PoisonItems,
                &format!(
                    "{}: {} items exceed {} attempts",
                    store.scope(),
                    poisoned.len(),
                    MANUAL_REVIEW_CEILING
                ),
            );
        }

        Ok((freed, poisoned.len()))
    }

    /// Sweeps on a fixed interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Lock recovery running every {:?} over {} scopes (staleness {:?})",
            self.interval,
            self.stores.len(),
            self.staleness
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Lock recovery shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{
        submit, LeaseFilter, LeaseSort, ManualClock, MemoryQueueStore, QueueItem,
        QueueItemDraft, QueueItemType, QueueScope,
    };
    use crate::worker::test_support::RecordingAlerter;
    use async_trait::async_trait;
    use serde_json::json;

    const ADDRESS: &str = "0x0000000000000000000000000000000000000001";

    fn store(clock: Arc<ManualClock>, network: &str) -> Arc<MemoryQueueStore> {
        Arc::new(MemoryQueueStore::new(QueueScope::new("gamma", network), clock))
    }

    async fn lease_one(store: &MemoryQueueStore, block: u64, now: u64) -> String {
        submit(
            store,
            vec![QueueItemDraft::new(QueueItemType::Block, block, ADDRESS, json!({}))],
            now,
        )
        .await
        .unwrap();
        store
            .lease_next(&[QueueItemType::Block], &LeaseFilter::default(), LeaseSort::default())
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_crashed_lease_is_reclaimed_only_after_threshold() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = store(clock.clone(), "ethereum");
        let id = lease_one(&store, 1, clock.now()).await;

        let recovery = LockRecovery::new(
            vec![store.clone() as Arc<dyn QueueStore>],
            clock.clone(),
            Arc::new(RecordingAlerter::default()),
        );

        clock.advance(DEFAULT_STALENESS.as_secs());
        assert_eq!(recovery.sweep().await.freed, 0);
        assert!(store.get(&id).await.unwrap().unwrap().is_leased());
        let again = store
            .lease_next(&[QueueItemType::Block], &LeaseFilter::default(), LeaseSort::default())
            .await
            .unwrap();
        assert!(again.is_none());

        clock.advance(1);
        assert_eq!(recovery.sweep().await.freed, 1);
        let released = store.get(&id).await.unwrap().unwrap();
        assert!(!released.is_leased());
        assert_eq!(released.attempt_count, 0);

        let again = store
            .lease_next(&[QueueItemType::Block], &LeaseFilter::default(), LeaseSort::default())
            .await
            .unwrap();
        assert_eq!(again.unwrap().id, id);
    }

    /// Lets a worker free and re-lease every listed item between the sweep's
    /// read of `leased()` and its free.
    struct ReleasingStore {
        inner: Arc<MemoryQueueStore>,
    }

    #[async_trait]
    impl QueueStore for ReleasingStore {
        fn scope(&self) -> &QueueScope {
            self.inner.scope()
        }

        async fn upsert_many(&self, items: &[QueueItem]) -> Result<(), StoreError> {
            self.inner.upsert_many(items).await
        }

        async fn submit_many(&self, items: &[QueueItem]) -> Result<Vec<QueueItem>, StoreError> {
            self.inner.submit_many(items).await
        }

        async fn lease_next(
            &self,
            types: &[QueueItemType],
            filter: &LeaseFilter,
            sort: LeaseSort,
        ) -> Result<Option<QueueItem>, StoreError> {
            self.inner.lease_next(types, filter, sort).await
        }

        async fn free(&self, id: &str, attempt_count: u32) -> Result<(), StoreError> {
            self.inner.free(id, attempt_count).await
        }

        async fn free_stale(&self, ids: &[String], cutoff: u64) -> Result<u64, StoreError> {
            self.inner.free_stale(ids, cutoff).await
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }

        async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
            self.inner.get(id).await
        }

        async fn leased(&self) -> Result<Vec<QueueItem>, StoreError> {
            let snapshot = self.inner.leased().await?;
            for item in &snapshot {
                self.inner.free(&item.id, item.attempt_count + 1).await?;
                self.inner
                    .lease_next(&[item.item_type], &LeaseFilter::any_attempts(), LeaseSort::default())
                    .await?;
            }
            Ok(snapshot)
        }

        async fn poisoned(&self, ceiling: u32) -> Result<Vec<QueueItem>, StoreError> {
            self.inner.poisoned(ceiling).await
        }
    }

    #[tokio::test]
    async fn test_fresh_lease_taken_during_sweep_is_kept() {
        let clock = Arc::new(ManualClock::new(10_000));
        let inner = store(clock.clone(), "ethereum");
        let id = lease_one(&inner, 1, clock.now()).await;

        let recovery = LockRecovery::new(
            vec![Arc::new(ReleasingStore { inner: inner.clone() }) as Arc<dyn QueueStore>],
            clock.clone(),
            Arc::new(RecordingAlerter::default()),
        );

        clock.advance(DEFAULT_STALENESS.as_secs() + 1);
        assert_eq!(recovery.sweep().await.freed, 0);

        let item = inner.get(&id).await.unwrap().unwrap();
        assert_eq!(item.lease_time, 10_901);
        assert_eq!(item.attempt_count, 1);
        let again = inner
            .lease_next(&[QueueItemType::Block], &LeaseFilter::default(), LeaseSort::default())
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_sweeps_every_scope_and_reports_poison() {
        let clock = Arc::new(ManualClock::new(10_000));
        let eth = store(clock.clone(), "ethereum");
        let polygon = store(clock.clone(), "polygon");
        lease_one(&eth, 1, clock.now()).await;
        lease_one(&polygon, 2, clock.now()).await;

        let mut items = submit(
            polygon.as_ref(),
            vec![QueueItemDraft::new(QueueItemType::Price, 3, ADDRESS, json!({}))],
            clock.now(),
        )
        .await
        .unwrap();
        items[0].attempt_count = MANUAL_REVIEW_CEILING + 1;
        polygon.upsert_many(&items).await.unwrap();

        let alerter = Arc::new(RecordingAlerter::default());
        let recovery = LockRecovery::new(
            vec![eth.clone() as Arc<dyn QueueStore>, polygon.clone()],
            clock.clone(),
            alerter.clone(),
        )
        .with_staleness(Duration::from_secs(60));

        clock.advance(61);
        let report = recovery.sweep().await;
        assert_eq!(report, SweepReport { freed: 2, poisoned: 1 });
        assert_eq!(*alerter.0.lock().unwrap(), vec![AlertKind::PoisonItems]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let recovery = LockRecovery::new(
            vec![store(clock.clone(), "ethereum") as Arc<dyn QueueStore>],
            clock,
            Arc::new(RecordingAlerter::default()),
        )
        .with_interval(Duration::from_millis(5));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(recovery.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
