//! Drives [`Worker::run_once`] concurrently for every `(protocol, network)`
//! pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Worker, WorkerError};
use crate::queue::{LeaseFilter, LeaseSort, QueueItemType};
use crate::scheduling::{SchedulingPolicy, TypeRotation};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// In-flight `run_once` calls allowed per pair.
    pub max_concurrent_tasks: usize,
    pub poll_interval: Duration,
    pub filter: LeaseFilter,
    pub sort: LeaseSort,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_millis(250),
            filter: LeaseFilter::default(),
            sort: LeaseSort::default(),
        }
    }
}

struct Slot {
    worker: Arc<Worker>,
    rotation: TypeRotation,
    in_flight: usize,
}

pub struct TaskPool {
    settings: PoolSettings,
    slots: Vec<Slot>,
    tasks: JoinSet<Result<bool, WorkerError>>,
    owners: HashMap<Id, usize>,
}

impl TaskPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings: PoolSettings {
                max_concurrent_tasks: settings.max_concurrent_tasks.max(1),
                ..settings
            },
            slots: Vec::new(),
            tasks: JoinSet::new(),
            owners: HashMap::new(),
        }
    }

    /// Adds a pair. Types without a registered handler are left out of its
    /// rotation; a pair with nothing left to schedule is skipped.
    pub fn add_worker(&mut self, worker: Arc<Worker>, policy: SchedulingPolicy, types: &[QueueItemType]) {
        let registry = worker.registry();
        let (registered, missing): (Vec<QueueItemType>, Vec<QueueItemType>) =
            types.iter().copied().partition(|t| registry.contains(*t));

        let scope = worker.store().scope().clone();
        if !missing.is_empty() {
            tracing::warn!(scope = %scope, "No handler registered for {:?}, not scheduling them", missing);
        }

        let rotation = TypeRotation::new(policy, &registered);
        if rotation.is_empty() {
            tracing::warn!(scope = %scope, "Nothing to schedule");
            return;
        }

        tracing::info!(
            scope = %scope,
            "Scheduling {:?} with {} rounds",
            policy,
            rotation.rounds().len()
        );
        self.slots.push(Slot {
            worker,
            rotation,
            in_flight: 0,
        });
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Submits one `run_once` for every pair below its concurrency limit and
    /// advances that pair's rotation. Returns how many were submitted.
    pub fn tick(&mut self) -> usize {
        let mut submitted = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.in_flight >= self.settings.max_concurrent_tasks {
                continue;
            }
            let Some(types) = slot.rotation.next() else {
                continue;
            };

            let types = types.to_vec();
            let worker = slot.worker.clone();
            let filter = self.settings.filter.clone();
            let sort = self.settings.sort;
            let handle = self
                .tasks
                .spawn(async move { worker.run_once(&types, &filter, sort).await });

            self.owners.insert(handle.id(), index);
            slot.in_flight += 1;
            submitted += 1;
        }
        submitted
    }

    fn reap(&mut self, joined: Result<(Id, Result<bool, WorkerError>), JoinError>) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, Some(outcome)),
            Err(e) => {
                tracing::error!("Worker task aborted: {}", e);
                (e.id(), None)
            }
        };

        let Some(index) = self.owners.remove(&id) else {
            return;
        };
        let slot = &mut self.slots[index];
        slot.in_flight = slot.in_flight.saturating_sub(1);

        if let Some(Err(e)) = outcome {
            let scope = slot.worker.store().scope();
            match &e {
                WorkerError::Handler { .. } | WorkerError::UnknownType { .. } => {
                    tracing::error!(scope = %scope, "Fatal worker error: {}", e);
                }
                _ => {
                    tracing::error!(scope = %scope, "Worker error: {}", e);
                }
            }
        }
    }

    /// Runs until `shutdown` fires, then waits for in-flight calls.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        if self.slots.is_empty() {
            tracing::warn!("Task pool has no pairs to schedule");
        }

        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        tracing::info!("Task pool draining {} in-flight tasks", self.tasks.len());
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.reap(joined);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{
        submit, Clock, ManualClock, MemoryQueueStore, QueueItem, QueueItemDraft, QueueScope,
        QueueStore,
    };
    use crate::scheduling::EligibilityGate;
    use crate::worker::test_support::{dispatcher, RecordingAlerter, ScriptedHandler};
    use crate::worker::{HandlerError, HandlerRegistry, QueueItemHandler, QueueTelemetry};
    use async_trait::async_trait;
    use serde_json::json;

    const ADDRESS: &str = "0x0000000000000000000000000000000000000001";

    struct SlowHandler;

    #[async_trait]
    impl QueueItemHandler for SlowHandler {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn item_type(&self) -> QueueItemType {
            QueueItemType::Block
        }

        async fn handle(&self, _network: &str, _item: &QueueItem) -> Result<bool, HandlerError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(true)
        }
    }

    fn worker(network: &str, registry: HandlerRegistry) -> (Arc<Worker>, Arc<MemoryQueueStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryQueueStore::new(QueueScope::new("gamma", network), clock.clone()));
        let worker = Worker::new(
            store.clone(),
            Arc::new(registry),
            dispatcher(clock.clone(), Arc::new(RecordingAlerter::default())),
            EligibilityGate::new(true),
            clock.clone(),
            Arc::new(QueueTelemetry::default()),
        );
        (Arc::new(worker), store, clock)
    }

    async fn fill(store: &MemoryQueueStore, clock: &ManualClock, item_type: QueueItemType, blocks: u64) {
        let drafts = (0..blocks)
            .map(|b| QueueItemDraft::new(item_type, b, ADDRESS, json!({})))
            .collect();
        submit(store, drafts, clock.now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_respects_per_pair_limit() {
        let mut registry = HandlerRegistry::new();
        registry.register(SlowHandler);
        let (worker, store, clock) = worker("ethereum", registry);
        fill(&store, &clock, QueueItemType::Block, 10).await;

        let mut pool = TaskPool::new(PoolSettings {
            max_concurrent_tasks: 2,
            ..Default::default()
        });
        pool.add_worker(worker, SchedulingPolicy::RoundRobin, &[QueueItemType::Block]);

        assert_eq!(pool.tick(), 1);
        assert_eq!(pool.tick(), 1);
        assert_eq!(pool.tick(), 0);
        assert_eq!(pool.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_types_are_not_scheduled() {
        let mut registry = HandlerRegistry::new();
        registry.register(ScriptedHandler::new(QueueItemType::Block, vec![]));
        let (worker, _, _) = worker("ethereum", registry);

        let mut pool = TaskPool::new(PoolSettings::default());
        pool.add_worker(worker.clone(), SchedulingPolicy::RoundRobin, &[QueueItemType::Price]);
        assert_eq!(pool.slot_count(), 0);

        pool.add_worker(worker, SchedulingPolicy::RoundRobin, &[QueueItemType::Price, QueueItemType::Block]);
        assert_eq!(pool.slot_count(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_every_pair_and_stops() {
        let mut pool = TaskPool::new(PoolSettings {
            max_concurrent_tasks: 3,
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        });

        let mut stores = Vec::new();
        for network in ["ethereum", "polygon"] {
            let mut registry = HandlerRegistry::new();
            registry.register(ScriptedHandler::new(QueueItemType::Block, vec![Ok(false)]));
            registry.register(ScriptedHandler::new(QueueItemType::Price, vec![]));
            let (worker, store, clock) = worker(network, registry);
            fill(&store, &clock, QueueItemType::Block, 5).await;
            fill(&store, &clock, QueueItemType::Price, 5).await;
            pool.add_worker(
                worker,
                SchedulingPolicy::RoundRobin,
                &[QueueItemType::Block, QueueItemType::Price],
            );
            stores.push(store);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pool.run(shutdown.clone()));

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if stores.iter().all(|s| s.is_empty()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(drained.is_ok(), "queues were not drained");
        for store in &stores {
            assert!(store.leased().await.unwrap().is_empty());
        }
    }
}
