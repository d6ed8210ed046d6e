//! The worker loop and the services that drive it.
//!
//! [`Worker::run_once`] leases one item, dispatches it to the handler
//! registered for its type and settles the lease from the result. The
//! [`pool::TaskPool`] calls it concurrently per `(protocol, network)` and
//! [`lock_recovery::LockRecovery`] reclaims leases abandoned by crashed
//! workers.

pub mod handler;
pub mod lock_recovery;
pub mod pool;
pub mod telemetry;

use std::sync::Arc;

use thiserror::Error;

use crate::queue::{Clock, LeaseFilter, LeaseSort, QueueItem, QueueItemType, QueueStore, StoreError};
use crate::recovery::{AlertKind, DispatchError, ErrorRecoveryDispatcher};
use crate::scheduling::EligibilityGate;

pub use handler::{HandlerError, HandlerRegistry, QueueItemHandler};
pub use lock_recovery::{LockRecovery, SweepReport};
pub use pool::{PoolSettings, TaskPool};
pub use telemetry::QueueTelemetry;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No handler registered for {item_type} (item {id})")]
    UnknownType { item_type: QueueItemType, id: String },

    #[error("Handler '{handler}' failed on item {id}: {source:#}")]
    Handler {
        handler: &'static str,
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error recovery failed: {0}")]
    Recovery(#[from] DispatchError),
}

/// Runs queue items for one `(protocol, network)` scope.
pub struct Worker {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<ErrorRecoveryDispatcher>,
    gate: EligibilityGate,
    clock: Arc<dyn Clock>,
    telemetry: Arc<QueueTelemetry>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        dispatcher: Arc<ErrorRecoveryDispatcher>,
        gate: EligibilityGate,
        clock: Arc<dyn Clock>,
        telemetry: Arc<QueueTelemetry>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            gate,
            clock,
            telemetry,
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Leases and processes at most one item of `types`.
    ///
    /// Returns `Ok(true)` when nothing was leasable or the handler committed,
    /// `Ok(false)` when the item was ineligible, failed, or raised a
    /// classified error that was forwarded to recovery.
    pub async fn run_once(
        &self,
        types: &[QueueItemType],
        filter: &LeaseFilter,
        sort: LeaseSort,
    ) -> Result<bool, WorkerError> {
        let network = self.store.scope().network.as_str();
        let filter = self.gate.lease_filter(filter);

        let item = match self.store.lease_next(types, &filter, sort).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                self.telemetry.record_idle();
                return Ok(true);
            }
            Err(e) => return Err(self.store_failure(e)),
        };

        let now = self.clock.now();
        if !self.gate.is_eligible(&item, now) {
            // Left leased. Lock recovery frees it after the staleness window.
            tracing::debug!(
                network = %network,
                "Item {} ({}) not yet eligible at attempt {}",
                item.id, item.item_type, item.attempt_count
            );
            self.telemetry.record_ineligible();
            return Ok(false);
        }

        let Some(handler) = self.registry.get(item.item_type).cloned() else {
            self.release(&item).await?;
            self.dispatcher.alerter().alert(
                AlertKind::UnknownQueueItemType,
                &format!("{}: no handler for {} (item {})", self.store.scope(), item.item_type, item.id),
            );
            return Err(WorkerError::UnknownType {
                item_type: item.item_type,
                id: item.id,
            });
        };

        match handler.handle(network, &item).await {
            Ok(true) => {
                if let Err(e) = self.store.delete(&item.id).await {
                    return Err(self.store_failure(e));
                }
                let done = self.clock.now();
                self.telemetry.record_completed(
                    item.item_type,
                    done.saturating_sub(item.lease_time),
                    done.saturating_sub(item.creation_time),
                );
                Ok(true)
            }
            Ok(false) => {
                self.release(&item).await?;
                tracing::warn!(
                    network = %network,
                    "Handler '{}' could not process {} item {} (attempt {})",
                    handler.name(),
                    item.item_type,
                    item.id,
                    item.attempt_count + 1
                );
                self.telemetry.record_failed();
                Ok(false)
            }
            Err(HandlerError::Processing(error)) => {
                self.release(&item).await?;
                tracing::warn!(
                    network = %network,
                    "Handler '{}' raised {} on item {}",
                    handler.name(),
                    error,
                    item.id
                );
                self.telemetry.record_processing_error();
                let outcome = match self.dispatcher.handle(self.store.as_ref(), &error).await {
                    Ok(outcome) => outcome,
                    Err(DispatchError::Store(e)) => return Err(self.store_failure(e)),
                    Err(e) => return Err(WorkerError::Recovery(e)),
                };
                tracing::debug!(network = %network, "Recovery for item {}: {:?}", item.id, outcome);
                Ok(false)
            }
            Err(HandlerError::Fatal(source)) => {
                self.release(&item).await?;
                self.telemetry.record_fatal();
                Err(WorkerError::Handler {
                    handler: handler.name(),
                    id: item.id,
                    source,
                })
            }
        }
    }

    /// Frees the lease and persists the attempt count captured at lease time,
    /// incremented.
    async fn release(&self, item: &QueueItem) -> Result<(), WorkerError> {
        self.store
            .free(&item.id, item.attempt_count.saturating_add(1))
            .await
            .map_err(|e| self.store_failure(e))
    }

    fn store_failure(&self, e: StoreError) -> WorkerError {
        if let StoreError::CapacityExceeded(message) = &e {
            self.dispatcher.alerter().alert(
                AlertKind::StoreCapacityExceeded,
                &format!("{}: {}", self.store.scope(), message),
            );
        }
        WorkerError::Store(e)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::recovery::{
        Alerter, BlockLocator, CollaboratorError, HypervisorSnapshot, RecoverySettings,
        RescrapeRequest, Rescraper, SnapshotBuilder,
    };

    /// Handler that replays scripted results, then succeeds.
    pub struct ScriptedHandler {
        pub item_type: QueueItemType,
        pub script: Mutex<VecDeque<Result<bool, HandlerError>>>,
        pub seen: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        pub fn new(item_type: QueueItemType, script: Vec<Result<bool, HandlerError>>) -> Self {
            Self {
                item_type,
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueueItemHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn item_type(&self) -> QueueItemType {
            self.item_type
        }

        async fn handle(&self, _network: &str, item: &QueueItem) -> Result<bool, HandlerError> {
            self.seen.lock().unwrap().push(item.id.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(true))
        }
    }

    pub struct NoSnapshots;

    #[async_trait]
    impl SnapshotBuilder for NoSnapshots {
        async fn build(
            &self,
            _network: &str,
            _address: &str,
            _block: u64,
        ) -> Result<HypervisorSnapshot, CollaboratorError> {
            Err(CollaboratorError::InvalidRequest("no snapshots in tests".into()))
        }

        async fn persist(
            &self,
            _network: &str,
            _snapshots: &[HypervisorSnapshot],
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingRescraper(pub Mutex<Vec<RescrapeRequest>>);

    #[async_trait]
    impl Rescraper for RecordingRescraper {
        async fn rescrape(&self, request: &RescrapeRequest) -> Result<(), CollaboratorError> {
            self.0.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    pub struct GenesisLocator;

    #[async_trait]
    impl BlockLocator for GenesisLocator {
        async fn block_at(&self, _network: &str, _timestamp: u64) -> Result<u64, CollaboratorError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    pub struct RecordingAlerter(pub Mutex<Vec<AlertKind>>);

    impl Alerter for RecordingAlerter {
        fn alert(&self, kind: AlertKind, _message: &str) {
            self.0.lock().unwrap().push(kind);
        }
    }

    pub fn dispatcher(
        clock: Arc<dyn Clock>,
        alerter: Arc<RecordingAlerter>,
    ) -> Arc<ErrorRecoveryDispatcher> {
        Arc::new(ErrorRecoveryDispatcher::new(
            Arc::new(NoSnapshots),
            Arc::new(RecordingRescraper::default()),
            Arc::new(GenesisLocator),
            alerter,
            clock,
            RecoverySettings::default(),
        ))
    }
}
