//! Central remediation for classified processing failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use super::collaborators::{
    AlertKind, Alerter, BlockLocator, CollaboratorError, HypervisorSnapshot, RescrapeKind,
    RescrapeRequest, Rescraper, SnapshotBuilder,
};
use super::error::{ErrorAction, ErrorKind, ProcessingError};
use crate::queue::{Clock, QueueItemDraft, QueueItemType, QueueStore, StoreError};

pub const DEFAULT_RESCRAPE_BLOCK_STEP: u64 = 1000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{kind} error is missing '{field}'")]
    MissingContext { kind: ErrorKind, field: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub rescrape_block_step: u64,
    /// Lowercased legacy hypervisor addresses, per network.
    pub legacy_hypervisors: HashMap<String, HashSet<String>>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            rescrape_block_step: DEFAULT_RESCRAPE_BLOCK_STEP,
            legacy_hypervisors: HashMap::new(),
        }
    }
}

impl RecoverySettings {
    pub fn is_legacy(&self, network: &str, address: &str) -> bool {
        self.legacy_hypervisors
            .get(network)
            .is_some_and(|set| set.contains(&address.to_lowercase()))
    }
}

/// What the dispatcher did about an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    PriceRequeued { id: String },
    SnapshotsCorrected,
    Rescraped(RescrapeRequest),
    SkippedLegacy,
    Alerted,
    Ignored,
    Unrecognized,
}

pub struct ErrorRecoveryDispatcher {
    snapshots: Arc<dyn SnapshotBuilder>,
    rescraper: Arc<dyn Rescraper>,
    locator: Arc<dyn BlockLocator>,
    alerter: Arc<dyn Alerter>,
    clock: Arc<dyn Clock>,
    settings: RecoverySettings,
}

impl ErrorRecoveryDispatcher {
    pub fn new(
        snapshots: Arc<dyn SnapshotBuilder>,
        rescraper: Arc<dyn Rescraper>,
        locator: Arc<dyn BlockLocator>,
        alerter: Arc<dyn Alerter>,
        clock: Arc<dyn Clock>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            snapshots,
            rescraper,
            locator,
            alerter,
            clock,
            settings,
        }
    }

    pub fn alerter(&self) -> &Arc<dyn Alerter> {
        &self.alerter
    }

    /// Applies the corrective action for `error` within the store's scope.
    pub async fn handle(
        &self,
        store: &dyn QueueStore,
        error: &ProcessingError,
    ) -> Result<RecoveryOutcome, DispatchError> {
        let scope = store.scope();
        let network = scope.network.as_str();

        match (&error.kind, &error.action) {
            (ErrorKind::PriceNotFound, ErrorAction::ScrapePrice) => {
                self.requeue_price(store, error).await
            }
            (ErrorKind::SupplyDifference, ErrorAction::Rescrape) => {
                let (address, ini, end) = subject_range(error)?;
                let (start, finish) = self.recompute(network, address, ini, end).await?;
                if start.total_supply == finish.total_supply {
                    tracing::info!(
                        network = %network,
                        "Supply of {} matches between blocks {} and {}, snapshots corrected",
                        address, ini, end
                    );
                    return Ok(RecoveryOutcome::SnapshotsCorrected);
                }
                self.rescrape(store, RescrapeKind::Operations, Some(address), ini, end, error)
                    .await
            }
            (ErrorKind::NegativeFees, ErrorAction::Rescrape) => {
                let (address, ini, end) = subject_range(error)?;
                if self.settings.is_legacy(network, address) {
                    tracing::debug!(network = %network, "Skipping legacy hypervisor {}", address);
                    return Ok(RecoveryOutcome::SkippedLegacy);
                }
                let recorded = error.context.recorded_fees_delta.ok_or(
                    DispatchError::MissingContext {
                        kind: error.kind.clone(),
                        field: "recorded_fees_delta",
                    },
                )?;
                let (start, finish) = self.recompute(network, address, ini, end).await?;
                let recomputed = HypervisorSnapshot::fees_delta(&start, &finish);
                if recomputed != recorded {
                    tracing::info!(
                        network = %network,
                        "Fee delta of {} between blocks {} and {} corrected",
                        address, ini, end
                    );
                    return Ok(RecoveryOutcome::SnapshotsCorrected);
                }
                self.rescrape(store, RescrapeKind::Operations, Some(address), ini, end, error)
                    .await
            }
            (ErrorKind::NoHypervisorPeriodEnd, ErrorAction::Rescrape) => {
                let (ini, end) = block_range(error)?;
                let address = error.context.address.as_deref();
                self.rescrape(store, RescrapeKind::Operations, address, ini, end, error)
                    .await
            }
            (ErrorKind::FeesWithoutRevenue, ErrorAction::Rescrape) => {
                let (ini, end) = match (error.context.ini_timestamp, error.context.end_timestamp) {
                    (Some(ini_ts), Some(end_ts)) => (
                        self.locator.block_at(network, ini_ts).await?,
                        self.locator.block_at(network, end_ts).await?,
                    ),
                    _ => block_range(error)?,
                };
                let address = error.context.address.as_deref();
                self.rescrape(store, RescrapeKind::RevenueOperations, address, ini, end, error)
                    .await
            }
            (ErrorKind::WrongContractFieldType, _) => {
                self.alerter.alert(
                    AlertKind::WrongContractFieldType,
                    &format!("{}: {}", scope, error.message),
                );
                Ok(RecoveryOutcome::Alerted)
            }
            (
                ErrorKind::OverlappedPeriods
                | ErrorKind::InvalidRewardDefinition
                | ErrorKind::ReturnNone,
                _,
            ) => {
                tracing::info!(network = %network, "No corrective action for {}", error);
                Ok(RecoveryOutcome::Ignored)
            }
            (ErrorKind::Unrecognized(tag), _) => {
                tracing::warn!(network = %network, "Unrecognized processing error kind '{}': {}", tag, error.message);
                Ok(RecoveryOutcome::Unrecognized)
            }
            (kind, action) => {
                tracing::warn!(
                    network = %network,
                    "No handling for {} with action {}: {}",
                    kind, action, error.message
                );
                Ok(RecoveryOutcome::Ignored)
            }
        }
    }

    /// Queues a price lookup, or gives an existing one a fresh start.
    async fn requeue_price(
        &self,
        store: &dyn QueueStore,
        error: &ProcessingError,
    ) -> Result<RecoveryOutcome, DispatchError> {
        let address = required(error, error.context.address.as_deref(), "address")?;
        let block = required(error, error.context.block, "block")?;

        let payload = match &error.context.details {
            JsonValue::Object(_) => error.context.details.clone(),
            _ => json!({}),
        };
        let draft = QueueItemDraft::new(QueueItemType::Price, block, address, payload);
        let id = draft.identity().map_err(StoreError::from)?;
        let existing = store.get(&id).await?;

        let mut item = draft
            .into_item(existing.as_ref(), self.clock.now())
            .map_err(StoreError::from)?;
        item.attempt_count = 0;
        if let Some(prev) = &existing {
            item.lease_time = prev.lease_time;
        }
        store.upsert_many(std::slice::from_ref(&item)).await?;

        tracing::debug!(
            network = %store.scope().network,
            "Price lookup for {} at block {} queued as {}",
            address, block, item.id
        );
        Ok(RecoveryOutcome::PriceRequeued { id: item.id })
    }

    /// Rebuilds and persists both ends of the suspect interval.
    async fn recompute(
        &self,
        network: &str,
        address: &str,
        ini: u64,
        end: u64,
    ) -> Result<(HypervisorSnapshot, HypervisorSnapshot), DispatchError> {
        let start = self.snapshots.build(network, address, ini).await?;
        let finish = self.snapshots.build(network, address, end).await?;
        self.snapshots
            .persist(network, &[start.clone(), finish.clone()])
            .await?;
        Ok((start, finish))
    }

    async fn rescrape(
        &self,
        store: &dyn QueueStore,
        kind: RescrapeKind,
        address: Option<&str>,
        ini: u64,
        end: u64,
        error: &ProcessingError,
    ) -> Result<RecoveryOutcome, DispatchError> {
        let scope = store.scope();
        let request = RescrapeRequest::bounded(
            &scope.protocol,
            &scope.network,
            kind,
            address.map(|a| vec![a.to_lowercase()]).unwrap_or_default(),
            ini,
            end,
            self.settings.rescrape_block_step,
            error.kind.as_str(),
        )?;
        tracing::warn!(
            network = %scope.network,
            "Re-scraping {} over blocks {}..={} after {}",
            kind.as_str(), ini, end, error.kind
        );
        self.rescraper.rescrape(&request).await?;
        Ok(RecoveryOutcome::Rescraped(request))
    }
}

fn required<T>(error: &ProcessingError, value: Option<T>, field: &'static str) -> Result<T, DispatchError> {
    value.ok_or(DispatchError::MissingContext {
        kind: error.kind.clone(),
        field,
    })
}

fn block_range(error: &ProcessingError) -> Result<(u64, u64), DispatchError> {
    Ok((
        required(error, error.context.ini_block, "ini_block")?,
        required(error, error.context.end_block, "end_block")?,
    ))
}

fn subject_range(error: &ProcessingError) -> Result<(&str, u64, u64), DispatchError> {
    let address = required(error, error.context.address.as_deref(), "address")?;
    let (ini, end) = block_range(error)?;
    Ok((address, ini, end))
}
