use std::sync::Arc;

use async_trait::async_trait;

use crate::queue::{QueueItem, QueueItemType};
use crate::recovery::{CollaboratorError, SnapshotBuilder};
use crate::worker::{HandlerError, QueueItemHandler};

/// Builds the hypervisor snapshot at `item.block` and persists it.
pub struct HypervisorStatusHandler {
    snapshots: Arc<dyn SnapshotBuilder>,
}

impl HypervisorStatusHandler {
    pub fn new(snapshots: Arc<dyn SnapshotBuilder>) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl QueueItemHandler for HypervisorStatusHandler {
    fn name(&self) -> &'static str {
        "HypervisorStatusHandler"
    }

    fn item_type(&self) -> QueueItemType {
        QueueItemType::HypervisorStatus
    }

    async fn handle(&self, network: &str, item: &QueueItem) -> Result<bool, HandlerError> {
        let snapshot = match self.snapshots.build(network, &item.address, item.block).await {
            Ok(snapshot) => snapshot,
            Err(CollaboratorError::InvalidRequest(msg)) => return Err(HandlerError::fatal(msg)),
            Err(e) => {
                tracing::warn!(
                    network = %network,
                    "Snapshot of {} at block {} failed: {}",
                    item.address,
                    item.block,
                    e
                );
                return Ok(false);
            }
        };

        match self.snapshots.persist(network, &[snapshot]).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(network = %network, "Failed to persist snapshot of {}: {}", item.address, e);
                Ok(false)
            }
        }
    }
}
