use std::sync::Arc;

use async_trait::async_trait;

use super::chain::NetworkClients;
use crate::db::{DbError, DbOperation, DbPool, DbValue};
use crate::queue::{QueueItem, QueueItemType};
use crate::rpc::RpcError;
use crate::worker::{HandlerError, QueueItemHandler};

/// Fetches the timestamp of `item.block` and stores it in `block_timestamps`.
pub struct BlockTimestampHandler {
    clients: NetworkClients,
    db: Arc<DbPool>,
}

impl BlockTimestampHandler {
    pub fn new(clients: NetworkClients, db: Arc<DbPool>) -> Self {
        Self { clients, db }
    }
}

#[async_trait]
impl QueueItemHandler for BlockTimestampHandler {
    fn name(&self) -> &'static str {
        "BlockTimestampHandler"
    }

    fn item_type(&self) -> QueueItemType {
        QueueItemType::Block
    }

    async fn handle(&self, network: &str, item: &QueueItem) -> Result<bool, HandlerError> {
        let client = self
            .clients
            .get(network)
            .map_err(|e| HandlerError::fatal(e.to_string()))?;

        let timestamp = match client.get_block_timestamp(item.block).await {
            Ok(timestamp) => timestamp,
            // Not yet visible on a lagging node.
            Err(e @ RpcError::BlockNotFound(_)) => {
                tracing::debug!(network = %network, "{}, will retry", e);
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(network = %network, "Timestamp fetch for block {} failed: {}", item.block, e);
                return Ok(false);
            }
        };

        let operation = timestamp_upsert(network, item.block, timestamp)
            .map_err(|e| HandlerError::fatal(e.to_string()))?;
        if let Err(e) = self.db.execute(operation).await {
            tracing::warn!(network = %network, "Failed to store timestamp of block {}: {}", item.block, e);
            return Ok(false);
        }

        tracing::debug!(network = %network, "Block {} at {}", item.block, timestamp);
        Ok(true)
    }
}

fn timestamp_upsert(network: &str, block: u64, timestamp: u64) -> Result<DbOperation, DbError> {
    Ok(DbOperation::Upsert {
        table: "block_timestamps".to_string(),
        columns: vec![
            "network".to_string(),
            "block".to_string(),
            "timestamp".to_string(),
        ],
        values: vec![
            DbValue::Text(network.to_string()),
            DbValue::uint("block", block)?,
            DbValue::uint("timestamp", timestamp)?,
        ],
        conflict_columns: vec!["network".to_string(), "block".to_string()],
        update_columns: vec!["timestamp".to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_upsert_is_keyed_by_network_and_block() {
        let DbOperation::Upsert { values, conflict_columns, update_columns, .. } =
            timestamp_upsert("ethereum", 19_000_000, 1_700_000_000).unwrap()
        else {
            panic!("expected an upsert");
        };
        assert_eq!(conflict_columns, vec!["network", "block"]);
        assert_eq!(update_columns, vec!["timestamp"]);
        assert!(matches!(values[1], DbValue::Int64(19_000_000)));
        assert!(matches!(values[2], DbValue::Int64(1_700_000_000)));
    }

    #[test]
    fn test_timestamp_upsert_rejects_block_past_bigint() {
        let result = timestamp_upsert("ethereum", u64::MAX, 1_700_000_000);
        assert!(matches!(result, Err(DbError::OutOfRange(_))));
    }
}
