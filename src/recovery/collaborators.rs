//! Seams between the recovery dispatcher and the systems that actually fix
//! things: snapshot recomputation, raw re-ingestion, block lookup, alerting.

use std::fmt;

use alloy::primitives::{I256, U256};
use async_trait::async_trait;
use thiserror::Error;

use crate::db::DbError;
use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Point-in-time state of a hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorSnapshot {
    pub address: String,
    pub block: u64,
    pub total_supply: U256,
    pub total_amounts: [U256; 2],
    /// Uncollected fees across the hypervisor's positions, per token.
    pub fees_owed: [U256; 2],
}

impl HypervisorSnapshot {
    /// Fee growth from `start` to `end`, per token. Negative when fees shrank.
    pub fn fees_delta(start: &HypervisorSnapshot, end: &HypervisorSnapshot) -> [I256; 2] {
        [
            signed(end.fees_owed[0]).saturating_sub(signed(start.fees_owed[0])),
            signed(end.fees_owed[1]).saturating_sub(signed(start.fees_owed[1])),
        ]
    }
}

fn signed(value: U256) -> I256 {
    I256::try_from(value).unwrap_or(I256::MAX)
}

#[async_trait]
pub trait SnapshotBuilder: Send + Sync {
    async fn build(
        &self,
        network: &str,
        address: &str,
        block: u64,
    ) -> Result<HypervisorSnapshot, CollaboratorError>;

    /// Replace stored snapshots with these, by `(address, block)`.
    async fn persist(
        &self,
        network: &str,
        snapshots: &[HypervisorSnapshot],
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescrapeKind {
    Operations,
    RevenueOperations,
}

impl RescrapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RescrapeKind::Operations => "operations",
            RescrapeKind::RevenueOperations => "revenue_operations",
        }
    }
}

/// A re-ingestion request. Always carries explicit block bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescrapeRequest {
    pub protocol: String,
    pub network: String,
    pub kind: RescrapeKind,
    /// Empty means every tracked address.
    pub addresses: Vec<String>,
    pub block_ini: u64,
    pub block_end: u64,
    pub step: u64,
    pub reason: String,
}

impl RescrapeRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn bounded(
        protocol: &str,
        network: &str,
        kind: RescrapeKind,
        addresses: Vec<String>,
        block_ini: u64,
        block_end: u64,
        step: u64,
        reason: impl Into<String>,
    ) -> Result<Self, CollaboratorError> {
        if block_ini > block_end {
            return Err(CollaboratorError::InvalidRequest(format!(
                "rescrape range {}..{} is inverted",
                block_ini, block_end
            )));
        }
        if step == 0 {
            return Err(CollaboratorError::InvalidRequest(
                "rescrape step must be positive".to_string(),
            ));
        }
        Ok(Self {
            protocol: protocol.to_string(),
            network: network.to_string(),
            kind,
            addresses,
            block_ini,
            block_end,
            step,
            reason: reason.into(),
        })
    }
}

#[async_trait]
pub trait Rescraper: Send + Sync {
    async fn rescrape(&self, request: &RescrapeRequest) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait BlockLocator: Send + Sync {
    /// Last block mined at or before `timestamp`.
    async fn block_at(&self, network: &str, timestamp: u64) -> Result<u64, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    WrongContractFieldType,
    StoreCapacityExceeded,
    UnknownQueueItemType,
    PoisonItems,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertKind::WrongContractFieldType => "wrong-contract-field-type",
            AlertKind::StoreCapacityExceeded => "store-capacity-exceeded",
            AlertKind::UnknownQueueItemType => "unknown-queue-item-type",
            AlertKind::PoisonItems => "poison-items",
        })
    }
}

pub trait Alerter: Send + Sync {
    fn alert(&self, kind: AlertKind, message: &str);
}

/// Emits alerts as `error` events on the `alerts` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn alert(&self, kind: AlertKind, message: &str) {
        tracing::error!(target: "alerts", kind = %kind, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(fees: [u64; 2]) -> HypervisorSnapshot {
        HypervisorSnapshot {
            address: "0x01".to_string(),
            block: 1,
            total_supply: U256::ZERO,
            total_amounts: [U256::ZERO; 2],
            fees_owed: [U256::from(fees[0]), U256::from(fees[1])],
        }
    }

    #[test]
    fn test_fees_delta_can_be_negative() {
        let delta = HypervisorSnapshot::fees_delta(&snapshot([10, 5]), &snapshot([4, 9]));
        assert_eq!(delta, [I256::try_from(-6i64).unwrap(), I256::try_from(4i64).unwrap()]);
    }

    #[test]
    fn test_bounded_rejects_inverted_range() {
        let err = RescrapeRequest::bounded(
            "gamma",
            "ethereum",
            RescrapeKind::Operations,
            vec![],
            200,
            100,
            1000,
            "test",
        );
        assert!(matches!(err, Err(CollaboratorError::InvalidRequest(_))));

        let ok = RescrapeRequest::bounded(
            "gamma",
            "ethereum",
            RescrapeKind::Operations,
            vec![],
            100,
            100,
            1000,
            "test",
        )
        .unwrap();
        assert_eq!((ok.block_ini, ok.block_end), (100, 100));
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(RescrapeRequest::bounded(
            "gamma",
            "ethereum",
            RescrapeKind::Operations,
            vec![],
            1,
            2,
            0,
            "test"
        )
        .is_err());
    }
}
