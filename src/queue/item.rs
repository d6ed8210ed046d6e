//! Queue items and their deduplication identity.
//!
//! Every unit of work is keyed by an identity derived from its type, block,
//! address and, for some types, a few payload fields. Re-submitting the same
//! logical work collapses onto the same document: creation time is carried
//! over and the attempt counter is bumped.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{hex, keccak256};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
    /// Ingest a raw hypervisor operation (deposit, withdraw, rebalance, ...).
    Operation,
    /// Fetch and store a block timestamp.
    Block,
    HypervisorStatus,
    Price,
    RewardStatus,
    RewardStatic,
    HypervisorStatic,
    RevenueOperation,
    UserOperation,
    LatestRewardSnapshot,
}

impl QueueItemType {
    pub const ALL: [QueueItemType; 10] = [
        QueueItemType::Operation,
        QueueItemType::Block,
        QueueItemType::HypervisorStatus,
        QueueItemType::Price,
        QueueItemType::RewardStatus,
        QueueItemType::RewardStatic,
        QueueItemType::HypervisorStatic,
        QueueItemType::RevenueOperation,
        QueueItemType::UserOperation,
        QueueItemType::LatestRewardSnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemType::Operation => "operation",
            QueueItemType::Block => "block",
            QueueItemType::HypervisorStatus => "hypervisor_status",
            QueueItemType::Price => "price",
            QueueItemType::RewardStatus => "reward_status",
            QueueItemType::RewardStatic => "reward_static",
            QueueItemType::HypervisorStatic => "hypervisor_static",
            QueueItemType::RevenueOperation => "revenue_operation",
            QueueItemType::UserOperation => "user_operation",
            QueueItemType::LatestRewardSnapshot => "latest_reward_snapshot",
        }
    }
}

impl fmt::Display for QueueItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemType {
    type Err = QueueItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueItemType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| QueueItemError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueItemError {
    #[error("Invalid block value: {0}")]
    InvalidBlock(String),

    #[error("Missing payload field '{field}' required for {item_type} identity")]
    MissingField {
        item_type: QueueItemType,
        field: &'static str,
    },

    #[error("Unknown queue item type: {0}")]
    UnknownType(String),
}

/// A unit of work as persisted in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub item_type: QueueItemType,
    pub block: u64,
    /// Lowercased on-chain address the work concerns.
    pub address: String,
    /// Unix time the item was leased, 0 when free.
    pub lease_time: u64,
    pub payload: JsonValue,
    pub id: String,
    /// Set once, at first creation.
    pub creation_time: u64,
    pub attempt_count: u32,
}

impl QueueItem {
    /// Builds the document for a unit of work, carrying creation time and
    /// attempt count over from `existing` when a document with the same
    /// identity is already queued.
    pub fn new(
        item_type: QueueItemType,
        block: u64,
        address: &str,
        payload: JsonValue,
        existing: Option<&QueueItem>,
        now: u64,
    ) -> Result<Self, QueueItemError> {
        QueueItemDraft::new(item_type, block, address, payload).into_item(existing, now)
    }

    pub fn is_leased(&self) -> bool {
        self.lease_time > 0
    }
}

/// Work a handler wants queued, before identity and bookkeeping are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItemDraft {
    pub item_type: QueueItemType,
    pub block: u64,
    pub address: String,
    pub payload: JsonValue,
}

impl QueueItemDraft {
    pub fn new(item_type: QueueItemType, block: u64, address: &str, payload: JsonValue) -> Self {
        Self {
            item_type,
            block,
            address: address.to_lowercase(),
            payload,
        }
    }

    pub fn identity(&self) -> Result<String, QueueItemError> {
        item_identity(self.item_type, self.block, &self.address, &self.payload)
    }

    pub fn into_item(self, existing: Option<&QueueItem>, now: u64) -> Result<QueueItem, QueueItemError> {
        let id = self.identity()?;
        let (creation_time, attempt_count) = match existing {
            Some(prev) => (prev.creation_time, prev.attempt_count.saturating_add(1)),
            None => (now, 0),
        };

        Ok(QueueItem {
            item_type: self.item_type,
            block: self.block,
            address: self.address,
            lease_time: 0,
            payload: self.payload,
            id,
            creation_time,
            attempt_count,
        })
    }
}

/// Coerces a raw block value (JSON number, decimal string or `0x` hex
/// string) to an integer.
pub fn coerce_block(value: &JsonValue) -> Result<u64, QueueItemError> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| QueueItemError::InvalidBlock(n.to_string())),
        JsonValue::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
                None => s.parse::<u64>(),
            };
            parsed.map_err(|_| QueueItemError::InvalidBlock(s.to_string()))
        }
        other => Err(QueueItemError::InvalidBlock(other.to_string())),
    }
}

/// Deterministic identity of a unit of work.
pub fn item_identity(
    item_type: QueueItemType,
    block: u64,
    address: &str,
    payload: &JsonValue,
) -> Result<String, QueueItemError> {
    let block = block.to_string();
    let address = address.to_lowercase();

    match item_type {
        QueueItemType::RewardStatus => {
            let reward = payload.get("reward_static").ok_or(QueueItemError::MissingField {
                item_type,
                field: "reward_static",
            })?;
            let hypervisor = payload_str(reward, item_type, "hypervisor_address")?;
            let rewarder = payload_str(reward, item_type, "rewarder_address")?;
            let token = payload_str(reward, item_type, "rewardToken")?;
            Ok(hash_parts(&[
                item_type.as_str(),
                &block,
                &hypervisor,
                &rewarder,
                &token,
            ]))
        }
        QueueItemType::Operation | QueueItemType::LatestRewardSnapshot => {
            let log = payload.get("log").ok_or(QueueItemError::MissingField {
                item_type,
                field: "log",
            })?;
            let log_index = log
                .get("logIndex")
                .and_then(scalar_string)
                .ok_or(QueueItemError::MissingField {
                    item_type,
                    field: "logIndex",
                })?;
            let tx_hash = payload_str(log, item_type, "transactionHash")?;
            Ok(format!(
                "{}_{}",
                hash_parts(&[item_type.as_str(), &block, &address]),
                hash_parts(&[&log_index, &tx_hash])
            ))
        }
        _ => Ok(hash_parts(&[item_type.as_str(), &block, &address])),
    }
}

fn payload_str(
    value: &JsonValue,
    item_type: QueueItemType,
    field: &'static str,
) -> Result<String, QueueItemError> {
    value
        .get(field)
        .and_then(scalar_string)
        .ok_or(QueueItemError::MissingField { item_type, field })
}

fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.to_lowercase()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn hash_parts(parts: &[&str]) -> String {
    hex::encode_prefixed(keccak256(parts.join("|").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HYPERVISOR: &str = "0xAbC0000000000000000000000000000000000001";

    fn reward_payload() -> JsonValue {
        json!({
            "reward_static": {
                "hypervisor_address": HYPERVISOR,
                "rewarder_address": "0x00000000000000000000000000000000000000aa",
                "rewardToken": "0x00000000000000000000000000000000000000bb",
            }
        })
    }

    fn operation_payload(log_index: u64, tx: &str) -> JsonValue {
        json!({ "log": { "logIndex": log_index, "transactionHash": tx }, "topic": "deposit" })
    }

    #[test]
    fn test_identity_is_deterministic() {
        let a = QueueItem::new(QueueItemType::Price, 100, HYPERVISOR, json!({}), None, 1).unwrap();
        let b = QueueItem::new(QueueItemType::Price, 100, HYPERVISOR, json!({}), None, 2).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("0x"));
    }

    #[test]
    fn test_identity_changes_with_participating_fields() {
        let base = item_identity(QueueItemType::Price, 100, HYPERVISOR, &json!({})).unwrap();
        let other_block = item_identity(QueueItemType::Price, 101, HYPERVISOR, &json!({})).unwrap();
        let other_type = item_identity(QueueItemType::Block, 100, HYPERVISOR, &json!({})).unwrap();
        let other_address =
            item_identity(QueueItemType::Price, 100, "0x0000000000000000000000000000000000000002", &json!({}))
                .unwrap();
        assert_ne!(base, other_block);
        assert_ne!(base, other_type);
        assert_ne!(base, other_address);
    }

    #[test]
    fn test_identity_ignores_address_case_and_extra_payload() {
        let lower = item_identity(
            QueueItemType::HypervisorStatus,
            7,
            &HYPERVISOR.to_lowercase(),
            &json!({}),
        )
        .unwrap();
        let upper =
            item_identity(QueueItemType::HypervisorStatus, 7, HYPERVISOR, &json!({ "note": "x" })).unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_reward_status_identity_uses_reward_fields() {
        let payload = reward_payload();
        let id = item_identity(QueueItemType::RewardStatus, 5, HYPERVISOR, &payload).unwrap();

        let mut other = payload.clone();
        other["reward_static"]["rewardToken"] = json!("0x00000000000000000000000000000000000000cc");
        let other_id = item_identity(QueueItemType::RewardStatus, 5, HYPERVISOR, &other).unwrap();
        assert_ne!(id, other_id);

        let mut extra = payload.clone();
        extra["reward_static"]["apr"] = json!(12.5);
        let extra_id = item_identity(QueueItemType::RewardStatus, 5, HYPERVISOR, &extra).unwrap();
        assert_eq!(id, extra_id);
    }

    #[test]
    fn test_reward_status_without_reward_static_is_an_error() {
        let err = item_identity(QueueItemType::RewardStatus, 5, HYPERVISOR, &json!({})).unwrap_err();
        assert_eq!(
            err,
            QueueItemError::MissingField {
                item_type: QueueItemType::RewardStatus,
                field: "reward_static"
            }
        );

        let partial = json!({ "reward_static": { "hypervisor_address": HYPERVISOR } });
        assert!(matches!(
            item_identity(QueueItemType::RewardStatus, 5, HYPERVISOR, &partial),
            Err(QueueItemError::MissingField { field: "rewarder_address", .. })
        ));
    }

    #[test]
    fn test_operation_identity_distinguishes_logs_in_same_block() {
        let first = item_identity(QueueItemType::Operation, 9, HYPERVISOR, &operation_payload(1, "0xaa")).unwrap();
        let second = item_identity(QueueItemType::Operation, 9, HYPERVISOR, &operation_payload(2, "0xaa")).unwrap();
        assert_ne!(first, second);

        let default_key = item_identity(QueueItemType::Block, 9, HYPERVISOR, &json!({})).unwrap();
        assert_ne!(first, default_key);
        let prefix = hash_parts(&["operation", "9", &HYPERVISOR.to_lowercase()]);
        assert!(first.starts_with(&format!("{}_", prefix)));
    }

    #[test]
    fn test_resubmission_carries_creation_and_increments_count() {
        let first = QueueItem::new(QueueItemType::Block, 10, HYPERVISOR, json!({}), None, 1_000).unwrap();
        assert_eq!(first.attempt_count, 0);
        assert_eq!(first.creation_time, 1_000);

        let mut current = first.clone();
        for n in 1..=3u32 {
            current =
                QueueItem::new(QueueItemType::Block, 10, HYPERVISOR, json!({}), Some(&current), 5_000).unwrap();
            assert_eq!(current.attempt_count, n);
            assert_eq!(current.creation_time, 1_000);
            assert_eq!(current.lease_time, 0);
        }
    }

    #[test]
    fn test_coerce_block() {
        assert_eq!(coerce_block(&json!(12)).unwrap(), 12);
        assert_eq!(coerce_block(&json!("12")).unwrap(), 12);
        assert_eq!(coerce_block(&json!("0x1f")).unwrap(), 31);
        assert!(matches!(coerce_block(&json!("latest")), Err(QueueItemError::InvalidBlock(_))));
        assert!(matches!(coerce_block(&json!(-4)), Err(QueueItemError::InvalidBlock(_))));
        assert!(matches!(coerce_block(&json!(null)), Err(QueueItemError::InvalidBlock(_))));
    }

    #[test]
    fn test_type_round_trips_through_str() {
        for t in QueueItemType::ALL {
            assert_eq!(t.as_str().parse::<QueueItemType>().unwrap(), t);
        }
        assert!("bogus".parse::<QueueItemType>().is_err());
    }
}
