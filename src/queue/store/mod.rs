//! Queue persistence contract.
//!
//! A store is bound to one `(protocol, network)` scope and is the single
//! arbiter of who owns an item: `lease_next` selects and stamps a document in
//! one atomic step, so two workers never hold the same identity.

pub mod memory;
pub mod postgres;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::item::{QueueItem, QueueItemDraft, QueueItemError, QueueItemType};
use crate::db::DbError;

pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;

/// Items at or above this many attempts are skipped by the default filter.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Largest serialized payload accepted by a store.
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueScope {
    pub protocol: String,
    pub network: String,
}

impl QueueScope {
    pub fn new(protocol: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            network: network.into(),
        }
    }
}

impl fmt::Display for QueueScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.network)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    #[error("Queue store capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid queue document {id}: {message}")]
    InvalidDocument { id: String, message: String },

    #[error(transparent)]
    Item(#[from] QueueItemError),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        if e.is_capacity_exceeded() {
            StoreError::CapacityExceeded(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }
}

/// Which documents `lease_next` may pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFilter {
    /// Only documents with no active lease.
    pub unleased_only: bool,
    /// `attempt_count < max_attempts`.
    pub max_attempts: Option<u32>,
    /// `attempt_count <= attempt_ceiling`. Set by the eligibility gate and
    /// applied on top of whatever else the caller asked for.
    pub attempt_ceiling: Option<u32>,
    /// Inclusive block bounds.
    pub block_range: Option<(u64, u64)>,
    pub address: Option<String>,
}

impl Default for LeaseFilter {
    fn default() -> Self {
        Self {
            unleased_only: true,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            attempt_ceiling: None,
            block_range: None,
            address: None,
        }
    }
}

impl LeaseFilter {
    /// Filter with no attempt bound, for callers that do their own gating.
    pub fn any_attempts() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    pub fn with_attempt_ceiling(mut self, ceiling: u32) -> Self {
        self.attempt_ceiling = Some(match self.attempt_ceiling {
            Some(current) => current.min(ceiling),
            None => ceiling,
        });
        self
    }

    pub fn with_block_range(mut self, start: u64, end: u64) -> Self {
        self.block_range = Some((start, end));
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_lowercase());
        self
    }

    pub fn matches(&self, item: &QueueItem) -> bool {
        if self.unleased_only && item.is_leased() {
            return false;
        }
        if let Some(max) = self.max_attempts {
            if item.attempt_count >= max {
                return false;
            }
        }
        if let Some(ceiling) = self.attempt_ceiling {
            if item.attempt_count > ceiling {
                return false;
            }
        }
        if let Some((start, end)) = self.block_range {
            if item.block < start || item.block > end {
                return false;
            }
        }
        if let Some(address) = &self.address {
            if &item.address != address {
                return false;
            }
        }
        true
    }
}

/// Order in which `lease_next` considers matching documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseSort {
    /// Fewest attempts first, then oldest.
    #[default]
    AttemptsThenAge,
    /// Oldest first.
    Age,
    /// Lowest block first, then oldest.
    BlockAscending,
}

impl LeaseSort {
    pub fn compare(&self, a: &QueueItem, b: &QueueItem) -> Ordering {
        let by_key = match self {
            LeaseSort::AttemptsThenAge => a
                .attempt_count
                .cmp(&b.attempt_count)
                .then(a.creation_time.cmp(&b.creation_time)),
            LeaseSort::Age => a.creation_time.cmp(&b.creation_time),
            LeaseSort::BlockAscending => a
                .block
                .cmp(&b.block)
                .then(a.creation_time.cmp(&b.creation_time)),
        };
        by_key.then_with(|| a.id.cmp(&b.id))
    }

    pub(crate) fn order_by_sql(&self) -> &'static str {
        match self {
            LeaseSort::AttemptsThenAge => "count ASC, creation ASC, id ASC",
            LeaseSort::Age => "creation ASC, id ASC",
            LeaseSort::BlockAscending => "block ASC, creation ASC, id ASC",
        }
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    fn scope(&self) -> &QueueScope;

    /// Replace-by-identity, batched.
    async fn upsert_many(&self, items: &[QueueItem]) -> Result<(), StoreError>;

    /// Inserts new identities as given and merges the rest in one atomic
    /// step: an existing document keeps its creation time, loses its lease,
    /// takes the incoming payload, and has its attempt count raised by the
    /// incoming count plus one. Identities must be unique within `items`.
    /// Returns the stored documents.
    async fn submit_many(&self, items: &[QueueItem]) -> Result<Vec<QueueItem>, StoreError>;

    /// Atomically select one matching document of the given types and stamp
    /// its lease time.
    async fn lease_next(
        &self,
        types: &[QueueItemType],
        filter: &LeaseFilter,
        sort: LeaseSort,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Clear the lease and persist `attempt_count`.
    async fn free(&self, id: &str, attempt_count: u32) -> Result<(), StoreError>;

    /// Clear the lease of every listed document whose lease was taken at or
    /// before `cutoff`. A document re-leased since it was listed keeps its
    /// lease. Returns how many were freed.
    async fn free_stale(&self, ids: &[String], cutoff: u64) -> Result<u64, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError>;

    /// All documents currently holding a lease.
    async fn leased(&self) -> Result<Vec<QueueItem>, StoreError>;

    /// Documents whose attempt count exceeds `ceiling`.
    async fn poisoned(&self, ceiling: u32) -> Result<Vec<QueueItem>, StoreError>;
}

/// Queues drafts in one batch.
///
/// Drafts that share an identity within the same batch are applied in order,
/// each counting as a re-submission of the previous one. Merging with what is
/// already queued happens inside the store, so concurrent submitters never
/// lose each other's attempt counts.
pub async fn submit(
    store: &dyn QueueStore,
    drafts: Vec<QueueItemDraft>,
    now: u64,
) -> Result<Vec<QueueItem>, StoreError> {
    let mut resolved: HashMap<String, QueueItem> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for draft in drafts {
        let id = draft.identity()?;
        let item = draft.into_item(resolved.get(&id), now)?;
        if !resolved.contains_key(&id) {
            order.push(id.clone());
        }
        resolved.insert(id, item);
    }

    let items: Vec<QueueItem> = order
        .iter()
        .filter_map(|id| resolved.remove(id))
        .collect();

    let mut stored: HashMap<String, QueueItem> = store
        .submit_many(&items)
        .await?
        .into_iter()
        .map(|item| (item.id.clone(), item))
        .collect();
    Ok(order.iter().filter_map(|id| stored.remove(id)).collect())
}

/// Rejects payloads a store could not hold.
pub(crate) fn check_document_size(item: &QueueItem) -> Result<(), StoreError> {
    let size = serde_json::to_vec(&item.payload)
        .map(|bytes| bytes.len())
        .map_err(|e| StoreError::InvalidDocument {
            id: item.id.clone(),
            message: e.to_string(),
        })?;

    if size > MAX_DOCUMENT_BYTES {
        return Err(StoreError::CapacityExceeded(format!(
            "document {} payload is {} bytes (limit {})",
            item.id, size, MAX_DOCUMENT_BYTES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(count: u32, creation: u64, block: u64) -> QueueItem {
        let mut item = QueueItem::new(
            QueueItemType::Block,
            block,
            "0x0000000000000000000000000000000000000001",
            json!({}),
            None,
            creation,
        )
        .unwrap();
        item.attempt_count = count;
        item
    }

    #[test]
    fn test_default_filter() {
        let filter = LeaseFilter::default();
        assert!(filter.matches(&item(4, 1, 1)));
        assert!(!filter.matches(&item(5, 1, 1)));

        let mut leased = item(0, 1, 1);
        leased.lease_time = 10;
        assert!(!filter.matches(&leased));
    }

    #[test]
    fn test_attempt_ceiling_applies_on_top_of_filter() {
        let filter = LeaseFilter::any_attempts().with_attempt_ceiling(20);
        assert!(filter.matches(&item(20, 1, 1)));
        assert!(!filter.matches(&item(21, 1, 1)));

        let tighter = filter.with_attempt_ceiling(30);
        assert_eq!(tighter.attempt_ceiling, Some(20));
    }

    #[test]
    fn test_block_range_and_address() {
        let filter = LeaseFilter::default()
            .with_block_range(10, 20)
            .with_address("0x0000000000000000000000000000000000000001");
        assert!(filter.matches(&item(0, 1, 10)));
        assert!(filter.matches(&item(0, 1, 20)));
        assert!(!filter.matches(&item(0, 1, 21)));
    }

    #[test]
    fn test_default_sort_prefers_fewer_attempts_then_age() {
        let sort = LeaseSort::default();
        let fresh_new = item(0, 200, 1);
        let fresh_old = item(0, 100, 2);
        let retried_old = item(3, 50, 3);

        let mut items = vec![retried_old.clone(), fresh_new.clone(), fresh_old.clone()];
        items.sort_by(|a, b| sort.compare(a, b));
        assert_eq!(items, vec![fresh_old, fresh_new, retried_old]);
    }

    #[test]
    fn test_age_and_block_sorts() {
        let retried_old = item(3, 50, 9);
        let fresh_new = item(0, 200, 1);

        let mut items = vec![fresh_new.clone(), retried_old.clone()];
        items.sort_by(|a, b| LeaseSort::Age.compare(a, b));
        assert_eq!(items[0], retried_old);

        items.sort_by(|a, b| LeaseSort::BlockAscending.compare(a, b));
        assert_eq!(items[0], fresh_new);

        let sort: LeaseSort = serde_json::from_str("\"block-ascending\"").unwrap();
        assert_eq!(sort, LeaseSort::BlockAscending);
    }

    #[test]
    fn test_oversized_payload_is_capacity_error() {
        let mut big = item(0, 1, 1);
        big.payload = json!({ "blob": "x".repeat(MAX_DOCUMENT_BYTES) });
        assert!(matches!(
            check_document_size(&big),
            Err(StoreError::CapacityExceeded(_))
        ));
        assert!(check_document_size(&item(0, 1, 1)).is_ok());
    }
}
