//! In-process queue store. Leasing happens under a single mutex, which gives
//! the same find-and-mark atomicity the Postgres store gets from row locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{check_document_size, LeaseFilter, LeaseSort, QueueScope, QueueStore, StoreError};
use crate::queue::clock::Clock;
use crate::queue::item::{QueueItem, QueueItemType};

pub struct MemoryQueueStore {
    scope: QueueScope,
    clock: Arc<dyn Clock>,
    items: Mutex<HashMap<String, QueueItem>>,
}

impl MemoryQueueStore {
    pub fn new(scope: QueueScope, clock: Arc<dyn Clock>) -> Self {
        Self {
            scope,
            clock,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueItem>>, StoreError> {
        self.items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn scope(&self) -> &QueueScope {
        &self.scope
    }

    async fn upsert_many(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        for item in items {
            check_document_size(item)?;
        }
        let mut map = self.lock()?;
        for item in items {
            map.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn submit_many(&self, items: &[QueueItem]) -> Result<Vec<QueueItem>, StoreError> {
        for item in items {
            check_document_size(item)?;
        }
        let mut map = self.lock()?;
        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            let merged = match map.get(&item.id) {
                Some(existing) => QueueItem {
                    lease_time: 0,
                    creation_time: existing.creation_time,
                    attempt_count: existing
                        .attempt_count
                        .saturating_add(item.attempt_count)
                        .saturating_add(1),
                    ..item.clone()
                },
                None => item.clone(),
            };
            map.insert(merged.id.clone(), merged.clone());
            stored.push(merged);
        }
        Ok(stored)
    }

    async fn lease_next(
        &self,
        types: &[QueueItemType],
        filter: &LeaseFilter,
        sort: LeaseSort,
    ) -> Result<Option<QueueItem>, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        let chosen = map
            .values()
            .filter(|item| types.contains(&item.item_type) && filter.matches(item))
            .min_by(|a, b| sort.compare(a, b))
            .map(|item| item.id.clone());

        Ok(chosen.and_then(|id| {
            map.get_mut(&id).map(|item| {
                item.lease_time = now;
                item.clone()
            })
        }))
    }

    async fn free(&self, id: &str, attempt_count: u32) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        if let Some(item) = map.get_mut(id) {
            item.lease_time = 0;
            item.attempt_count = attempt_count;
        }
        Ok(())
    }

    async fn free_stale(&self, ids: &[String], cutoff: u64) -> Result<u64, StoreError> {
        let mut map = self.lock()?;
        let mut freed = 0;
        for id in ids {
            if let Some(item) = map.get_mut(id) {
                if item.is_leased() && item.lease_time <= cutoff {
                    item.lease_time = 0;
                    freed += 1;
                }
            }
        }
        Ok(freed)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.lock()?.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn leased(&self) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .lock()?
            .values()
            .filter(|item| item.is_leased())
            .cloned()
            .collect())
    }

    async fn poisoned(&self, ceiling: u32) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .lock()?
            .values()
            .filter(|item| item.attempt_count > ceiling)
            .cloned()
            .collect())
    }
}
