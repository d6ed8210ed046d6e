//! Per-type queue item handlers and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::{QueueItem, QueueItemType};
use crate::recovery::ProcessingError;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Classified failure routed to the recovery dispatcher.
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// Anything else. Not retried.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(anyhow::anyhow!(message.into()))
    }
}

/// Processes one queue item type.
///
/// `handle` returns `true` only once the item's durable side effects are
/// committed. It may be called more than once for the same item, so side
/// effects must be upserts by identity.
#[async_trait]
pub trait QueueItemHandler: Send + Sync + 'static {
    /// Unique name for this handler (used in logging).
    fn name(&self) -> &'static str;

    fn item_type(&self) -> QueueItemType;

    async fn handle(&self, network: &str, item: &QueueItem) -> Result<bool, HandlerError>;
}

/// Registry of handlers keyed by item type, built at startup.
pub struct HandlerRegistry {
    handlers: HashMap<QueueItemType, Arc<dyn QueueItemHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. A later registration for the same type replaces
    /// the earlier one.
    pub fn register<H: QueueItemHandler>(&mut self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn QueueItemHandler>) {
        let item_type = handler.item_type();
        if let Some(previous) = self.handlers.insert(item_type, handler) {
            tracing::warn!(
                "Handler '{}' for {} replaced",
                previous.name(),
                item_type
            );
        }
    }

    pub fn get(&self, item_type: QueueItemType) -> Option<&Arc<dyn QueueItemHandler>> {
        self.handlers.get(&item_type)
    }

    pub fn contains(&self, item_type: QueueItemType) -> bool {
        self.handlers.contains_key(&item_type)
    }

    /// Registered types in declaration order.
    pub fn registered_types(&self) -> Vec<QueueItemType> {
        QueueItemType::ALL
            .iter()
            .copied()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(QueueItemType, &'static str);

    #[async_trait]
    impl QueueItemHandler for Noop {
        fn name(&self) -> &'static str {
            self.1
        }

        fn item_type(&self) -> QueueItemType {
            self.0
        }

        async fn handle(&self, _network: &str, _item: &QueueItem) -> Result<bool, HandlerError> {
            Ok(true)
        }
    }

    #[test]
    fn test_registry_lookup_and_order() {
        let mut registry = HandlerRegistry::new();
        registry.register(Noop(QueueItemType::Price, "price"));
        registry.register(Noop(QueueItemType::Block, "block"));

        assert!(registry.contains(QueueItemType::Block));
        assert!(!registry.contains(QueueItemType::Operation));
        assert_eq!(
            registry.registered_types(),
            vec![QueueItemType::Block, QueueItemType::Price]
        );
    }

    #[test]
    fn test_later_registration_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register(Noop(QueueItemType::Block, "first"));
        registry.register(Noop(QueueItemType::Block, "second"));
        assert_eq!(registry.handler_count(), 1);
        assert_eq!(registry.get(QueueItemType::Block).unwrap().name(), "second");
    }
}
