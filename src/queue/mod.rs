//! The shared work queue: item identity, time source and persistence.

pub mod clock;
pub mod item;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use item::{coerce_block, item_identity, QueueItem, QueueItemDraft, QueueItemError, QueueItemType};
pub use store::{
    submit, LeaseFilter, LeaseSort, MemoryQueueStore, PgQueueStore, QueueScope, QueueStore, StoreError,
};
