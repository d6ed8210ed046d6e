//! Default handler set and the chain-backed collaborators the binary wires
//! into the recovery dispatcher.

pub mod block;
pub mod chain;
pub mod hypervisor_status;
pub mod sink;

use std::sync::Arc;

pub use block::BlockTimestampHandler;
pub use chain::{locate_block, position_key, ChainSnapshotBuilder, NetworkClients, RpcBlockLocator};
pub use hypervisor_status::HypervisorStatusHandler;
pub use sink::PgRescrapeSink;

use crate::db::DbPool;
use crate::recovery::SnapshotBuilder;
use crate::worker::HandlerRegistry;

/// Registers every default handler.
pub fn register_handlers(
    registry: &mut HandlerRegistry,
    clients: &NetworkClients,
    db: Arc<DbPool>,
    snapshots: Arc<dyn SnapshotBuilder>,
) {
    registry.register(BlockTimestampHandler::new(clients.clone(), db));
    registry.register(HypervisorStatusHandler::new(snapshots));
}
