pub mod network;
pub mod queue;

pub use network::NetworkConfig;
pub use queue::{LockRecoveryConfig, QueueConfig, RecoveryConfig, SchedulingConfig};
