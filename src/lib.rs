pub mod db;
pub mod handlers;
pub mod queue;
pub mod recovery;
pub mod rpc;
pub mod scheduling;
pub mod types;
pub mod worker;
