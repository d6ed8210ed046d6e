//! Error classification and the remediation that runs when a handler raises
//! a [`ProcessingError`].

pub mod collaborators;
pub mod dispatcher;
pub mod error;

pub use collaborators::{
    AlertKind, Alerter, BlockLocator, CollaboratorError, HypervisorSnapshot, RescrapeKind,
    RescrapeRequest, Rescraper, SnapshotBuilder, TracingAlerter,
};
pub use dispatcher::{DispatchError, ErrorRecoveryDispatcher, RecoveryOutcome, RecoverySettings};
pub use error::{ErrorAction, ErrorContext, ErrorKind, ProcessingError};
