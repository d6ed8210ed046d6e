//! Which types a worker may lease next, and whether a leased item may run.

pub mod eligibility;
pub mod policy;
pub mod rotation;

pub use eligibility::EligibilityGate;
pub use policy::SchedulingPolicy;
pub use rotation::TypeRotation;
