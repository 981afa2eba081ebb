pub mod burst;
pub mod limiter;

pub use burst::BurstTracker;
pub use limiter::{AdmissionControl, BlockedClient, Decision, DenyReason};
