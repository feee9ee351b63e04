//! Domain layer: value objects, entities and the ports the core depends on.

pub mod account;
pub mod check;
pub mod clock;
pub mod job;
pub mod ledger;
pub mod ports;
pub mod task;

/// Chat-platform user id.
pub type UserId = i64;
pub type TaskId = u64;
pub type ExecutionId = u64;
pub type CheckId = u64;
pub type ActivationId = u64;
pub type EntryId = u64;
pub type JobId = u64;
