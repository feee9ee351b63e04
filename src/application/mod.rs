//! Application layer: the engines that own every state transition.
//!
//! Each operation opens one unit of work, composes ledger adjustments and entity
//! updates inside it, commits, and only then delivers notifications.

pub mod audit;
pub mod checks;
pub mod engine;
pub mod ledger;
pub mod marketplace;
pub mod outbox;
pub mod tasks;
pub mod unit_of_work;
pub mod verification;
