//! Core of a chat micro-task marketplace.
//!
//! Sponsors escrow funds into tasks, executors complete them and get paid once a
//! verification pipeline or the sponsor approves, and users exchange gift checks.
//! Every balance change is recorded in an append-only ledger.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod telemetry;
