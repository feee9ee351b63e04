use super::UserId;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Logical tables of the persisted schema. Backends map each one to their own keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Accounts,
    Ledger,
    Tasks,
    TasksByAuthor,
    ActiveTasks,
    Executions,
    /// Unique `(task, user)` key of executions.
    ExecutionKeys,
    ExecutionsByUser,
    OpenExecutions,
    Checks,
    /// Unique check code.
    CheckCodes,
    ChecksByCreator,
    ActiveChecks,
    /// Unique `(check, user)` key of activations.
    Activations,
    Jobs,
    JobQueue,
    Sequences,
}

impl Table {
    pub const ALL: [Table; 17] = [
        Self::Accounts,
        Self::Ledger,
        Self::Tasks,
        Self::TasksByAuthor,
        Self::ActiveTasks,
        Self::Executions,
        Self::ExecutionKeys,
        Self::ExecutionsByUser,
        Self::OpenExecutions,
        Self::Checks,
        Self::CheckCodes,
        Self::ChecksByCreator,
        Self::ActiveChecks,
        Self::Activations,
        Self::Jobs,
        Self::JobQueue,
        Self::Sequences,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Ledger => "ledger",
            Self::Tasks => "tasks",
            Self::TasksByAuthor => "tasks_by_author",
            Self::ActiveTasks => "active_tasks",
            Self::Executions => "executions",
            Self::ExecutionKeys => "execution_keys",
            Self::ExecutionsByUser => "executions_by_user",
            Self::OpenExecutions => "open_executions",
            Self::Checks => "checks",
            Self::CheckCodes => "check_codes",
            Self::ChecksByCreator => "checks_by_creator",
            Self::ActiveChecks => "active_checks",
            Self::Activations => "activations",
            Self::Jobs => "jobs",
            Self::JobQueue => "job_queue",
            Self::Sequences => "sequences",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

/// Ordered key-value storage with atomic batch writes.
///
/// Keys are compared bytewise, so big-endian encoded ids iterate in insertion order.
/// Isolation between writers is provided by the unit of work, not by the backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Applies every operation or none of them.
    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()>;
}

pub type StorageBackendRef = Arc<dyn StorageBackend>;

/// Outcome of one observation made by the external verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Satisfied,
    /// The condition is definitely not met.
    NotSatisfied,
    /// The platform could not tell, e.g. the bot lacks rights on the target.
    Undetermined(String),
}

/// Chat-platform lookups. Calls are read-only observations and safe to repeat.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn check_membership(&self, user: UserId, target: &str) -> Result<Verdict>;
    async fn check_reaction(&self, user: UserId, target: &str) -> Result<Verdict>;
}

pub type VerifierRef = Arc<dyn Verifier>;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskCreated,
    ExecutionSubmitted,
    ExecutionApproved,
    ExecutionRejected,
    ExecutionEscalated,
    TaskCompleted,
    TaskExpired,
    CheckActivated,
    CheckExpired,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Notification {
    pub user: UserId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(user: UserId, kind: NotificationKind, payload: serde_json::Value) -> Self {
        Self {
            user,
            kind,
            payload,
        }
    }
}

/// Fire-and-forget delivery of user notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

pub type NotificationSinkRef = Arc<dyn NotificationSink>;
