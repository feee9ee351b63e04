use crate::domain::{CheckId, ExecutionId, TaskId, UserId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or a failed business gate. Never retried.
    Validation,
    InsufficientFunds,
    /// Idempotence guard tripped: the operation already happened.
    Conflict,
    /// The external verifier could not answer. Retried by the pipeline.
    ExternalVerifier,
    NotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },
    #[error("Account {0} not found")]
    AccountNotFound(UserId),
    #[error("Account {0} already exists")]
    AccountExists(UserId),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {0} is not active")]
    TaskInactive(TaskId),
    #[error("Task {0} has expired")]
    TaskExpired(TaskId),
    #[error("Task {0} has no executions left")]
    TaskExhausted(TaskId),
    #[error("Users cannot execute their own task")]
    OwnTask,
    #[error("Task {0} was already executed by this user")]
    AlreadyExecuted(TaskId),
    #[error("Not eligible: {0}")]
    NotEligible(String),
    #[error("Execution {0} was already processed")]
    AlreadyProcessed(ExecutionId),

    #[error("Check {0} is inactive")]
    CheckInactive(CheckId),
    #[error("Check {0} has expired")]
    CheckExpired(CheckId),
    #[error("Check {0} has no activations remaining")]
    NoActivationsRemaining(CheckId),
    #[error("Check {0} is addressed to another user")]
    NotForYou(CheckId),
    #[error("Check {0} was already activated by this user")]
    AlreadyActivated(CheckId),
    #[error("Invalid check password")]
    InvalidPassword,
    #[error("Subscription to {0} is required")]
    SubscriptionRequired(String),

    #[error("Verifier error: {0}")]
    Verifier(String),

    #[error("Unique constraint violated on {0}")]
    UniqueViolation(&'static str),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ValidationError(_)
            | Self::AccountExists(_)
            | Self::TaskInactive(_)
            | Self::TaskExpired(_)
            | Self::TaskExhausted(_)
            | Self::OwnTask
            | Self::NotEligible(_)
            | Self::CheckInactive(_)
            | Self::CheckExpired(_)
            | Self::NotForYou(_)
            | Self::InvalidPassword
            | Self::SubscriptionRequired(_) => ErrorClass::Validation,
            Self::InsufficientFunds { .. } => ErrorClass::InsufficientFunds,
            Self::AlreadyExecuted(_)
            | Self::AlreadyProcessed(_)
            | Self::NoActivationsRemaining(_)
            | Self::AlreadyActivated(_)
            | Self::UniqueViolation(_) => ErrorClass::Conflict,
            Self::Verifier(_) => ErrorClass::ExternalVerifier,
            Self::AccountNotFound(_) | Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Storage(_) | Self::Codec(_) | Self::CsvError(_) | Self::IoError(_) => {
                ErrorClass::Internal
            }
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDb(_) => ErrorClass::Internal,
        }
    }

    /// True for idempotence guards that callers may report as "already done".
    pub fn is_already_done(&self) -> bool {
        matches!(
            self,
            Self::AlreadyProcessed(_) | Self::AlreadyActivated(_) | Self::AlreadyExecuted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
