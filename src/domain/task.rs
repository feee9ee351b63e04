use super::account::{Amount, Balance, UserTier};
use super::{ExecutionId, TaskId, UserId};
use crate::error::MarketError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a task asks the executor to do on the chat platform.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ChannelSubscription,
    GroupJoin,
    PostReaction,
    PostView,
    BotStart,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        Self::ChannelSubscription,
        Self::GroupJoin,
        Self::PostReaction,
        Self::PostView,
        Self::BotStart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelSubscription => "channel_subscription",
            Self::GroupJoin => "group_join",
            Self::PostReaction => "post_reaction",
            Self::PostView => "post_view",
            Self::BotStart => "bot_start",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| MarketError::validation(format!("unknown task kind '{s}'")))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Expired,
}

/// Parameters supplied by a sponsor when creating a task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub target: String,
    pub reward_per_execution: Amount,
    pub total_executions: u32,
    pub auto_check: bool,
    pub promoted: bool,
    pub min_tier: Option<UserTier>,
    pub min_account_age_days: Option<u32>,
    /// Lifetime of the task. Falls back to the configured default.
    pub ttl_hours: Option<u32>,
}

impl NewTask {
    pub fn new(kind: TaskKind, target: impl Into<String>, reward: Amount, executions: u32) -> Self {
        Self {
            kind,
            target: target.into(),
            reward_per_execution: reward,
            total_executions: executions,
            auto_check: true,
            promoted: false,
            min_tier: None,
            min_account_age_days: None,
            ttl_hours: None,
        }
    }

    pub fn manual(mut self) -> Self {
        self.auto_check = false;
        self
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Task {
    pub id: TaskId,
    pub author: UserId,
    pub kind: TaskKind,
    pub target: String,
    pub reward_per_execution: Balance,
    pub total_executions: u32,
    pub completed_executions: u32,
    pub remaining_executions: u32,
    /// Executions started but not yet resolved. Each holds one slot.
    pub reserved_executions: u32,
    pub clicks: u64,
    pub total_cost: Balance,
    pub frozen_amount: Balance,
    pub spent_amount: Balance,
    pub refunded_amount: Balance,
    pub status: TaskStatus,
    pub auto_check: bool,
    pub min_tier: Option<UserTier>,
    pub min_account_age_days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Task {
    /// Slots a new executor may still take.
    pub fn available_slots(&self) -> u32 {
        self.remaining_executions
            .saturating_sub(self.reserved_executions)
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Escrow still needed to pay every open execution.
    pub fn reserved_escrow(&self) -> Balance {
        Balance::new(self.reward_per_execution.value() * Decimal::from(self.reserved_executions))
    }

    /// Frozen funds not backing any open execution.
    pub fn releasable_escrow(&self) -> Balance {
        let free = self.frozen_amount - self.reserved_escrow();
        if free.is_negative() { Balance::ZERO } else { free }
    }

    /// `spent + frozen + refunded` always adds back up to the escrowed cost.
    pub fn escrow_balanced(&self) -> bool {
        self.spent_amount + self.frozen_amount + self.refunded_amount == self.total_cost
            && !self.frozen_amount.is_negative()
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InReview,
    Completed,
    AutoApproved,
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::AutoApproved | Self::Rejected)
    }
}

/// Proof attached by the executor on submission.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Evidence {
    pub note: Option<String>,
    pub attachment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TaskExecution {
    pub id: ExecutionId,
    pub task: TaskId,
    pub user: UserId,
    pub status: ExecutionStatus,
    pub reward_amount: Balance,
    pub evidence: Option<Evidence>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the execution entered manual review. Drives the review timeout.
    pub in_review_since: Option<DateTime<Utc>>,
    pub auto_check_attempts: u32,
    pub auto_check_result: Option<String>,
    pub rejection_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Who approved an execution.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    Author,
    AutoCheck,
    ReviewTimeout,
}

/// Final decision on an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Approve(ApprovalSource),
    Reject(String),
}

impl Resolution {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: 1,
            author: 10,
            kind: TaskKind::ChannelSubscription,
            target: "@channel".into(),
            reward_per_execution: Balance::new(dec!(100)),
            total_executions: 3,
            completed_executions: 1,
            remaining_executions: 2,
            reserved_executions: 1,
            clicks: 2,
            total_cost: Balance::new(dec!(330)),
            frozen_amount: Balance::new(dec!(230)),
            spent_amount: Balance::new(dec!(100)),
            refunded_amount: Balance::ZERO,
            status: TaskStatus::Active,
            auto_check: true,
            min_tier: None,
            min_account_age_days: None,
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[test]
    fn test_task_slots_and_escrow() {
        let task = sample_task();
        assert_eq!(task.available_slots(), 1);
        assert_eq!(task.reserved_escrow(), Balance::new(dec!(100)));
        assert_eq!(task.releasable_escrow(), Balance::new(dec!(130)));
        assert!(task.escrow_balanced());
        assert!(!task.is_past_expiry(task.created_at));
        assert!(task.is_past_expiry(task.expires_at));
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("follow".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_execution_status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::InReview.is_terminal());
        assert!(ExecutionStatus::AutoApproved.is_terminal());
        assert!(ExecutionStatus::Rejected.is_terminal());
    }
}
