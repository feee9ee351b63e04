use super::account::Balance;
use super::{CheckId, EntryId, TaskId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Credit,
    Debit,
    Freeze,
    Unfreeze,
}

impl EntryKind {
    /// Derives the entry kind from the spendable and frozen deltas of an adjustment.
    pub fn classify(amount: Decimal, frozen_delta: Decimal) -> Self {
        if amount < Decimal::ZERO && frozen_delta > Decimal::ZERO {
            Self::Freeze
        } else if amount > Decimal::ZERO && frozen_delta < Decimal::ZERO {
            Self::Unfreeze
        } else if amount + frozen_delta >= Decimal::ZERO {
            Self::Credit
        } else {
            Self::Debit
        }
    }
}

/// Why a balance moved. Drives earned/spent bookkeeping and audit listings.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Deposit,
    Withdrawal,
    TaskEscrow,
    TaskReward,
    TaskPayout,
    TaskRefund,
    CheckFunding,
    CheckRedemption,
    CheckRefund,
}

impl LedgerReason {
    /// Credits that count towards `total_earned`.
    pub fn is_earning(&self) -> bool {
        matches!(self, Self::TaskReward | Self::CheckRedemption)
    }

    /// Movements that change `total_spent`: positive for funding, negative for refunds.
    pub fn spent_delta(&self, amount: Decimal) -> Decimal {
        match self {
            Self::TaskEscrow | Self::CheckFunding | Self::TaskRefund | Self::CheckRefund => -amount,
            _ => Decimal::ZERO,
        }
    }

    /// True when the movement crosses the system boundary.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Deposit | Self::Withdrawal)
    }
}

/// One immutable row of the append-only balance log.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account: UserId,
    pub kind: EntryKind,
    pub reason: LedgerReason,
    /// Spendable delta.
    pub amount: Decimal,
    pub frozen_delta: Decimal,
    pub balance_before: Balance,
    pub balance_after: Balance,
    pub frozen_before: Balance,
    pub frozen_after: Balance,
    pub related_task: Option<TaskId>,
    pub related_check: Option<CheckId>,
    pub created_at: DateTime<Utc>,
}

/// A requested balance change, applied by the ledger inside a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustRequest {
    pub account: UserId,
    pub amount: Decimal,
    pub frozen_delta: Decimal,
    pub reason: LedgerReason,
    pub related_task: Option<TaskId>,
    pub related_check: Option<CheckId>,
}

impl AdjustRequest {
    pub fn new(account: UserId, amount: Decimal, frozen_delta: Decimal, reason: LedgerReason) -> Self {
        Self {
            account,
            amount,
            frozen_delta,
            reason,
            related_task: None,
            related_check: None,
        }
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.related_task = Some(task);
        self
    }

    pub fn for_check(mut self, check: CheckId) -> Self {
        self.related_check = Some(check);
        self
    }
}
