use super::account::{Amount, Balance};
use super::{ActivationId, CheckId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Single activation, optionally addressed to one user.
    Personal,
    Multi,
}

/// Parameters supplied by the creator of a check.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheck {
    pub check_type: CheckType,
    pub total_amount: Amount,
    pub max_activations: u32,
    pub password: Option<String>,
    pub target_user: Option<UserId>,
    pub required_subscription: Option<String>,
    pub description: Option<String>,
    pub ttl_hours: Option<u32>,
}

impl NewCheck {
    pub fn personal(amount: Amount) -> Self {
        Self {
            check_type: CheckType::Personal,
            total_amount: amount,
            max_activations: 1,
            password: None,
            target_user: None,
            required_subscription: None,
            description: None,
            ttl_hours: None,
        }
    }

    pub fn multi(amount: Amount, activations: u32) -> Self {
        Self {
            check_type: CheckType::Multi,
            max_activations: activations,
            ..Self::personal(amount)
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn for_user(mut self, user: UserId) -> Self {
        self.target_user = Some(user);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Check {
    pub id: CheckId,
    pub creator: UserId,
    /// Upper-cased redemption code.
    pub code: String,
    pub check_type: CheckType,
    pub total_amount: Balance,
    pub amount_per_activation: Balance,
    pub max_activations: u32,
    pub current_activations: u32,
    pub password_hash: Option<String>,
    pub target_user: Option<UserId>,
    pub required_subscription: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub refunded_amount: Balance,
}

impl Check {
    /// `floor(total / activations)`.
    pub fn split(total: Decimal, activations: u32) -> Decimal {
        if activations == 0 {
            return Decimal::ZERO;
        }
        (total / Decimal::from(activations)).floor()
    }

    pub fn normalize_code(code: &str) -> String {
        code.trim().to_ascii_uppercase()
    }

    pub fn redeemed_amount(&self) -> Balance {
        Balance::new(self.amount_per_activation.value() * Decimal::from(self.current_activations))
    }

    /// Funds held by this check that have not been redeemed or refunded.
    pub fn escrow(&self) -> Balance {
        self.total_amount - self.redeemed_amount() - self.refunded_amount
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_activations >= self.max_activations
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CheckActivation {
    pub id: ActivationId,
    pub check: CheckId,
    pub user: UserId,
    pub amount: Balance,
    pub activated_at: DateTime<Utc>,
}
