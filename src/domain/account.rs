use super::UserId;
use crate::error::MarketError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Represents a running monetary value.
///
/// This is a wrapper around `rust_decimal::Decimal` to enforce domain-specific rules
/// and provide type safety for ledger calculations. Unlike [`Amount`] it may
/// temporarily hold a negative value while a candidate adjustment is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// Represents a positive monetary amount carried by an operation.
///
/// Ensures that rewards, deposits and check amounts are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, MarketError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(MarketError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = MarketError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `None` when the sum leaves the representable range.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.normalize().fmt(f)
    }
}

// Implement basic arithmetic for Balance to make it a usable Value Object
impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Neg for Balance {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// Membership tier of a user. Drives daily quotas and task eligibility gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    #[default]
    Basic,
    Premium,
    Vip,
}

impl std::str::FromStr for UserTier {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "vip" => Ok(Self::Vip),
            other => Err(MarketError::validation(format!("unknown tier '{other}'"))),
        }
    }
}

/// The balance-bearing part of a user record.
///
/// Only [`crate::application::ledger::Ledger`] mutates the money fields. Engines read
/// accounts but always go through the ledger to change them.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Account {
    pub user: UserId,
    /// Spendable funds.
    pub balance: Balance,
    /// Funds escrowed against open task obligations.
    pub frozen_balance: Balance,
    pub total_earned: Balance,
    pub total_spent: Balance,
    pub tier: UserTier,
    pub registered_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user: UserId, tier: UserTier, registered_at: DateTime<Utc>) -> Self {
        Self {
            user,
            balance: Balance::ZERO,
            frozen_balance: Balance::ZERO,
            total_earned: Balance::ZERO,
            total_spent: Balance::ZERO,
            tier,
            registered_at,
        }
    }

    /// Whole days since registration, as seen at `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.registered_at).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_arithmetic() {
        let b1 = Balance::new(dec!(10.0));
        let b2 = Balance::new(dec!(5.0));
        assert_eq!(b1 + b2, Balance::new(dec!(15.0)));
        assert_eq!(b1 - b2, Balance::new(dec!(5.0)));
        assert!((b2 - b1).is_negative());
        assert!(!Balance::ZERO.is_negative());
        assert_eq!(-b2, Balance::new(dec!(-5.0)));
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(MarketError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(MarketError::ValidationError(_))
        ));
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("VIP".parse::<UserTier>().unwrap(), UserTier::Vip);
        assert_eq!("".parse::<UserTier>().unwrap(), UserTier::Basic);
        assert!("gold".parse::<UserTier>().is_err());
        assert!(UserTier::Vip > UserTier::Premium);
    }

    #[test]
    fn test_account_age() {
        let registered = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let account = Account::new(1, UserTier::Basic, registered);
        assert_eq!(account.age_days(registered + Duration::hours(49)), 2);
    }

    #[test]
    fn test_checked_add_stops_at_the_limit() {
        let max = Balance::new(Decimal::MAX);
        assert_eq!(max.checked_add(Balance::new(dec!(1))), None);
        assert_eq!(max.checked_add(Balance::new(dec!(-1))), Some(Balance::new(Decimal::MAX - dec!(1))));
    }
}
