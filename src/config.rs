//! Marketplace policy configuration.
//!
//! `MarketConfig::default()` carries the reference policy. A JSON file may override
//! any subset of fields; missing fields keep their defaults.

use crate::domain::account::UserTier;
use crate::domain::task::TaskKind;
use crate::error::{MarketError, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketConfig {
    pub tasks: TaskRules,
    pub checks: CheckRules,
    pub verification: VerificationConfig,
}

/// How executions of a given task kind get decided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// Ask the verifier; retry, then reject or escalate.
    Automated,
    /// The condition cannot be observed; approve on submission.
    Optimistic,
    /// Always hand over to the task author.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierQuota {
    pub basic: u32,
    pub premium: u32,
    pub vip: u32,
}

impl TierQuota {
    pub fn for_tier(&self, tier: UserTier) -> u32 {
        match tier {
            UserTier::Basic => self.basic,
            UserTier::Premium => self.premium,
            UserTier::Vip => self.vip,
        }
    }
}

impl Default for TierQuota {
    fn default() -> Self {
        Self {
            basic: 5,
            premium: 20,
            vip: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskRules {
    pub min_reward: Decimal,
    pub max_reward: Decimal,
    pub min_executions: u32,
    pub max_executions: u32,
    /// Fraction of the reward pool reserved on top of rewards, e.g. `0.1`.
    pub commission_rate: Decimal,
    pub promotion_fee: Decimal,
    pub default_ttl_hours: u32,
    pub max_ttl_hours: u32,
    /// How long an executor has to submit evidence after starting.
    pub execution_window_minutes: u32,
    /// Executions left in review longer than this are auto-approved.
    pub review_timeout_hours: u32,
    pub daily_quota: TierQuota,
    /// Global minimum account age for executors.
    pub min_account_age_days: u32,
}

impl Default for TaskRules {
    fn default() -> Self {
        Self {
            min_reward: dec!(1),
            max_reward: dec!(10000),
            min_executions: 1,
            max_executions: 10000,
            commission_rate: dec!(0.1),
            promotion_fee: dec!(50),
            default_ttl_hours: 24 * 7,
            max_ttl_hours: 24 * 30,
            execution_window_minutes: 60,
            review_timeout_hours: 24,
            daily_quota: TierQuota::default(),
            min_account_age_days: 0,
        }
    }
}

impl TaskRules {
    pub fn execution_window(&self) -> Duration {
        Duration::minutes(i64::from(self.execution_window_minutes))
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::hours(i64::from(self.review_timeout_hours))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckRules {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub max_activations: u32,
    pub min_per_activation: Decimal,
    pub code_length: usize,
    pub password_min_len: usize,
    pub password_max_len: usize,
    pub max_ttl_hours: u32,
}

impl Default for CheckRules {
    fn default() -> Self {
        Self {
            min_amount: dec!(1),
            max_amount: dec!(1000000),
            max_activations: 1000,
            min_per_activation: dec!(1),
            code_length: 10,
            password_min_len: 4,
            password_max_len: 64,
            max_ttl_hours: 24 * 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_attempts: u32,
    pub retry_delay_minutes: u32,
    pub worker_count: usize,
    /// Lease granted to a worker on claim. Running jobs past it count as stalled.
    pub lease_seconds: u32,
    /// Lease expiries tolerated before a job is failed for good.
    pub max_reclaims: u32,
    pub poll_interval_ms: u64,
    pub verifier_timeout_secs: u64,
    pub policies: HashMap<TaskKind, VerificationPolicy>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        let policies = HashMap::from([
            (TaskKind::ChannelSubscription, VerificationPolicy::Automated),
            (TaskKind::GroupJoin, VerificationPolicy::Automated),
            (TaskKind::PostReaction, VerificationPolicy::Automated),
            (TaskKind::PostView, VerificationPolicy::Optimistic),
            (TaskKind::BotStart, VerificationPolicy::Manual),
        ]);
        Self {
            max_attempts: 3,
            retry_delay_minutes: 30,
            worker_count: 4,
            lease_seconds: 300,
            max_reclaims: 3,
            poll_interval_ms: 500,
            verifier_timeout_secs: 10,
            policies,
        }
    }
}

impl VerificationConfig {
    pub fn policy_for(&self, kind: TaskKind) -> VerificationPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or(VerificationPolicy::Manual)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::minutes(i64::from(self.retry_delay_minutes))
    }

    pub fn lease(&self) -> Duration {
        Duration::seconds(i64::from(self.lease_seconds))
    }

    pub fn verifier_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.verifier_timeout_secs)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

impl MarketConfig {
    /// Loads a JSON config file on top of the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.tasks;
        if t.min_reward <= Decimal::ZERO || t.min_reward > t.max_reward {
            return Err(MarketError::validation("task reward bounds are inconsistent"));
        }
        if t.min_executions == 0 || t.min_executions > t.max_executions {
            return Err(MarketError::validation(
                "task execution bounds are inconsistent",
            ));
        }
        if t.commission_rate < Decimal::ZERO || t.promotion_fee < Decimal::ZERO {
            return Err(MarketError::validation("fees must not be negative"));
        }
        if t.default_ttl_hours == 0 || t.default_ttl_hours > t.max_ttl_hours {
            return Err(MarketError::validation("task ttl bounds are inconsistent"));
        }
        let c = &self.checks;
        if c.min_amount <= Decimal::ZERO || c.min_amount > c.max_amount {
            return Err(MarketError::validation("check amount bounds are inconsistent"));
        }
        if c.max_activations == 0 || c.min_per_activation <= Decimal::ZERO {
            return Err(MarketError::validation("check activation bounds are inconsistent"));
        }
        if c.code_length < 6 {
            return Err(MarketError::validation("check codes need at least 6 characters"));
        }
        let v = &self.verification;
        if v.max_attempts == 0 || v.worker_count == 0 {
            return Err(MarketError::validation(
                "verification needs at least one attempt and one worker",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_reference_policy() {
        let config = MarketConfig::default();
        config.validate().unwrap();
        assert_eq!(config.verification.max_attempts, 3);
        assert_eq!(config.verification.retry_delay(), Duration::minutes(30));
        assert_eq!(config.tasks.review_timeout(), Duration::hours(24));
        assert_eq!(
            config.verification.policy_for(TaskKind::PostView),
            VerificationPolicy::Optimistic
        );
        assert_eq!(config.tasks.daily_quota.for_tier(UserTier::Vip), 100);
    }

    #[test]
    fn test_partial_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tasks": {{"commission_rate": "0.2"}}, "verification": {{"policies": {{"post_view": "manual"}}}}}}"#
        )
        .unwrap();

        let config = MarketConfig::load(file.path()).unwrap();
        assert_eq!(config.tasks.commission_rate, dec!(0.2));
        assert_eq!(config.tasks.min_reward, dec!(1));
        assert_eq!(
            config.verification.policy_for(TaskKind::PostView),
            VerificationPolicy::Manual
        );
        // Kinds missing from an overridden map fall back to manual review.
        assert_eq!(
            config.verification.policy_for(TaskKind::GroupJoin),
            VerificationPolicy::Manual
        );
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let mut config = MarketConfig::default();
        config.tasks.min_executions = 0;
        assert!(matches!(
            config.validate(),
            Err(MarketError::ValidationError(_))
        ));
    }
}
