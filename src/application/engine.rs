use super::marketplace::Marketplace;
use super::tasks::validate_target;
use crate::domain::account::{Account, Amount, UserTier};
use crate::domain::check::NewCheck;
use crate::domain::clock::ManualClock;
use crate::domain::task::{Evidence, NewTask, TaskKind};
use crate::domain::{ExecutionId, TaskId, UserId};
use crate::error::{MarketError, Result};
use crate::infrastructure::in_memory::StaticVerifier;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CommandOp {
    Open,
    Deposit,
    Withdraw,
    CreateTask,
    Start,
    Submit,
    Approve,
    Reject,
    CreateCheck,
    Activate,
    GrantMembership,
    GrantReaction,
    /// Moves the clock forward by `count` minutes.
    Advance,
    Sweep,
}

/// One row of a command script.
///
/// Columns a command does not use are left empty.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Command {
    pub op: CommandOp,
    pub user: Option<UserId>,
    pub task: Option<TaskId>,
    pub execution: Option<ExecutionId>,
    pub amount: Option<Decimal>,
    pub count: Option<u32>,
    pub code: Option<String>,
    pub password: Option<String>,
    pub target: Option<String>,
    pub kind: Option<TaskKind>,
    pub tier: Option<UserTier>,
}

impl Command {
    fn user(&self) -> Result<UserId> {
        self.user.ok_or_else(|| self.missing("user"))
    }

    fn task(&self) -> Result<TaskId> {
        self.task.ok_or_else(|| self.missing("task"))
    }

    fn amount(&self) -> Result<Amount> {
        Amount::new(self.amount.ok_or_else(|| self.missing("amount"))?)
    }

    fn text(&self, value: &Option<String>, column: &str) -> Result<String> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| self.missing(column))
    }

    fn missing(&self, column: &str) -> MarketError {
        MarketError::validation(format!("{:?} needs a '{column}' value", self.op))
    }
}

/// Drives a [`Marketplace`] from a command script.
///
/// Check codes are random, so `create_check` rows name their check with the `code`
/// column and later `activate` rows refer to that label.
pub struct MarketplaceEngine {
    market: Marketplace,
    clock: ManualClock,
    verifier: StaticVerifier,
    labels: Mutex<HashMap<String, String>>,
}

impl MarketplaceEngine {
    pub fn new(market: Marketplace, clock: ManualClock, verifier: StaticVerifier) -> Self {
        Self {
            market,
            clock,
            verifier,
            labels: Mutex::new(HashMap::new()),
        }
    }

    pub fn market(&self) -> &Marketplace {
        &self.market
    }

    /// Applies one command, then runs any verification it made due.
    pub async fn process_command(&self, command: Command) -> Result<()> {
        debug!(op = ?command.op, "processing command");
        self.apply(&command).await?;
        self.market.drain_verifications().await?;
        Ok(())
    }

    async fn apply(&self, command: &Command) -> Result<()> {
        match command.op {
            CommandOp::Open => {
                self.market
                    .open_account(command.user()?, command.tier.unwrap_or_default())
                    .await?;
            }
            CommandOp::Deposit => {
                self.market
                    .deposit(command.user()?, command.amount()?)
                    .await?;
            }
            CommandOp::Withdraw => {
                self.market
                    .withdraw(command.user()?, command.amount()?)
                    .await?;
            }
            CommandOp::CreateTask => {
                let kind = command.kind.ok_or_else(|| command.missing("kind"))?;
                let draft = NewTask::new(
                    kind,
                    command.text(&command.target, "target")?,
                    command.amount()?,
                    command.count.ok_or_else(|| command.missing("count"))?,
                );
                self.market.create_task(command.user()?, draft).await?;
            }
            CommandOp::Start => {
                self.market
                    .start_execution(command.task()?, command.user()?)
                    .await?;
            }
            CommandOp::Submit => {
                let user = command.user()?;
                let execution = self.execution_of(command, user).await?;
                let evidence = Evidence {
                    note: command.target.clone(),
                    attachment: None,
                };
                self.market
                    .submit_execution(execution, user, evidence)
                    .await?;
            }
            CommandOp::Approve | CommandOp::Reject => {
                let execution = command.execution.ok_or_else(|| command.missing("execution"))?;
                let approve = command.op == CommandOp::Approve;
                let reason = command.target.clone().filter(|r| !r.is_empty());
                self.market
                    .moderate(command.user()?, execution, approve, reason)
                    .await?;
            }
            CommandOp::CreateCheck => {
                let amount = command.amount()?;
                let mut draft = match command.count {
                    Some(n) if n > 1 => NewCheck::multi(amount, n),
                    _ => NewCheck::personal(amount),
                };
                draft.password = command.password.clone().filter(|p| !p.is_empty());
                draft.required_subscription = command.target.clone().filter(|t| !t.is_empty());
                let check = self.market.create_check(command.user()?, draft).await?;
                if let Some(label) = command.code.as_deref().filter(|l| !l.is_empty()) {
                    self.labels
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(label.to_string(), check.code);
                }
            }
            CommandOp::Activate => {
                let label = command.text(&command.code, "code")?;
                let code = self
                    .labels
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get(&label)
                    .cloned()
                    .unwrap_or(label);
                let password = command.password.as_deref().filter(|p| !p.is_empty());
                self.market
                    .activate_check(command.user()?, &code, password)
                    .await?;
            }
            CommandOp::GrantMembership => {
                let target = command.text(&command.target, "target")?;
                let target = validate_target(TaskKind::ChannelSubscription, &target).unwrap_or(target);
                self.verifier
                    .grant_membership(command.user()?, &target)
                    .await;
            }
            CommandOp::GrantReaction => {
                let target = command.text(&command.target, "target")?;
                let target = validate_target(TaskKind::PostReaction, &target).unwrap_or(target);
                self.verifier.grant_reaction(command.user()?, &target).await;
            }
            CommandOp::Advance => {
                let minutes = command.count.ok_or_else(|| command.missing("count"))?;
                self.clock.advance(Duration::minutes(i64::from(minutes)));
            }
            CommandOp::Sweep => {
                self.market.sweep().await?;
            }
        }
        Ok(())
    }

    async fn execution_of(&self, command: &Command, user: UserId) -> Result<ExecutionId> {
        match command.execution {
            Some(execution) => Ok(execution),
            None => Ok(self.market.execution_for(command.task()?, user).await?.id),
        }
    }

    /// Consumes the engine and returns the final state of all accounts.
    pub async fn into_results(self) -> Result<Vec<Account>> {
        self.market.accounts().await
    }
}
