use super::ledger::Ledger;
use super::outbox::Outbox;
use super::unit_of_work::{Store, UnitOfWork};
use super::verification::JobQueue;
use crate::config::TaskRules;
use crate::domain::account::{Account, Balance};
use crate::domain::clock::ClockRef;
use crate::domain::ledger::{AdjustRequest, LedgerReason};
use crate::domain::ports::{NotificationKind, NotificationSinkRef};
use crate::domain::task::{
    ApprovalSource, Evidence, ExecutionStatus, NewTask, Resolution, Task, TaskExecution, TaskKind,
    TaskStatus,
};
use crate::domain::{ExecutionId, TaskId, UserId};
use crate::error::{MarketError, Result};
use chrono::{Duration, DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Hook deciding what an executor earns for one execution.
///
/// The result must not exceed the task's escrowed `reward_per_execution`.
pub trait RewardPolicy: Send + Sync {
    fn reward_for(&self, task: &Task, executor: &Account) -> Balance;
}

/// Pays the task's base reward to everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseReward;

impl RewardPolicy for BaseReward {
    fn reward_for(&self, task: &Task, _executor: &Account) -> Balance {
        task.reward_per_execution
    }
}

/// Task creation, the execution lifecycle and escrow settlement.
#[derive(Clone)]
pub struct TaskEngine {
    store: Store,
    ledger: Ledger,
    jobs: JobQueue,
    notifier: NotificationSinkRef,
    clock: ClockRef,
    rules: TaskRules,
    rewards: Arc<dyn RewardPolicy>,
}

impl TaskEngine {
    pub fn new(
        store: Store,
        ledger: Ledger,
        jobs: JobQueue,
        notifier: NotificationSinkRef,
        clock: ClockRef,
        rules: TaskRules,
    ) -> Self {
        Self {
            store,
            ledger,
            jobs,
            notifier,
            clock,
            rules,
            rewards: Arc::new(BaseReward),
        }
    }

    pub fn with_reward_policy(mut self, rewards: Arc<dyn RewardPolicy>) -> Self {
        self.rewards = rewards;
        self
    }

    /// `reward × executions × (1 + commission) + promotion fee`, rounded up to cents.
    pub fn total_cost(&self, draft: &NewTask) -> Decimal {
        let pool = draft.reward_per_execution.value() * Decimal::from(draft.total_executions);
        let fee = if draft.promoted {
            self.rules.promotion_fee
        } else {
            Decimal::ZERO
        };
        (pool * (Decimal::ONE + self.rules.commission_rate) + fee)
            .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero)
    }

    fn validate(&self, draft: &NewTask) -> Result<String> {
        let reward = draft.reward_per_execution.value();
        if reward < self.rules.min_reward || reward > self.rules.max_reward {
            return Err(MarketError::validation(format!(
                "reward must be between {} and {}",
                self.rules.min_reward, self.rules.max_reward
            )));
        }
        if reward.normalize().scale() > 2 {
            return Err(MarketError::validation("reward must be a whole number of cents"));
        }
        if draft.total_executions < self.rules.min_executions
            || draft.total_executions > self.rules.max_executions
        {
            return Err(MarketError::validation(format!(
                "executions must be between {} and {}",
                self.rules.min_executions, self.rules.max_executions
            )));
        }
        if let Some(ttl) = draft.ttl_hours
            && (ttl == 0 || ttl > self.rules.max_ttl_hours)
        {
            return Err(MarketError::validation(format!(
                "task lifetime must be between 1 and {} hours",
                self.rules.max_ttl_hours
            )));
        }
        validate_target(draft.kind, &draft.target)
    }

    #[instrument(skip(self, draft), fields(kind = ?draft.kind, executions = draft.total_executions))]
    pub async fn create_task(&self, author: UserId, draft: NewTask) -> Result<Task> {
        let target = self.validate(&draft)?;
        let now = self.clock.now();
        let mut uow = self.store.begin().await;

        let account = uow
            .account(author)
            .await?
            .ok_or(MarketError::AccountNotFound(author))?;
        let quota = self.rules.daily_quota.for_tier(account.tier);
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|start| start.and_utc())
            .unwrap_or(now);
        let created_today = uow
            .tasks_by_author(author)
            .await?
            .iter()
            .filter(|task| task.created_at >= day_start)
            .count();
        if created_today >= quota as usize {
            return Err(MarketError::validation(format!(
                "daily task quota of {quota} reached"
            )));
        }

        let cost = self.total_cost(&draft);
        let id = uow.next_id("tasks").await?;
        self.ledger
            .adjust(
                &mut uow,
                AdjustRequest::new(author, -cost, cost, LedgerReason::TaskEscrow).for_task(id),
            )
            .await?;

        let ttl = draft.ttl_hours.unwrap_or(self.rules.default_ttl_hours);
        let task = Task {
            id,
            author,
            kind: draft.kind,
            target,
            reward_per_execution: draft.reward_per_execution.into(),
            total_executions: draft.total_executions,
            completed_executions: 0,
            remaining_executions: draft.total_executions,
            reserved_executions: 0,
            clicks: 0,
            total_cost: Balance::new(cost),
            frozen_amount: Balance::new(cost),
            spent_amount: Balance::ZERO,
            refunded_amount: Balance::ZERO,
            status: TaskStatus::Active,
            auto_check: draft.auto_check,
            min_tier: draft.min_tier,
            min_account_age_days: draft.min_account_age_days,
            created_at: now,
            expires_at: now + Duration::hours(i64::from(ttl)),
        };
        uow.insert_task(&task).await?;
        uow.commit().await?;

        info!(task = task.id, author, cost = %cost, "task created");
        let mut outbox = Outbox::new();
        outbox.push(
            author,
            NotificationKind::TaskCreated,
            json!({ "task": task.id, "cost": cost }),
        );
        outbox.deliver(&self.notifier).await;
        Ok(task)
    }

    #[instrument(skip(self))]
    pub async fn start_execution(&self, task_id: TaskId, user: UserId) -> Result<TaskExecution> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await;
        let mut task = uow.require_task(task_id).await?;

        if task.status != TaskStatus::Active {
            return Err(MarketError::TaskInactive(task_id));
        }
        if task.is_past_expiry(now) {
            return Err(MarketError::TaskExpired(task_id));
        }
        if task.available_slots() == 0 {
            return Err(MarketError::TaskExhausted(task_id));
        }
        if task.author == user {
            return Err(MarketError::OwnTask);
        }
        if uow.execution_for(task_id, user).await?.is_some() {
            return Err(MarketError::AlreadyExecuted(task_id));
        }

        let account = uow
            .account(user)
            .await?
            .ok_or(MarketError::AccountNotFound(user))?;
        self.check_eligibility(&task, &account, now)?;

        let reward = self.rewards.reward_for(&task, &account);
        if !(reward > Balance::ZERO && reward <= task.reward_per_execution) {
            return Err(MarketError::validation(format!(
                "reward {reward} is outside the escrowed amount"
            )));
        }

        let execution = TaskExecution {
            id: uow.next_id("executions").await?,
            task: task_id,
            user,
            status: ExecutionStatus::Pending,
            reward_amount: reward,
            evidence: None,
            submitted_at: None,
            in_review_since: None,
            auto_check_attempts: 0,
            auto_check_result: None,
            rejection_reason: None,
            started_at: now,
            expires_at: now + self.rules.execution_window(),
            resolved_at: None,
        };
        uow.insert_execution(&execution)
            .await
            .map_err(|err| match err {
                MarketError::UniqueViolation(_) => MarketError::AlreadyExecuted(task_id),
                other => other,
            })?;

        task.clicks += 1;
        task.reserved_executions += 1;
        uow.save_task(&task)?;
        uow.commit().await?;

        debug!(execution = execution.id, "execution started");
        Ok(execution)
    }

    fn check_eligibility(&self, task: &Task, account: &Account, now: DateTime<Utc>) -> Result<()> {
        let min_age = task
            .min_account_age_days
            .unwrap_or(0)
            .max(self.rules.min_account_age_days);
        if account.age_days(now) < i64::from(min_age) {
            return Err(MarketError::NotEligible(format!(
                "account must be at least {min_age} days old"
            )));
        }
        if let Some(min_tier) = task.min_tier
            && account.tier < min_tier
        {
            return Err(MarketError::NotEligible(format!(
                "tier {min_tier:?} or higher required"
            )));
        }
        Ok(())
    }

    /// Attaches evidence and routes the execution to auto-check or manual review.
    #[instrument(skip(self, evidence))]
    pub async fn submit_execution(
        &self,
        execution_id: ExecutionId,
        user: UserId,
        evidence: Evidence,
    ) -> Result<TaskExecution> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await;
        let mut execution = uow.require_execution(execution_id).await?;

        if execution.user != user {
            return Err(MarketError::validation(
                "execution belongs to another user",
            ));
        }
        if execution.status != ExecutionStatus::Pending || execution.submitted_at.is_some() {
            return Err(MarketError::AlreadyProcessed(execution_id));
        }
        if now > execution.expires_at {
            return Err(MarketError::validation("execution window has elapsed"));
        }

        let task = uow.require_task(execution.task).await?;
        execution.evidence = Some(evidence);
        execution.submitted_at = Some(now);

        let mut outbox = Outbox::new();
        let queued = if task.auto_check {
            let job = self.jobs.enqueue(&mut uow, &task, &execution).await?;
            debug!(job = job.id, "verification job queued");
            true
        } else {
            execution.status = ExecutionStatus::InReview;
            execution.in_review_since = Some(now);
            outbox.push(
                task.author,
                NotificationKind::ExecutionSubmitted,
                json!({ "task": task.id, "execution": execution.id, "user": user }),
            );
            false
        };
        uow.save_execution(&execution)?;
        uow.commit().await?;

        if queued {
            self.jobs.wake();
        }
        outbox.deliver(&self.notifier).await;
        Ok(execution)
    }

    /// Final decision on an execution, in its own unit of work.
    pub async fn resolve_execution(
        &self,
        execution_id: ExecutionId,
        resolution: Resolution,
    ) -> Result<TaskExecution> {
        let mut uow = self.store.begin().await;
        let (execution, outbox) = self
            .resolve_execution_in(&mut uow, execution_id, resolution)
            .await?;
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        Ok(execution)
    }

    /// Manual moderation by the task author.
    pub async fn moderate(
        &self,
        moderator: UserId,
        execution_id: ExecutionId,
        approve: bool,
        reason: Option<String>,
    ) -> Result<TaskExecution> {
        let mut uow = self.store.begin().await;
        let execution = uow.require_execution(execution_id).await?;
        let task = uow.require_task(execution.task).await?;
        if task.author != moderator {
            return Err(MarketError::validation(
                "only the task author may moderate executions",
            ));
        }
        let resolution = if approve {
            Resolution::Approve(ApprovalSource::Author)
        } else {
            Resolution::Reject(reason.unwrap_or_else(|| "rejected by author".to_string()))
        };
        let (execution, outbox) = self
            .resolve_execution_in(&mut uow, execution_id, resolution)
            .await?;
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        Ok(execution)
    }

    /// The single choke point through which every execution is finalized.
    ///
    /// Runs inside the caller's unit of work. A terminal execution fails with
    /// `AlreadyProcessed` before anything is staged, so repeated calls never pay twice.
    #[instrument(skip(self, uow))]
    pub async fn resolve_execution_in(
        &self,
        uow: &mut UnitOfWork,
        execution_id: ExecutionId,
        resolution: Resolution,
    ) -> Result<(TaskExecution, Outbox)> {
        let now = self.clock.now();
        let mut execution = uow.require_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(MarketError::AlreadyProcessed(execution_id));
        }
        let mut task = uow.require_task(execution.task).await?;
        let mut outbox = Outbox::new();

        match resolution {
            Resolution::Approve(source) => {
                let reward = execution.reward_amount;
                if task.frozen_amount < reward || task.remaining_executions == 0 {
                    return Err(MarketError::Storage(format!(
                        "task {} escrow cannot cover execution {}",
                        task.id, execution.id
                    )));
                }
                self.ledger
                    .adjust(
                        uow,
                        AdjustRequest::new(
                            execution.user,
                            reward.value(),
                            Decimal::ZERO,
                            LedgerReason::TaskReward,
                        )
                        .for_task(task.id),
                    )
                    .await?;
                self.ledger
                    .adjust(
                        uow,
                        AdjustRequest::new(
                            task.author,
                            Decimal::ZERO,
                            -reward.value(),
                            LedgerReason::TaskPayout,
                        )
                        .for_task(task.id),
                    )
                    .await?;

                task.completed_executions += 1;
                task.remaining_executions -= 1;
                task.reserved_executions = task.reserved_executions.saturating_sub(1);
                task.spent_amount += reward;
                task.frozen_amount -= reward;

                execution.status = match source {
                    ApprovalSource::Author => ExecutionStatus::Completed,
                    ApprovalSource::AutoCheck | ApprovalSource::ReviewTimeout => {
                        ExecutionStatus::AutoApproved
                    }
                };
                outbox.push(
                    execution.user,
                    NotificationKind::ExecutionApproved,
                    json!({ "task": task.id, "execution": execution.id, "reward": reward, "source": source }),
                );
                info!(execution = execution.id, task = task.id, reward = %reward, ?source, "execution approved");
            }
            Resolution::Reject(reason) => {
                task.reserved_executions = task.reserved_executions.saturating_sub(1);
                execution.status = ExecutionStatus::Rejected;
                outbox.push(
                    execution.user,
                    NotificationKind::ExecutionRejected,
                    json!({ "task": task.id, "execution": execution.id, "reason": reason }),
                );
                info!(execution = execution.id, task = task.id, %reason, "execution rejected");
                execution.rejection_reason = Some(reason);
            }
        }
        execution.resolved_at = Some(now);

        self.settle_if_finished(uow, &mut task, &mut outbox).await?;
        uow.save_task(&task)?;
        uow.save_execution(&execution)?;
        Ok((execution, outbox))
    }

    /// Completes exhausted tasks and returns leftover escrow once nothing can claim it.
    async fn settle_if_finished(
        &self,
        uow: &mut UnitOfWork,
        task: &mut Task,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let finished = match task.status {
            TaskStatus::Active if task.remaining_executions == 0 => {
                task.status = TaskStatus::Completed;
                outbox.push(
                    task.author,
                    NotificationKind::TaskCompleted,
                    json!({ "task": task.id, "spent": task.spent_amount }),
                );
                true
            }
            TaskStatus::Expired => task.reserved_executions == 0,
            _ => false,
        };
        if finished {
            let leftover = task.frozen_amount;
            self.release_escrow(uow, task, leftover).await?;
        }
        Ok(())
    }

    async fn release_escrow(&self, uow: &mut UnitOfWork, task: &mut Task, amount: Balance) -> Result<()> {
        if amount <= Balance::ZERO {
            return Ok(());
        }
        self.ledger
            .adjust(
                uow,
                AdjustRequest::new(
                    task.author,
                    amount.value(),
                    -amount.value(),
                    LedgerReason::TaskRefund,
                )
                .for_task(task.id),
            )
            .await?;
        task.frozen_amount -= amount;
        task.refunded_amount += amount;
        debug!(task = task.id, refunded = %amount, "escrow released");
        Ok(())
    }

    /// Hands a pending execution over to the task author.
    pub async fn escalate_in(
        &self,
        uow: &mut UnitOfWork,
        execution_id: ExecutionId,
        reason: &str,
    ) -> Result<(TaskExecution, Outbox)> {
        let now = self.clock.now();
        let mut execution = uow.require_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Err(MarketError::AlreadyProcessed(execution_id));
        }
        let task = uow.require_task(execution.task).await?;
        execution.status = ExecutionStatus::InReview;
        execution.in_review_since = Some(now);
        execution.auto_check_result = Some(reason.to_string());
        uow.save_execution(&execution)?;

        let mut outbox = Outbox::new();
        outbox.push(
            task.author,
            NotificationKind::ExecutionEscalated,
            json!({ "task": task.id, "execution": execution.id, "reason": reason }),
        );
        info!(execution = execution.id, %reason, "execution escalated to manual review");
        Ok((execution, outbox))
    }

    pub async fn escalate_to_review(&self, execution_id: ExecutionId, reason: &str) -> Result<TaskExecution> {
        let mut uow = self.store.begin().await;
        let (execution, outbox) = self.escalate_in(&mut uow, execution_id, reason).await?;
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        Ok(execution)
    }

    /// Marks overdue active tasks expired and refunds escrow no open execution needs.
    #[instrument(skip(self))]
    pub async fn expire_tasks(&self) -> Result<Vec<TaskId>> {
        let now = self.clock.now();
        let candidates = self.store.read().active_tasks().await?;
        let mut expired = Vec::new();

        for candidate in candidates.into_iter().filter(|task| task.is_past_expiry(now)) {
            let mut uow = self.store.begin().await;
            let mut task = uow.require_task(candidate.id).await?;
            if task.status != TaskStatus::Active {
                continue;
            }
            task.status = TaskStatus::Expired;
            let releasable = task.releasable_escrow();
            self.release_escrow(&mut uow, &mut task, releasable).await?;
            uow.save_task(&task)?;
            uow.commit().await?;

            let mut outbox = Outbox::new();
            outbox.push(
                task.author,
                NotificationKind::TaskExpired,
                json!({ "task": task.id, "refunded": releasable }),
            );
            outbox.deliver(&self.notifier).await;
            info!(task = task.id, refunded = %releasable, "task expired");
            expired.push(task.id);
        }
        Ok(expired)
    }

    /// Rejects pending executions whose submission window elapsed without evidence.
    pub async fn expire_executions(&self) -> Result<Vec<ExecutionId>> {
        let now = self.clock.now();
        let stale: Vec<_> = self
            .store
            .read()
            .open_executions()
            .await?
            .into_iter()
            .filter(|e| {
                e.status == ExecutionStatus::Pending && e.submitted_at.is_none() && now > e.expires_at
            })
            .map(|e| e.id)
            .collect();
        self.resolve_each(stale, || Resolution::reject("execution window elapsed"))
            .await
    }

    /// Approves executions that waited in review longer than the review timeout.
    pub async fn auto_approve_stale_reviews(&self) -> Result<Vec<ExecutionId>> {
        let cutoff = self.clock.now() - self.rules.review_timeout();
        let stale: Vec<_> = self
            .store
            .read()
            .open_executions()
            .await?
            .into_iter()
            .filter(|e| {
                e.status == ExecutionStatus::InReview
                    && e.in_review_since.is_some_and(|since| since <= cutoff)
            })
            .map(|e| e.id)
            .collect();
        self.resolve_each(stale, || Resolution::Approve(ApprovalSource::ReviewTimeout))
            .await
    }

    async fn resolve_each(
        &self,
        ids: Vec<ExecutionId>,
        resolution: impl Fn() -> Resolution,
    ) -> Result<Vec<ExecutionId>> {
        let mut resolved = Vec::new();
        for id in ids {
            match self.resolve_execution(id, resolution()).await {
                Ok(_) => resolved.push(id),
                Err(err) if err.is_already_done() => {}
                Err(err) => warn!(execution = id, error = %err, "sweep could not resolve execution"),
            }
        }
        Ok(resolved)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.store.read().require_task(id).await
    }

    pub async fn get_execution(&self, id: ExecutionId) -> Result<TaskExecution> {
        self.store.read().require_execution(id).await
    }

    pub async fn execution_for(&self, task: TaskId, user: UserId) -> Result<TaskExecution> {
        self.store
            .read()
            .execution_for(task, user)
            .await?
            .ok_or_else(|| MarketError::not_found("execution", format!("{task}/{user}")))
    }

    pub async fn tasks_for_author(&self, author: UserId) -> Result<Vec<Task>> {
        self.store.read().tasks_by_author(author).await
    }

    pub async fn executions_for_task(&self, task: TaskId) -> Result<Vec<TaskExecution>> {
        self.store.read().executions_for_task(task).await
    }

    pub async fn executions_for_user(&self, user: UserId) -> Result<Vec<TaskExecution>> {
        self.store.read().executions_for_user(user).await
    }
}

/// Normalizes a task target and checks it fits the task kind.
///
/// Accepts `@handle` or `https://t.me/...` / `https://telegram.me/...` links. Post
/// kinds need a link to a specific message; bot tasks need a bot username.
pub fn validate_target(kind: TaskKind, target: &str) -> Result<String> {
    let target = target.trim();
    if let Some(handle) = target.strip_prefix('@') {
        if !is_valid_handle(handle) {
            return Err(MarketError::validation(format!("invalid handle '{target}'")));
        }
        return match kind {
            TaskKind::PostReaction | TaskKind::PostView => Err(MarketError::validation(
                "post tasks need a link to a message",
            )),
            TaskKind::BotStart if !handle.to_ascii_lowercase().ends_with("bot") => {
                Err(MarketError::validation("bot tasks need a bot username"))
            }
            _ => Ok(target.to_string()),
        };
    }

    let url = Url::parse(target)
        .map_err(|err| MarketError::validation(format!("invalid target url: {err}")))?;
    if url.scheme() != "https" {
        return Err(MarketError::validation("target url must use https"));
    }
    match url.host_str() {
        Some("t.me") | Some("telegram.me") => {}
        _ => return Err(MarketError::validation("target must be a t.me link")),
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let Some(first) = segments.first() else {
        return Err(MarketError::validation("target link has no path"));
    };

    match kind {
        TaskKind::PostReaction | TaskKind::PostView => {
            let is_post = segments.len() >= 2
                && segments
                    .last()
                    .is_some_and(|s| s.chars().all(|c| c.is_ascii_digit()));
            if !is_post {
                return Err(MarketError::validation(
                    "post tasks need a link to a message",
                ));
            }
        }
        TaskKind::BotStart => {
            if !first.to_ascii_lowercase().ends_with("bot") {
                return Err(MarketError::validation("bot tasks need a bot username"));
            }
        }
        TaskKind::ChannelSubscription | TaskKind::GroupJoin => {}
    }
    Ok(url.to_string())
}

fn is_valid_handle(handle: &str) -> bool {
    (5..=32).contains(&handle.len())
        && handle.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
