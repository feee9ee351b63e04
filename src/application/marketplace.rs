use super::audit::{self, Reconciliation, SupplySnapshot};
use super::checks::{CheckEngine, ExpiredCheck};
use super::ledger::Ledger;
use super::tasks::TaskEngine;
use super::unit_of_work::Store;
use super::verification::{JobQueue, VerificationPipeline, WorkerPool};
use crate::config::MarketConfig;
use crate::domain::account::{Account, Amount, Balance, UserTier};
use crate::domain::check::{Check, CheckActivation, NewCheck};
use crate::domain::clock::ClockRef;
use crate::domain::job::VerificationJob;
use crate::domain::ledger::LedgerEntry;
use crate::domain::ports::{NotificationSinkRef, StorageBackendRef, VerifierRef};
use crate::domain::task::{Evidence, NewTask, Resolution, Task, TaskExecution};
use crate::domain::{CheckId, ExecutionId, JobId, TaskId, UserId};
use crate::error::Result;
use serde::Serialize;
use tracing::info;

/// Everything one periodic sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub expired_executions: Vec<ExecutionId>,
    pub approved_reviews: Vec<ExecutionId>,
    pub expired_tasks: Vec<TaskId>,
    pub expired_checks: Vec<ExpiredCheck>,
    pub reclaimed_jobs: Vec<JobId>,
}

/// Wires the engines over one store and exposes the marketplace operations.
#[derive(Clone)]
pub struct Marketplace {
    store: Store,
    ledger: Ledger,
    tasks: TaskEngine,
    checks: CheckEngine,
    pipeline: VerificationPipeline,
}

impl Marketplace {
    pub fn new(
        backend: StorageBackendRef,
        verifier: VerifierRef,
        notifier: NotificationSinkRef,
        clock: ClockRef,
        config: MarketConfig,
    ) -> Self {
        let store = Store::new(backend);
        let ledger = Ledger::new(store.clone(), clock.clone());
        let queue = JobQueue::new(clock.clone());
        let tasks = TaskEngine::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            notifier.clone(),
            clock.clone(),
            config.tasks,
        );
        let checks = CheckEngine::new(
            store.clone(),
            ledger.clone(),
            verifier.clone(),
            notifier.clone(),
            clock.clone(),
            config.checks,
        );
        let pipeline = VerificationPipeline::new(
            store.clone(),
            tasks.clone(),
            queue,
            verifier,
            notifier,
            clock,
            config.verification,
        );
        Self {
            store,
            ledger,
            tasks,
            checks,
            pipeline,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.tasks
    }

    pub fn checks(&self) -> &CheckEngine {
        &self.checks
    }

    pub fn pipeline(&self) -> &VerificationPipeline {
        &self.pipeline
    }

    // Accounts

    pub async fn open_account(&self, user: UserId, tier: UserTier) -> Result<Account> {
        self.ledger.open_account(user, tier).await
    }

    pub async fn set_tier(&self, user: UserId, tier: UserTier) -> Result<Account> {
        self.ledger.set_tier(user, tier).await
    }

    pub async fn deposit(&self, user: UserId, amount: Amount) -> Result<Account> {
        self.ledger.deposit(user, amount).await
    }

    pub async fn withdraw(&self, user: UserId, amount: Amount) -> Result<Account> {
        self.ledger.withdraw(user, amount).await
    }

    pub async fn get_user_balance(&self, user: UserId) -> Result<Account> {
        self.ledger.account(user).await
    }

    pub async fn ledger_history(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        self.ledger.history(user).await
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.store.read().accounts().await
    }

    // Tasks

    pub async fn create_task(&self, author: UserId, draft: NewTask) -> Result<Task> {
        self.tasks.create_task(author, draft).await
    }

    pub async fn start_execution(&self, task: TaskId, user: UserId) -> Result<TaskExecution> {
        self.tasks.start_execution(task, user).await
    }

    pub async fn submit_execution(
        &self,
        execution: ExecutionId,
        user: UserId,
        evidence: Evidence,
    ) -> Result<TaskExecution> {
        self.tasks.submit_execution(execution, user, evidence).await
    }

    pub async fn resolve_execution(
        &self,
        execution: ExecutionId,
        resolution: Resolution,
    ) -> Result<TaskExecution> {
        self.tasks.resolve_execution(execution, resolution).await
    }

    pub async fn moderate(
        &self,
        moderator: UserId,
        execution: ExecutionId,
        approve: bool,
        reason: Option<String>,
    ) -> Result<TaskExecution> {
        self.tasks
            .moderate(moderator, execution, approve, reason)
            .await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.tasks.get_task(id).await
    }

    pub async fn get_execution(&self, id: ExecutionId) -> Result<TaskExecution> {
        self.tasks.get_execution(id).await
    }

    /// The execution `user` started on `task`.
    pub async fn execution_for(&self, task: TaskId, user: UserId) -> Result<TaskExecution> {
        self.tasks.execution_for(task, user).await
    }

    pub async fn tasks_for_author(&self, author: UserId) -> Result<Vec<Task>> {
        self.tasks.tasks_for_author(author).await
    }

    pub async fn executions_for_task(&self, task: TaskId) -> Result<Vec<TaskExecution>> {
        self.tasks.executions_for_task(task).await
    }

    pub async fn executions_for_user(&self, user: UserId) -> Result<Vec<TaskExecution>> {
        self.tasks.executions_for_user(user).await
    }

    // Checks

    pub async fn create_check(&self, creator: UserId, draft: NewCheck) -> Result<Check> {
        self.checks.create_check(creator, draft).await
    }

    pub async fn activate_check(
        &self,
        user: UserId,
        code: &str,
        password: Option<&str>,
    ) -> Result<Balance> {
        self.checks.activate_check(user, code, password).await
    }

    pub async fn cancel_check(&self, creator: UserId, check: CheckId) -> Result<Balance> {
        self.checks.cancel_check(creator, check).await
    }

    pub async fn get_check(&self, id: CheckId) -> Result<Check> {
        self.checks.get_check(id).await
    }

    pub async fn get_check_by_code(&self, code: &str) -> Result<Check> {
        self.checks.get_check_by_code(code).await
    }

    pub async fn checks_for_creator(&self, creator: UserId) -> Result<Vec<Check>> {
        self.checks.checks_for_creator(creator).await
    }

    pub async fn activations_for_check(&self, check: CheckId) -> Result<Vec<CheckActivation>> {
        self.checks.activations_for_check(check).await
    }

    // Verification

    pub fn spawn_workers(&self) -> WorkerPool {
        self.pipeline.spawn()
    }

    /// Processes every due verification job in the calling task.
    pub async fn drain_verifications(&self) -> Result<usize> {
        Ok(self.pipeline.drain().await?.len())
    }

    pub async fn jobs(&self) -> Result<Vec<VerificationJob>> {
        self.pipeline.jobs().await
    }

    // Maintenance

    pub async fn expire_executions(&self) -> Result<Vec<ExecutionId>> {
        self.tasks.expire_executions().await
    }

    pub async fn auto_approve_stale_reviews(&self) -> Result<Vec<ExecutionId>> {
        self.tasks.auto_approve_stale_reviews().await
    }

    pub async fn expire_tasks(&self) -> Result<Vec<TaskId>> {
        self.tasks.expire_tasks().await
    }

    pub async fn expire_checks(&self) -> Result<Vec<ExpiredCheck>> {
        self.checks.expire_checks().await
    }

    pub async fn reclaim_stalled(&self) -> Result<Vec<JobId>> {
        self.pipeline.reclaim_stalled().await
    }

    /// Runs every time-driven transition once.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let report = SweepReport {
            expired_executions: self.tasks.expire_executions().await?,
            approved_reviews: self.tasks.auto_approve_stale_reviews().await?,
            expired_tasks: self.tasks.expire_tasks().await?,
            expired_checks: self.checks.expire_checks().await?,
            reclaimed_jobs: self.pipeline.reclaim_stalled().await?,
        };
        info!(
            executions = report.expired_executions.len(),
            reviews = report.approved_reviews.len(),
            tasks = report.expired_tasks.len(),
            checks = report.expired_checks.len(),
            jobs = report.reclaimed_jobs.len(),
            "sweep finished"
        );
        Ok(report)
    }

    pub async fn supply_snapshot(&self) -> Result<SupplySnapshot> {
        audit::supply_snapshot(&self.store).await
    }

    pub async fn reconcile(&self, user: UserId) -> Result<Reconciliation> {
        audit::reconcile(&self.store, user).await
    }

    pub async fn reconcile_all(&self) -> Result<Vec<Reconciliation>> {
        audit::reconcile_all(&self.store).await
    }
}
