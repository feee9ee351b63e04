//! Explicit units of work over a [`StorageBackend`].
//!
//! A write unit of work holds the store-wide writer lock from `begin` until it is
//! committed or dropped, which makes every unit serializable. Writes are staged in
//! memory and handed to the backend as a single atomic batch on commit; dropping an
//! uncommitted unit discards them. Callers compose several ledger-affecting steps by
//! passing the same `&mut UnitOfWork` to each of them.
//!
//! [`Store::read`] takes no lock. Every row it loads is the latest committed value,
//! but a query touching several rows may see commits that land in between. Callers
//! needing one consistent state across rows read through `begin` instead.

use crate::domain::account::Account;
use crate::domain::check::{Check, CheckActivation};
use crate::domain::job::VerificationJob;
use crate::domain::ledger::LedgerEntry;
use crate::domain::ports::{StorageBackendRef, Table, WriteOp};
use crate::domain::task::{Task, TaskExecution, TaskStatus};
use crate::domain::{CheckId, ExecutionId, JobId, TaskId, UserId};
use crate::error::{MarketError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Order-preserving key encodings.
pub mod keys {
    use crate::domain::UserId;

    pub fn id(id: u64) -> Vec<u8> {
        id.to_be_bytes().to_vec()
    }

    /// Flips the sign bit so negative ids sort before positive ones.
    pub fn user(user: UserId) -> Vec<u8> {
        ((user as u64) ^ (1 << 63)).to_be_bytes().to_vec()
    }

    pub fn user_then_id(user: UserId, id: u64) -> Vec<u8> {
        let mut key = self::user(user);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    pub fn id_then_user(id: u64, user: UserId) -> Vec<u8> {
        let mut key = self::id(id);
        key.extend_from_slice(&self::user(user));
        key
    }

    /// Reads the trailing big-endian `u64` of a composite key.
    pub fn trailing_id(key: &[u8]) -> Option<u64> {
        let tail: [u8; 8] = key.get(key.len().checked_sub(8)?..)?.try_into().ok()?;
        Some(u64::from_be_bytes(tail))
    }
}

/// Handle on the persisted marketplace state.
#[derive(Clone)]
pub struct Store {
    backend: StorageBackendRef,
    writer: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: StorageBackendRef) -> Self {
        Self {
            backend,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Opens a write unit of work, waiting for any other writer to finish.
    pub async fn begin(&self) -> UnitOfWork {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        UnitOfWork {
            backend: Arc::clone(&self.backend),
            guard: Some(guard),
            staged: BTreeMap::new(),
        }
    }

    /// Opens a lock-free, read-only view. Committing staged writes through it fails.
    ///
    /// Each lookup sees the latest committed row on its own. Multi-row queries are
    /// not a point-in-time snapshot.
    pub fn read(&self) -> UnitOfWork {
        UnitOfWork {
            backend: Arc::clone(&self.backend),
            guard: None,
            staged: BTreeMap::new(),
        }
    }
}

pub struct UnitOfWork {
    backend: StorageBackendRef,
    guard: Option<OwnedMutexGuard<()>>,
    staged: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
}

impl UnitOfWork {
    pub fn is_writable(&self) -> bool {
        self.guard.is_some()
    }

    pub async fn commit(self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        if self.guard.is_none() {
            return Err(MarketError::Storage(
                "cannot commit writes through a read-only unit of work".to_string(),
            ));
        }
        let batch = self
            .staged
            .into_iter()
            .map(|((table, key), value)| match value {
                Some(value) => WriteOp::Put { table, key, value },
                None => WriteOp::Delete { table, key },
            })
            .collect();
        self.backend.apply(batch).await
    }

    /// Discards every staged write and releases the writer lock.
    pub fn rollback(self) {}

    async fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(table, key.to_vec())) {
            return Ok(staged.clone());
        }
        self.backend.get(table, key).await
    }

    async fn load<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(table, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.staged.insert((table, key), Some(bytes));
        Ok(())
    }

    fn mark(&mut self, table: Table, key: Vec<u8>) {
        self.staged.insert((table, key), Some(Vec::new()));
    }

    fn remove(&mut self, table: Table, key: Vec<u8>) {
        self.staged.insert((table, key), None);
    }

    async fn exists(&self, table: Table, key: &[u8]) -> Result<bool> {
        Ok(self.get_raw(table, key).await?.is_some())
    }

    /// Inserts a row whose key must not exist yet.
    async fn insert_unique<T: Serialize>(
        &mut self,
        table: Table,
        key: Vec<u8>,
        value: &T,
        constraint: &'static str,
    ) -> Result<()> {
        if self.exists(table, &key).await? {
            return Err(MarketError::UniqueViolation(constraint));
        }
        self.put(table, key, value)
    }

    async fn scan_raw(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .backend
            .scan_prefix(table, prefix)
            .await?
            .into_iter()
            .collect();
        for ((staged_table, key), value) in &self.staged {
            if *staged_table != table || !key.starts_with(prefix) {
                continue;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    async fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        self.scan_raw(table, prefix)
            .await?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(MarketError::from))
            .collect()
    }

    /// Ids stored as the trailing component of index keys.
    async fn scan_ids(&self, table: Table, prefix: &[u8]) -> Result<Vec<u64>> {
        Ok(self
            .scan_raw(table, prefix)
            .await?
            .into_iter()
            .filter_map(|(key, _)| keys::trailing_id(&key))
            .collect())
    }

    /// Allocates the next value of a named sequence, starting at 1.
    pub async fn next_id(&mut self, sequence: &str) -> Result<u64> {
        let key = sequence.as_bytes().to_vec();
        let current: u64 = self.load(Table::Sequences, &key).await?.unwrap_or(0);
        let next = current + 1;
        self.put(Table::Sequences, key, &next)?;
        Ok(next)
    }

    // Accounts and ledger

    pub async fn account(&self, user: UserId) -> Result<Option<Account>> {
        self.load(Table::Accounts, &keys::user(user)).await
    }

    pub async fn insert_account(&mut self, account: &Account) -> Result<()> {
        self.insert_unique(Table::Accounts, keys::user(account.user), account, "accounts.user")
            .await
    }

    pub fn save_account(&mut self, account: &Account) -> Result<()> {
        self.put(Table::Accounts, keys::user(account.user), account)
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.scan(Table::Accounts, &[]).await
    }

    pub fn append_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.put(
            Table::Ledger,
            keys::user_then_id(entry.account, entry.id),
            entry,
        )
    }

    /// Entries of one account, oldest first.
    pub async fn entries(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        self.scan(Table::Ledger, &keys::user(user)).await
    }

    // Tasks

    pub async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        self.load(Table::Tasks, &keys::id(id)).await
    }

    pub async fn require_task(&self, id: TaskId) -> Result<Task> {
        self.task(id)
            .await?
            .ok_or_else(|| MarketError::not_found("task", id))
    }

    pub async fn insert_task(&mut self, task: &Task) -> Result<()> {
        self.insert_unique(Table::Tasks, keys::id(task.id), task, "tasks.id")
            .await?;
        self.mark(Table::TasksByAuthor, keys::user_then_id(task.author, task.id));
        self.index_task_status(task);
        Ok(())
    }

    pub fn save_task(&mut self, task: &Task) -> Result<()> {
        self.put(Table::Tasks, keys::id(task.id), task)?;
        self.index_task_status(task);
        Ok(())
    }

    fn index_task_status(&mut self, task: &Task) {
        if task.status == TaskStatus::Active {
            self.mark(Table::ActiveTasks, keys::id(task.id));
        } else {
            self.remove(Table::ActiveTasks, keys::id(task.id));
        }
    }

    pub async fn tasks_by_author(&self, author: UserId) -> Result<Vec<Task>> {
        let ids = self.scan_ids(Table::TasksByAuthor, &keys::user(author)).await?;
        self.tasks_for_ids(ids).await
    }

    pub async fn active_tasks(&self) -> Result<Vec<Task>> {
        let ids = self.scan_ids(Table::ActiveTasks, &[]).await?;
        self.tasks_for_ids(ids).await
    }

    async fn tasks_for_ids(&self, ids: Vec<u64>) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            tasks.push(self.require_task(id).await?);
        }
        Ok(tasks)
    }

    // Executions

    pub async fn execution(&self, id: ExecutionId) -> Result<Option<TaskExecution>> {
        self.load(Table::Executions, &keys::id(id)).await
    }

    pub async fn require_execution(&self, id: ExecutionId) -> Result<TaskExecution> {
        self.execution(id)
            .await?
            .ok_or_else(|| MarketError::not_found("execution", id))
    }

    pub async fn execution_for(&self, task: TaskId, user: UserId) -> Result<Option<TaskExecution>> {
        let id: Option<ExecutionId> = self
            .load(Table::ExecutionKeys, &keys::id_then_user(task, user))
            .await?;
        match id {
            Some(id) => self.execution(id).await,
            None => Ok(None),
        }
    }

    /// Fails with `UniqueViolation` if the user already has an execution of the task.
    pub async fn insert_execution(&mut self, execution: &TaskExecution) -> Result<()> {
        self.insert_unique(
            Table::ExecutionKeys,
            keys::id_then_user(execution.task, execution.user),
            &execution.id,
            "executions.task_user",
        )
        .await?;
        self.put(Table::Executions, keys::id(execution.id), execution)?;
        self.mark(
            Table::ExecutionsByUser,
            keys::user_then_id(execution.user, execution.id),
        );
        self.index_execution_status(execution);
        Ok(())
    }

    pub fn save_execution(&mut self, execution: &TaskExecution) -> Result<()> {
        self.put(Table::Executions, keys::id(execution.id), execution)?;
        self.index_execution_status(execution);
        Ok(())
    }

    fn index_execution_status(&mut self, execution: &TaskExecution) {
        if execution.status.is_terminal() {
            self.remove(Table::OpenExecutions, keys::id(execution.id));
        } else {
            self.mark(Table::OpenExecutions, keys::id(execution.id));
        }
    }

    /// Pending and in-review executions, oldest first.
    pub async fn open_executions(&self) -> Result<Vec<TaskExecution>> {
        let ids = self.scan_ids(Table::OpenExecutions, &[]).await?;
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            executions.push(self.require_execution(id).await?);
        }
        Ok(executions)
    }

    pub async fn executions_for_task(&self, task: TaskId) -> Result<Vec<TaskExecution>> {
        let ids: Vec<ExecutionId> = self.scan(Table::ExecutionKeys, &keys::id(task)).await?;
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            executions.push(self.require_execution(id).await?);
        }
        executions.sort_by_key(|execution| execution.id);
        Ok(executions)
    }

    pub async fn executions_for_user(&self, user: UserId) -> Result<Vec<TaskExecution>> {
        let ids = self
            .scan_ids(Table::ExecutionsByUser, &keys::user(user))
            .await?;
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            executions.push(self.require_execution(id).await?);
        }
        Ok(executions)
    }

    // Checks

    pub async fn check(&self, id: CheckId) -> Result<Option<Check>> {
        self.load(Table::Checks, &keys::id(id)).await
    }

    pub async fn require_check(&self, id: CheckId) -> Result<Check> {
        self.check(id)
            .await?
            .ok_or_else(|| MarketError::not_found("check", id))
    }

    pub async fn check_by_code(&self, code: &str) -> Result<Option<Check>> {
        let id: Option<CheckId> = self
            .load(Table::CheckCodes, Check::normalize_code(code).as_bytes())
            .await?;
        match id {
            Some(id) => self.check(id).await,
            None => Ok(None),
        }
    }

    /// Fails with `UniqueViolation` if the code is taken.
    pub async fn insert_check(&mut self, check: &Check) -> Result<()> {
        self.insert_unique(
            Table::CheckCodes,
            Check::normalize_code(&check.code).into_bytes(),
            &check.id,
            "checks.code",
        )
        .await?;
        self.put(Table::Checks, keys::id(check.id), check)?;
        self.mark(
            Table::ChecksByCreator,
            keys::user_then_id(check.creator, check.id),
        );
        self.index_check_status(check);
        Ok(())
    }

    pub fn save_check(&mut self, check: &Check) -> Result<()> {
        self.put(Table::Checks, keys::id(check.id), check)?;
        self.index_check_status(check);
        Ok(())
    }

    fn index_check_status(&mut self, check: &Check) {
        if check.is_active {
            self.mark(Table::ActiveChecks, keys::id(check.id));
        } else {
            self.remove(Table::ActiveChecks, keys::id(check.id));
        }
    }

    pub async fn active_checks(&self) -> Result<Vec<Check>> {
        let ids = self.scan_ids(Table::ActiveChecks, &[]).await?;
        let mut checks = Vec::with_capacity(ids.len());
        for id in ids {
            checks.push(self.require_check(id).await?);
        }
        Ok(checks)
    }

    pub async fn checks_by_creator(&self, creator: UserId) -> Result<Vec<Check>> {
        let ids = self
            .scan_ids(Table::ChecksByCreator, &keys::user(creator))
            .await?;
        let mut checks = Vec::with_capacity(ids.len());
        for id in ids {
            checks.push(self.require_check(id).await?);
        }
        Ok(checks)
    }

    /// Fails with `UniqueViolation` if the user already redeemed the check.
    pub async fn insert_activation(&mut self, activation: &CheckActivation) -> Result<()> {
        self.insert_unique(
            Table::Activations,
            keys::id_then_user(activation.check, activation.user),
            activation,
            "activations.check_user",
        )
        .await
    }

    pub async fn activations_for_check(&self, check: CheckId) -> Result<Vec<CheckActivation>> {
        self.scan(Table::Activations, &keys::id(check)).await
    }

    // Verification jobs

    pub async fn job(&self, id: JobId) -> Result<Option<VerificationJob>> {
        self.load(Table::Jobs, &keys::id(id)).await
    }

    pub async fn insert_job(&mut self, job: &VerificationJob) -> Result<()> {
        self.insert_unique(Table::Jobs, keys::id(job.id), job, "jobs.id")
            .await?;
        self.mark(Table::JobQueue, keys::id(job.id));
        Ok(())
    }

    pub fn save_job(&mut self, job: &VerificationJob) -> Result<()> {
        self.put(Table::Jobs, keys::id(job.id), job)?;
        if job.status.is_terminal() {
            self.remove(Table::JobQueue, keys::id(job.id));
        } else {
            self.mark(Table::JobQueue, keys::id(job.id));
        }
        Ok(())
    }

    /// Non-terminal jobs in enqueue order.
    pub async fn queued_jobs(&self) -> Result<Vec<VerificationJob>> {
        let ids = self.scan_ids(Table::JobQueue, &[]).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.job(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn jobs(&self) -> Result<Vec<VerificationJob>> {
        self.scan(Table::Jobs, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::UserTier;
    use crate::infrastructure::in_memory::InMemoryBackend;
    use chrono::Utc;

    fn store() -> Store {
        Store::new(Arc::new(InMemoryBackend::new()))
    }

    #[test]
    fn test_key_ordering() {
        assert!(keys::user(-5) < keys::user(3));
        assert!(keys::id(2) < keys::id(10));
        assert_eq!(keys::trailing_id(&keys::user_then_id(7, 42)), Some(42));
        assert_eq!(keys::trailing_id(&[1, 2]), None);
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = store();
        let mut uow = store.begin().await;
        uow.insert_account(&Account::new(1, UserTier::Basic, Utc::now()))
            .await
            .unwrap();
        // Staged writes are visible inside the unit but not outside it.
        assert!(uow.account(1).await.unwrap().is_some());
        assert!(store.read().account(1).await.unwrap().is_none());
        uow.commit().await.unwrap();

        assert!(store.read().account(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = store();
        {
            let mut uow = store.begin().await;
            uow.insert_account(&Account::new(1, UserTier::Basic, Utc::now()))
                .await
                .unwrap();
            uow.rollback();
        }
        assert!(store.read().account(1).await.unwrap().is_none());
        assert_eq!(store.read().accounts().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unique_insert_rejects_duplicates() {
        let store = store();
        let mut uow = store.begin().await;
        let account = Account::new(9, UserTier::Basic, Utc::now());
        uow.insert_account(&account).await.unwrap();
        let err = uow.insert_account(&account).await.unwrap_err();
        assert!(matches!(err, MarketError::UniqueViolation("accounts.user")));
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic_and_transactional() {
        let store = store();
        let mut uow = store.begin().await;
        assert_eq!(uow.next_id("tasks").await.unwrap(), 1);
        assert_eq!(uow.next_id("tasks").await.unwrap(), 2);
        assert_eq!(uow.next_id("checks").await.unwrap(), 1);
        drop(uow);

        let mut uow = store.begin().await;
        assert_eq!(uow.next_id("tasks").await.unwrap(), 1);
        uow.commit().await.unwrap();
        let mut uow = store.begin().await;
        assert_eq!(uow.next_id("tasks").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_only_unit_refuses_writes() {
        let store = store();
        let mut uow = store.read();
        assert!(!uow.is_writable());
        uow.save_account(&Account::new(1, UserTier::Basic, Utc::now()))
            .unwrap();
        assert!(matches!(
            uow.commit().await,
            Err(MarketError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_merges_staged_deletes() {
        let store = store();
        let mut uow = store.begin().await;
        uow.mark(Table::ActiveTasks, keys::id(1));
        uow.mark(Table::ActiveTasks, keys::id(2));
        uow.commit().await.unwrap();

        let mut uow = store.begin().await;
        uow.remove(Table::ActiveTasks, keys::id(1));
        uow.mark(Table::ActiveTasks, keys::id(3));
        let ids = uow.scan_ids(Table::ActiveTasks, &[]).await.unwrap();
        assert_eq!(ids, vec![2, 3]);
    }
}
