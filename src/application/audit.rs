//! Consistency checks over the ledger.
//!
//! Both audits run under the writer lock so they observe a single committed state.

use super::unit_of_work::Store;
use crate::domain::UserId;
use crate::domain::account::Balance;
use crate::error::{MarketError, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{instrument, warn};

/// Where every unit of money in the system currently sits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplySnapshot {
    pub accounts: usize,
    pub balance_total: Balance,
    pub frozen_total: Balance,
    /// Funds still held by checks.
    pub check_escrow: Balance,
    /// Funds still frozen by tasks. Must equal `frozen_total`.
    pub task_escrow: Balance,
    pub deposited: Balance,
    pub withdrawn: Balance,
}

impl SupplySnapshot {
    /// Money is neither created nor destroyed inside the system.
    pub fn is_conserved(&self) -> bool {
        let held = self
            .balance_total
            .checked_add(self.frozen_total)
            .and_then(|sum| sum.checked_add(self.check_escrow));
        held == Some(self.deposited - self.withdrawn) && self.task_escrow == self.frozen_total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub user: UserId,
    pub entries: usize,
    pub balance: Balance,
    pub frozen: Balance,
    pub ledger_balance: Balance,
    pub ledger_frozen: Balance,
    /// Every entry starts where the previous one ended.
    pub chain_intact: bool,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.chain_intact && self.balance == self.ledger_balance && self.frozen == self.ledger_frozen
    }
}

#[instrument(skip(store))]
pub async fn supply_snapshot(store: &Store) -> Result<SupplySnapshot> {
    let uow = store.begin().await;
    let accounts = uow.accounts().await?;

    let mut snapshot = SupplySnapshot {
        accounts: accounts.len(),
        balance_total: Balance::ZERO,
        frozen_total: Balance::ZERO,
        check_escrow: Balance::ZERO,
        task_escrow: Balance::ZERO,
        deposited: Balance::ZERO,
        withdrawn: Balance::ZERO,
    };
    for account in &accounts {
        tally(&mut snapshot.balance_total, account.balance)?;
        tally(&mut snapshot.frozen_total, account.frozen_balance)?;
        for entry in uow.entries(account.user).await? {
            if !entry.reason.is_external() {
                continue;
            }
            if entry.amount > Decimal::ZERO {
                tally(&mut snapshot.deposited, Balance::new(entry.amount))?;
            } else {
                tally(&mut snapshot.withdrawn, Balance::new(-entry.amount))?;
            }
        }
        for check in uow.checks_by_creator(account.user).await? {
            tally(&mut snapshot.check_escrow, check.escrow())?;
        }
        for task in uow.tasks_by_author(account.user).await? {
            if !task.escrow_balanced() {
                warn!(task = task.id, "task escrow does not add up");
            }
            tally(&mut snapshot.task_escrow, task.frozen_amount)?;
        }
    }
    if !snapshot.is_conserved() {
        warn!(?snapshot, "money supply is not conserved");
    }
    Ok(snapshot)
}

fn tally(total: &mut Balance, value: Balance) -> Result<()> {
    *total = total
        .checked_add(value)
        .ok_or_else(|| MarketError::validation("money supply exceeds the representable range"))?;
    Ok(())
}

/// Replays one account's ledger and compares it with the stored balances.
pub async fn reconcile(store: &Store, user: UserId) -> Result<Reconciliation> {
    let uow = store.begin().await;
    let account = uow
        .account(user)
        .await?
        .ok_or(MarketError::AccountNotFound(user))?;
    let entries = uow.entries(user).await?;

    let mut ledger_balance = Balance::ZERO;
    let mut ledger_frozen = Balance::ZERO;
    let mut chain_intact = true;
    for entry in &entries {
        chain_intact &= entry.balance_before == ledger_balance && entry.frozen_before == ledger_frozen;
        tally(&mut ledger_balance, Balance::new(entry.amount))?;
        tally(&mut ledger_frozen, Balance::new(entry.frozen_delta))?;
        chain_intact &= entry.balance_after == ledger_balance && entry.frozen_after == ledger_frozen;
    }

    Ok(Reconciliation {
        user,
        entries: entries.len(),
        balance: account.balance,
        frozen: account.frozen_balance,
        ledger_balance,
        ledger_frozen,
        chain_intact,
    })
}

/// Accounts whose ledger does not match their balances.
pub async fn reconcile_all(store: &Store) -> Result<Vec<Reconciliation>> {
    let users: Vec<UserId> = store
        .read()
        .accounts()
        .await?
        .into_iter()
        .map(|account| account.user)
        .collect();
    let mut mismatched = Vec::new();
    for user in users {
        let report = reconcile(store, user).await?;
        if !report.is_consistent() {
            warn!(user, ?report, "ledger mismatch");
            mismatched.push(report);
        }
    }
    Ok(mismatched)
}
