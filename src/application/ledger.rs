use super::unit_of_work::{Store, UnitOfWork};
use crate::domain::UserId;
use crate::domain::account::{Account, Amount, Balance, UserTier};
use crate::domain::clock::ClockRef;
use crate::domain::ledger::{AdjustRequest, EntryKind, LedgerEntry, LedgerReason};
use crate::error::{MarketError, Result};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

/// Owner of account balances and the append-only ledger.
///
/// Every balance mutation in the system goes through [`Ledger::adjust`], which writes
/// exactly one [`LedgerEntry`] in the same unit of work as the balance change.
#[derive(Clone)]
pub struct Ledger {
    store: Store,
    clock: ClockRef,
}

impl Ledger {
    pub fn new(store: Store, clock: ClockRef) -> Self {
        Self { store, clock }
    }

    /// Applies `balance += amount` and `frozen += frozen_delta` inside `uow`.
    ///
    /// Fails with `InsufficientFunds` if either side would go negative, with
    /// `ValidationError` if a running total would overflow and with
    /// `AccountNotFound` if the account does not exist. Nothing is staged on failure.
    #[instrument(skip(self, uow), fields(account = request.account, reason = ?request.reason))]
    pub async fn adjust(&self, uow: &mut UnitOfWork, request: AdjustRequest) -> Result<Account> {
        if request.amount.is_zero() && request.frozen_delta.is_zero() {
            return Err(MarketError::validation("adjustment moves no funds"));
        }

        let mut account = uow
            .account(request.account)
            .await?
            .ok_or(MarketError::AccountNotFound(request.account))?;

        let balance_before = account.balance;
        let frozen_before = account.frozen_balance;
        let balance_after = add(balance_before, request.amount)?;
        let frozen_after = add(frozen_before, request.frozen_delta)?;

        if balance_after.is_negative() {
            return Err(MarketError::InsufficientFunds {
                needed: -request.amount,
                available: balance_before.value(),
            });
        }
        if frozen_after.is_negative() {
            return Err(MarketError::InsufficientFunds {
                needed: -request.frozen_delta,
                available: frozen_before.value(),
            });
        }

        if request.reason.is_earning() && request.amount > Decimal::ZERO {
            account.total_earned = add(account.total_earned, request.amount)?;
        }
        account.total_spent = add(
            account.total_spent,
            request.reason.spent_delta(request.amount),
        )?;
        account.balance = balance_after;
        account.frozen_balance = frozen_after;

        let entry = LedgerEntry {
            id: uow.next_id("ledger").await?,
            account: request.account,
            kind: EntryKind::classify(request.amount, request.frozen_delta),
            reason: request.reason,
            amount: request.amount,
            frozen_delta: request.frozen_delta,
            balance_before,
            balance_after,
            frozen_before,
            frozen_after,
            related_task: request.related_task,
            related_check: request.related_check,
            created_at: self.clock.now(),
        };
        uow.append_entry(&entry)?;
        uow.save_account(&account)?;

        debug!(
            entry = entry.id,
            kind = ?entry.kind,
            amount = %request.amount,
            frozen_delta = %request.frozen_delta,
            balance_after = %balance_after,
            frozen_after = %frozen_after,
            "ledger adjusted"
        );
        Ok(account)
    }

    /// Runs a single adjustment in its own unit of work.
    pub async fn adjust_atomic(&self, request: AdjustRequest) -> Result<Account> {
        let mut uow = self.store.begin().await;
        let account = self.adjust(&mut uow, request).await?;
        uow.commit().await?;
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn open_account(&self, user: UserId, tier: UserTier) -> Result<Account> {
        let mut uow = self.store.begin().await;
        let account = Account::new(user, tier, self.clock.now());
        uow.insert_account(&account)
            .await
            .map_err(|err| match err {
                MarketError::UniqueViolation(_) => MarketError::AccountExists(user),
                other => other,
            })?;
        uow.commit().await?;
        debug!(user, "account opened");
        Ok(account)
    }

    pub async fn set_tier(&self, user: UserId, tier: UserTier) -> Result<Account> {
        let mut uow = self.store.begin().await;
        let mut account = uow
            .account(user)
            .await?
            .ok_or(MarketError::AccountNotFound(user))?;
        account.tier = tier;
        uow.save_account(&account)?;
        uow.commit().await?;
        Ok(account)
    }

    /// Credits funds entering the system from outside.
    pub async fn deposit(&self, user: UserId, amount: Amount) -> Result<Account> {
        self.adjust_atomic(AdjustRequest::new(
            user,
            amount.value(),
            Decimal::ZERO,
            LedgerReason::Deposit,
        ))
        .await
    }

    /// Debits funds leaving the system.
    pub async fn withdraw(&self, user: UserId, amount: Amount) -> Result<Account> {
        self.adjust_atomic(AdjustRequest::new(
            user,
            -amount.value(),
            Decimal::ZERO,
            LedgerReason::Withdrawal,
        ))
        .await
    }

    pub async fn account(&self, user: UserId) -> Result<Account> {
        self.store
            .read()
            .account(user)
            .await?
            .ok_or(MarketError::AccountNotFound(user))
    }

    pub async fn history(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        self.store.read().entries(user).await
    }
}

fn add(total: Balance, delta: Decimal) -> Result<Balance> {
    total
        .checked_add(Balance::new(delta))
        .ok_or_else(|| MarketError::validation("amount overflows the account balance"))
}
