use super::ledger::Ledger;
use super::outbox::Outbox;
use super::tasks::validate_target;
use super::unit_of_work::{Store, UnitOfWork};
use crate::config::CheckRules;
use crate::domain::account::Balance;
use crate::domain::check::{Check, CheckActivation, CheckType, NewCheck};
use crate::domain::clock::ClockRef;
use crate::domain::ledger::{AdjustRequest, LedgerReason};
use crate::domain::ports::{NotificationKind, NotificationSinkRef, Verdict, VerifierRef};
use crate::domain::task::TaskKind;
use crate::domain::{CheckId, UserId};
use crate::error::{MarketError, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Duration;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

/// Upper-case letters and digits without the easily confused `0`, `O`, `1` and `I`.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_ATTEMPTS: usize = 8;

/// One check closed by [`CheckEngine::expire_checks`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiredCheck {
    pub check: CheckId,
    pub creator: UserId,
    pub refunded: Balance,
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| MarketError::Storage(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| MarketError::Storage(format!("invalid password hash format: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Gift checks: funding, redemption and expiry.
#[derive(Clone)]
pub struct CheckEngine {
    store: Store,
    ledger: Ledger,
    verifier: VerifierRef,
    notifier: NotificationSinkRef,
    clock: ClockRef,
    rules: CheckRules,
}

impl CheckEngine {
    pub fn new(
        store: Store,
        ledger: Ledger,
        verifier: VerifierRef,
        notifier: NotificationSinkRef,
        clock: ClockRef,
        rules: CheckRules,
    ) -> Self {
        Self {
            store,
            ledger,
            verifier,
            notifier,
            clock,
            rules,
        }
    }

    fn validate(&self, draft: &NewCheck) -> Result<Decimal> {
        let total = draft.total_amount.value();
        if total < self.rules.min_amount || total > self.rules.max_amount {
            return Err(MarketError::validation(format!(
                "check amount must be between {} and {}",
                self.rules.min_amount, self.rules.max_amount
            )));
        }
        match draft.check_type {
            CheckType::Personal if draft.max_activations != 1 => {
                return Err(MarketError::validation(
                    "personal checks have exactly one activation",
                ));
            }
            CheckType::Multi
                if draft.max_activations < 2 || draft.max_activations > self.rules.max_activations =>
            {
                return Err(MarketError::validation(format!(
                    "multi checks need between 2 and {} activations",
                    self.rules.max_activations
                )));
            }
            CheckType::Multi if draft.target_user.is_some() => {
                return Err(MarketError::validation(
                    "only personal checks can be addressed to a user",
                ));
            }
            _ => {}
        }

        let per_activation = Check::split(total, draft.max_activations);
        if per_activation < self.rules.min_per_activation {
            return Err(MarketError::validation(format!(
                "each activation must pay at least {}",
                self.rules.min_per_activation
            )));
        }
        if let Some(password) = &draft.password {
            let len = password.chars().count();
            if len < self.rules.password_min_len || len > self.rules.password_max_len {
                return Err(MarketError::validation(format!(
                    "password must be {} to {} characters",
                    self.rules.password_min_len, self.rules.password_max_len
                )));
            }
        }
        if let Some(ttl) = draft.ttl_hours
            && (ttl == 0 || ttl > self.rules.max_ttl_hours)
        {
            return Err(MarketError::validation(format!(
                "check lifetime must be between 1 and {} hours",
                self.rules.max_ttl_hours
            )));
        }
        Ok(per_activation)
    }

    #[instrument(skip(self, draft), fields(check_type = ?draft.check_type, activations = draft.max_activations))]
    pub async fn create_check(&self, creator: UserId, draft: NewCheck) -> Result<Check> {
        let per_activation = self.validate(&draft)?;
        let required_subscription = draft
            .required_subscription
            .as_deref()
            .map(|target| validate_target(TaskKind::ChannelSubscription, target))
            .transpose()?;
        let password_hash = draft.password.as_deref().map(hash_password).transpose()?;

        let now = self.clock.now();
        let total = draft.total_amount.value();
        let mut uow = self.store.begin().await;
        let id = uow.next_id("checks").await?;
        self.ledger
            .adjust(
                &mut uow,
                AdjustRequest::new(creator, -total, Decimal::ZERO, LedgerReason::CheckFunding)
                    .for_check(id),
            )
            .await?;

        let code = self.unused_code(&uow).await?;
        let check = Check {
            id,
            creator,
            code,
            check_type: draft.check_type,
            total_amount: Balance::new(total),
            amount_per_activation: Balance::new(per_activation),
            max_activations: draft.max_activations,
            current_activations: 0,
            password_hash,
            target_user: draft.target_user,
            required_subscription,
            description: draft.description,
            created_at: now,
            expires_at: draft
                .ttl_hours
                .map(|ttl| now + Duration::hours(i64::from(ttl))),
            is_active: true,
            refunded_amount: Balance::ZERO,
        };
        uow.insert_check(&check).await?;
        uow.commit().await?;

        info!(check = check.id, creator, total = %total, "check created");
        Ok(check)
    }

    async fn unused_code(&self, uow: &UnitOfWork) -> Result<String> {
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_code(self.rules.code_length);
            if uow.check_by_code(&code).await?.is_none() {
                return Ok(code);
            }
            debug!("check code collision, retrying");
        }
        Err(MarketError::Storage(
            "could not allocate a unique check code".to_string(),
        ))
    }

    /// Redeems one activation of the check behind `code` and returns the credited amount.
    ///
    /// The subscription lookup and the password hash comparison run before the unit
    /// of work opens. Both only read fields that never change after creation.
    #[instrument(skip(self, password))]
    pub async fn activate_check(
        &self,
        user: UserId,
        code: &str,
        password: Option<&str>,
    ) -> Result<Balance> {
        let snapshot = self
            .store
            .read()
            .check_by_code(code)
            .await?
            .ok_or_else(|| MarketError::not_found("check", Check::normalize_code(code)))?;

        if let Some(channel) = &snapshot.required_subscription {
            let verdict = self.verifier.check_membership(user, channel).await?;
            match verdict {
                Verdict::Satisfied => {}
                Verdict::NotSatisfied => {
                    return Err(MarketError::SubscriptionRequired(channel.clone()));
                }
                Verdict::Undetermined(reason) => return Err(MarketError::Verifier(reason)),
            }
        }
        let password_ok = match (&snapshot.password_hash, password) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(hash), Some(candidate)) => {
                let hash = hash.clone();
                let candidate = candidate.to_string();
                tokio::task::spawn_blocking(move || verify_password(&candidate, &hash))
                    .await
                    .map_err(|e| MarketError::Storage(format!("password check aborted: {e}")))??
            }
        };

        let now = self.clock.now();
        let mut uow = self.store.begin().await;
        let mut check = uow.require_check(snapshot.id).await?;
        if !check.is_active {
            return Err(if check.is_exhausted() {
                MarketError::NoActivationsRemaining(check.id)
            } else if check.is_past_expiry(now) {
                MarketError::CheckExpired(check.id)
            } else {
                MarketError::CheckInactive(check.id)
            });
        }
        if check.is_past_expiry(now) {
            return Err(MarketError::CheckExpired(check.id));
        }
        if check.is_exhausted() {
            return Err(MarketError::NoActivationsRemaining(check.id));
        }
        if check.target_user.is_some_and(|target| target != user) {
            return Err(MarketError::NotForYou(check.id));
        }

        let amount = check.amount_per_activation;
        let activation = CheckActivation {
            id: uow.next_id("activations").await?,
            check: check.id,
            user,
            amount,
            activated_at: now,
        };
        uow.insert_activation(&activation)
            .await
            .map_err(|err| match err {
                MarketError::UniqueViolation(_) => MarketError::AlreadyActivated(check.id),
                other => other,
            })?;
        if !password_ok {
            return Err(MarketError::InvalidPassword);
        }

        self.ledger
            .adjust(
                &mut uow,
                AdjustRequest::new(
                    user,
                    amount.value(),
                    Decimal::ZERO,
                    LedgerReason::CheckRedemption,
                )
                .for_check(check.id),
            )
            .await?;
        check.current_activations += 1;
        if check.is_exhausted() {
            check.is_active = false;
            let dust = check.escrow();
            self.refund(&mut uow, &mut check, dust).await?;
        }
        uow.save_check(&check)?;
        uow.commit().await?;

        info!(check = check.id, user, amount = %amount, "check activated");
        let mut outbox = Outbox::new();
        outbox.push(
            check.creator,
            NotificationKind::CheckActivated,
            json!({ "check": check.id, "user": user, "amount": amount }),
        );
        outbox.deliver(&self.notifier).await;
        Ok(amount)
    }

    async fn refund(&self, uow: &mut UnitOfWork, check: &mut Check, amount: Balance) -> Result<()> {
        if amount <= Balance::ZERO {
            return Ok(());
        }
        self.ledger
            .adjust(
                uow,
                AdjustRequest::new(
                    check.creator,
                    amount.value(),
                    Decimal::ZERO,
                    LedgerReason::CheckRefund,
                )
                .for_check(check.id),
            )
            .await?;
        check.refunded_amount += amount;
        debug!(check = check.id, refunded = %amount, "check escrow refunded");
        Ok(())
    }

    /// Deactivates overdue checks and refunds what they still hold. Safe to rerun.
    #[instrument(skip(self))]
    pub async fn expire_checks(&self) -> Result<Vec<ExpiredCheck>> {
        let now = self.clock.now();
        let candidates = self.store.read().active_checks().await?;
        let mut report = Vec::new();

        for candidate in candidates.into_iter().filter(|c| c.is_past_expiry(now)) {
            let mut uow = self.store.begin().await;
            let mut check = uow.require_check(candidate.id).await?;
            if !check.is_active {
                continue;
            }
            check.is_active = false;
            let refunded = check.escrow();
            if let Err(err) = self.refund(&mut uow, &mut check, refunded).await {
                warn!(check = check.id, error = %err, "could not expire check");
                continue;
            }
            uow.save_check(&check)?;
            uow.commit().await?;

            let mut outbox = Outbox::new();
            outbox.push(
                check.creator,
                NotificationKind::CheckExpired,
                json!({ "check": check.id, "refunded": refunded }),
            );
            outbox.deliver(&self.notifier).await;
            info!(check = check.id, refunded = %refunded, "check expired");
            report.push(ExpiredCheck {
                check: check.id,
                creator: check.creator,
                refunded,
            });
        }
        Ok(report)
    }

    /// Closes an active check early and returns the refunded amount.
    pub async fn cancel_check(&self, creator: UserId, check_id: CheckId) -> Result<Balance> {
        let mut uow = self.store.begin().await;
        let mut check = uow.require_check(check_id).await?;
        if check.creator != creator {
            return Err(MarketError::validation(
                "only the creator may cancel a check",
            ));
        }
        if !check.is_active {
            return Err(MarketError::CheckInactive(check_id));
        }
        check.is_active = false;
        let refunded = check.escrow();
        self.refund(&mut uow, &mut check, refunded).await?;
        uow.save_check(&check)?;
        uow.commit().await?;
        info!(check = check_id, refunded = %refunded, "check cancelled");
        Ok(refunded)
    }

    pub async fn get_check(&self, id: CheckId) -> Result<Check> {
        self.store.read().require_check(id).await
    }

    pub async fn get_check_by_code(&self, code: &str) -> Result<Check> {
        self.store
            .read()
            .check_by_code(code)
            .await?
            .ok_or_else(|| MarketError::not_found("check", Check::normalize_code(code)))
    }

    pub async fn checks_for_creator(&self, creator: UserId) -> Result<Vec<Check>> {
        self.store.read().checks_by_creator(creator).await
    }

    pub async fn activations_for_check(&self, check: CheckId) -> Result<Vec<CheckActivation>> {
        self.store.read().activations_for_check(check).await
    }
}
