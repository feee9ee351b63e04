mod common;

use async_trait::async_trait;
use common::{amount, Harness, CHANNEL};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use taskmarket::application::marketplace::Marketplace;
use taskmarket::application::unit_of_work::keys;
use taskmarket::application::verification::{JobOutcome, EXHAUSTED_REASON, LEASE_EXHAUSTED_REASON};
use taskmarket::config::MarketConfig;
use taskmarket::domain::account::Balance;
use taskmarket::domain::clock::SystemClock;
use taskmarket::domain::job::JobStatus;
use taskmarket::domain::ports::{NotificationKind, StorageBackend, Table, Verdict, Verifier, WriteOp};
use taskmarket::domain::task::{ExecutionStatus, NewTask, TaskKind};
use taskmarket::domain::UserId;
use taskmarket::error::Result;
use taskmarket::infrastructure::in_memory::{InMemoryBackend, RecordingNotifier};

#[tokio::test]
async fn test_three_definite_failures_reject() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    let task = h.subscription_task(1, dec!(100), 2).await;
    let execution = h.submitted(&task, 2).await;
    assert_eq!(execution.status, ExecutionStatus::Pending);

    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Retrying]);
    // Not due again until the retry delay has passed.
    h.advance_minutes(29);
    assert!(h.market.pipeline().drain().await.unwrap().is_empty());
    h.advance_minutes(1);
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Retrying]);
    h.advance_minutes(30);
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Rejected]);

    let execution = h.market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Rejected);
    assert_eq!(execution.auto_check_attempts, 3);
    assert_eq!(execution.rejection_reason.as_deref(), Some(EXHAUSTED_REASON));
    assert_eq!(h.market.get_user_balance(2).await.unwrap().balance, Balance::ZERO);

    let jobs = h.market.jobs().await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::FailedFinal);
    assert_eq!(jobs[0].attempts, 3);
    assert!(!jobs[0].saw_error);

    let task = h.market.get_task(task.id).await.unwrap();
    assert_eq!(task.reserved_executions, 0);
    assert_eq!(task.available_slots(), 2);
}

#[tokio::test]
async fn test_undetermined_checks_escalate() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    h.verifier.mark_unreadable(CHANNEL).await;
    let task = h.subscription_task(1, dec!(100), 2).await;
    let execution = h.submitted(&task, 2).await;

    for _ in 0..2 {
        assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Retrying]);
        h.advance_minutes(30);
    }
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Escalated]);

    let execution = h.market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::InReview);
    assert_eq!(execution.auto_check_attempts, 3);
    assert!(execution.auto_check_result.unwrap().contains("not readable"));

    let escalations: Vec<_> = h
        .notifier
        .sent()
        .await
        .into_iter()
        .filter(|n| n.kind == NotificationKind::ExecutionEscalated)
        .collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].user, 1);

    // The author can still decide.
    h.market.moderate(1, execution.id, true, None).await.unwrap();
    assert_eq!(h.market.get_user_balance(2).await.unwrap().balance, Balance::new(dec!(100)));
}

#[tokio::test]
async fn test_one_error_among_failures_escalates() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    let task = h.subscription_task(1, dec!(10), 1).await;
    let execution = h.submitted(&task, 2).await;

    h.market.pipeline().drain().await.unwrap();
    h.verifier.mark_broken(CHANNEL).await;
    h.advance_minutes(30);
    h.market.pipeline().drain().await.unwrap();
    h.verifier.repair(CHANNEL).await;
    h.advance_minutes(30);
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Escalated]);

    let execution = h.market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::InReview);
    assert!(h.market.jobs().await.unwrap()[0].saw_error);
}

#[tokio::test]
async fn test_retry_succeeds_once_condition_holds() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    let task = h.subscription_task(1, dec!(100), 1).await;
    let execution = h.submitted(&task, 2).await;

    h.market.pipeline().drain().await.unwrap();
    h.verifier.grant_membership(2, CHANNEL).await;
    h.advance_minutes(30);
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Approved]);

    let execution = h.market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::AutoApproved);
    assert_eq!(execution.auto_check_attempts, 1);

    // Single execution task: completed and leftover commission refunded.
    let author = h.market.get_user_balance(1).await.unwrap();
    assert_eq!(author.balance, Balance::new(dec!(900)));
    assert_eq!(author.frozen_balance, Balance::ZERO);
    assert_eq!(h.market.get_user_balance(2).await.unwrap().balance, Balance::new(dec!(100)));
}

#[tokio::test]
async fn test_policies_per_kind() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;

    let view = h
        .market
        .create_task(1, NewTask::new(TaskKind::PostView, "https://t.me/news/42", amount(dec!(2)), 5))
        .await
        .unwrap();
    let bot = h
        .market
        .create_task(1, NewTask::new(TaskKind::BotStart, "@shop_bot", amount(dec!(2)), 5))
        .await
        .unwrap();
    let reaction = h
        .market
        .create_task(1, NewTask::new(TaskKind::PostReaction, "https://t.me/news/42", amount(dec!(2)), 5))
        .await
        .unwrap();
    h.verifier.grant_reaction(2, "https://t.me/news/42").await;

    let viewed = h.submitted(&view, 2).await;
    let started = h.submitted(&bot, 2).await;
    let reacted = h.submitted(&reaction, 2).await;
    let outcomes = h.market.pipeline().drain().await.unwrap();
    assert_eq!(
        outcomes,
        vec![JobOutcome::Approved, JobOutcome::Escalated, JobOutcome::Approved]
    );

    assert_eq!(h.market.get_execution(viewed.id).await.unwrap().status, ExecutionStatus::AutoApproved);
    assert_eq!(h.market.get_execution(started.id).await.unwrap().status, ExecutionStatus::InReview);
    assert_eq!(h.market.get_execution(reacted.id).await.unwrap().status, ExecutionStatus::AutoApproved);
    // Only the reaction needed the platform.
    assert_eq!(h.verifier.calls(), 1);
}

#[tokio::test]
async fn test_stalled_job_is_reclaimed_once() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    h.verifier.grant_membership(2, CHANNEL).await;
    let task = h.subscription_task(1, dec!(100), 1).await;
    let execution = h.submitted(&task, 2).await;

    // A worker claims the job and dies before finishing it.
    let abandoned = h.market.pipeline().claim_next().await.unwrap().unwrap();
    assert!(h.market.pipeline().claim_next().await.unwrap().is_none());

    h.advance_minutes(5);
    assert_eq!(h.market.pipeline().reclaim_stalled().await.unwrap(), vec![abandoned.id]);
    assert!(h.market.pipeline().reclaim_stalled().await.unwrap().is_empty());
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Approved]);

    let job = h.market.pipeline().job(abandoned.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.reclaims, 1);

    // The original worker coming back cannot apply its result twice.
    let late = h.market.pipeline().process(abandoned).await.unwrap();
    assert_eq!(late, JobOutcome::Superseded);
    assert_eq!(
        h.market.get_execution(execution.id).await.unwrap().status,
        ExecutionStatus::AutoApproved
    );
    assert_eq!(h.market.get_user_balance(2).await.unwrap().balance, Balance::new(dec!(100)));
}

#[tokio::test]
async fn test_job_that_keeps_stalling_is_given_up() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    h.verifier.grant_membership(2, CHANNEL).await;
    let task = h.subscription_task(1, dec!(100), 1).await;
    let execution = h.submitted(&task, 2).await;

    // Every worker that claims the job dies holding it.
    let first = h.market.pipeline().claim_next().await.unwrap().unwrap();
    for reclaims in 1..=3 {
        h.advance_minutes(5);
        let job = h.market.pipeline().claim_next().await.unwrap().unwrap();
        assert_eq!(job.reclaims, reclaims);
    }
    h.advance_minutes(5);
    assert!(h.market.pipeline().claim_next().await.unwrap().is_none());

    let job = h.market.pipeline().job(first.id).await.unwrap();
    assert_eq!(job.status, JobStatus::FailedFinal);
    assert_eq!(job.last_error.as_deref(), Some(LEASE_EXHAUSTED_REASON));
    let execution = h.market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::InReview);
    assert!(h.market.pipeline().reclaim_stalled().await.unwrap().is_empty());
    assert!(h.market.pipeline().drain().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unappliable_approval_fails_job_and_escalates() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    h.verifier.grant_membership(2, CHANNEL).await;
    let task = h.subscription_task(1, dec!(100), 1).await;
    let execution = h.submitted(&task, 2).await;

    // The executor's account row vanishes, so the payout can never be written.
    h.backend
        .apply(vec![WriteOp::Delete {
            table: Table::Accounts,
            key: keys::user(2),
        }])
        .await
        .unwrap();

    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Abandoned]);
    assert!(h.market.pipeline().drain().await.unwrap().is_empty());

    let jobs = h.market.jobs().await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::FailedFinal);
    assert!(jobs[0].last_error.is_some());
    let execution = h.market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::InReview);
    assert_eq!(execution.auto_check_result, jobs[0].last_error);

    // Nothing from the failed approval was kept.
    let task = h.market.get_task(task.id).await.unwrap();
    assert_eq!(task.remaining_executions, 1);
    assert_eq!(task.frozen_amount, Balance::new(dec!(110)));
    assert!(task.escrow_balanced());
    let kinds: Vec<_> = h.notifier.sent().await.into_iter().map(|n| n.kind).collect();
    assert!(kinds.contains(&NotificationKind::ExecutionEscalated));
    assert!(!kinds.contains(&NotificationKind::ExecutionApproved));
}

#[tokio::test]
async fn test_job_for_decided_execution_is_obsolete() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.funded(2, dec!(0)).await;
    let task = h.subscription_task(1, dec!(100), 2).await;
    let execution = h.submitted(&task, 2).await;

    h.market.moderate(1, execution.id, false, None).await.unwrap();
    assert_eq!(h.market.pipeline().drain().await.unwrap(), vec![JobOutcome::Obsolete]);
    assert_eq!(h.verifier.calls(), 0);
}

#[tokio::test]
async fn test_worker_pool_processes_jobs() {
    let h = Harness::new();
    h.funded(1, dec!(1000)).await;
    h.verifier.grant_membership(2, CHANNEL).await;
    h.verifier.grant_membership(3, CHANNEL).await;
    h.funded(2, dec!(0)).await;
    h.funded(3, dec!(0)).await;
    let task = h.subscription_task(1, dec!(10), 2).await;

    let pool = h.market.spawn_workers();
    assert_eq!(pool.worker_count(), 4);
    h.submitted(&task, 2).await;
    h.submitted(&task, 3).await;

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let task = h.market.get_task(task.id).await.unwrap();
            if task.remaining_executions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    pool.shutdown().await;

    assert!(done.is_ok(), "workers did not finish in time");
    assert_eq!(h.market.get_user_balance(2).await.unwrap().balance, Balance::new(dec!(10)));
    assert_eq!(h.market.get_user_balance(3).await.unwrap().balance, Balance::new(dec!(10)));
}

struct HangingVerifier;

#[async_trait]
impl Verifier for HangingVerifier {
    async fn check_membership(&self, _user: UserId, _target: &str) -> Result<Verdict> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Verdict::Satisfied)
    }

    async fn check_reaction(&self, user: UserId, target: &str) -> Result<Verdict> {
        self.check_membership(user, target).await
    }
}

#[tokio::test]
async fn test_verifier_timeout_counts_as_error() {
    let mut config = MarketConfig::default();
    config.verification.verifier_timeout_secs = 1;
    config.verification.max_attempts = 1;
    let market = Marketplace::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(HangingVerifier),
        Arc::new(RecordingNotifier::new()),
        Arc::new(SystemClock),
        config,
    );
    market.open_account(1, Default::default()).await.unwrap();
    market.open_account(2, Default::default()).await.unwrap();
    market.deposit(1, amount(dec!(100))).await.unwrap();
    let task = market
        .create_task(1, NewTask::new(TaskKind::GroupJoin, "@chatters", amount(dec!(10)), 1))
        .await
        .unwrap();
    let execution = market.start_execution(task.id, 2).await.unwrap();
    market
        .submit_execution(execution.id, 2, Default::default())
        .await
        .unwrap();

    assert_eq!(market.pipeline().drain().await.unwrap(), vec![JobOutcome::Escalated]);
    let execution = market.get_execution(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::InReview);
    assert_eq!(execution.auto_check_result.as_deref(), Some("verifier timed out"));
}
