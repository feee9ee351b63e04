//! Durable verification jobs and the worker pool that drains them.
//!
//! Jobs are persisted in the same unit of work as the submission that creates them,
//! so a crash never loses one. Workers claim jobs under a lease; a job whose lease
//! runs out is handed to the next claimer. Verifier calls happen outside any unit of
//! work, and every outcome is applied through `TaskEngine::resolve_execution_in` or
//! `TaskEngine::escalate_in`, which refuse to touch an execution twice.
//!
//! A job whose outcome cannot be applied, or whose lease keeps running out, is
//! failed for good and its execution goes to manual review.

use super::outbox::Outbox;
use super::tasks::TaskEngine;
use super::unit_of_work::{Store, UnitOfWork};
use crate::config::{VerificationConfig, VerificationPolicy};
use crate::domain::clock::ClockRef;
use crate::domain::job::{JobStatus, VerificationJob};
use crate::domain::ports::{NotificationSinkRef, Verdict, VerifierRef};
use crate::domain::task::{ApprovalSource, ExecutionStatus, Resolution, Task, TaskExecution, TaskKind};
use crate::domain::JobId;
use crate::error::{MarketError, Result};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const EXHAUSTED_REASON: &str = "auto-check exhausted";
pub const LEASE_EXHAUSTED_REASON: &str = "verification lease expired too often";

/// Producer side of the job queue.
#[derive(Clone)]
pub struct JobQueue {
    clock: ClockRef,
    wake: Arc<Notify>,
}

impl JobQueue {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Stages a job for `execution` in the caller's unit of work.
    pub async fn enqueue(
        &self,
        uow: &mut UnitOfWork,
        task: &Task,
        execution: &TaskExecution,
    ) -> Result<VerificationJob> {
        let now = self.clock.now();
        let job = VerificationJob {
            id: uow.next_id("jobs").await?,
            execution: execution.id,
            task: task.id,
            user: execution.user,
            kind: task.kind,
            target: task.target.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            saw_error: false,
            not_before: now,
            lease_expires_at: None,
            reclaims: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        uow.insert_job(&job).await?;
        Ok(job)
    }

    /// Nudges idle workers after a commit that queued work.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }
}

/// What a single observation concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observation {
    Passed,
    NotPassed(String),
    /// Undetermined verdicts, verifier errors and timeouts.
    Errored(String),
    NeedsReview,
}

/// Result of processing one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Approved,
    Rejected,
    Escalated,
    /// Failed attempt with attempts left; the job waits for its retry delay.
    Retrying,
    /// The execution was already decided elsewhere.
    Obsolete,
    /// The lease was lost to another worker before the result could be applied.
    Superseded,
    /// The outcome could not be applied. The job failed for good and its execution
    /// waits for manual review.
    Abandoned,
}

#[derive(Clone)]
pub struct VerificationPipeline {
    store: Store,
    tasks: TaskEngine,
    queue: JobQueue,
    verifier: VerifierRef,
    notifier: NotificationSinkRef,
    clock: ClockRef,
    config: VerificationConfig,
}

impl VerificationPipeline {
    pub fn new(
        store: Store,
        tasks: TaskEngine,
        queue: JobQueue,
        verifier: VerifierRef,
        notifier: NotificationSinkRef,
        clock: ClockRef,
        config: VerificationConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            queue,
            verifier,
            notifier,
            clock,
            config,
        }
    }

    /// Claims the oldest due job, or a stalled one, under a fresh lease.
    ///
    /// Stalled jobs that already used up `max_reclaims` are given up on instead.
    pub async fn claim_next(&self) -> Result<Option<VerificationJob>> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await;
        let mut outbox = Outbox::new();
        let mut gave_up = 0;
        let mut claimed = None;
        for mut job in uow.queued_jobs().await? {
            let stalled = job.is_stalled(now);
            if !stalled && !job.is_due(now) {
                continue;
            }
            if stalled {
                if job.reclaims >= self.config.max_reclaims {
                    self.give_up_in(&mut uow, &mut job, LEASE_EXHAUSTED_REASON, &mut outbox)
                        .await?;
                    gave_up += 1;
                    continue;
                }
                job.reclaims += 1;
                warn!(job = job.id, reclaims = job.reclaims, "reclaiming stalled job");
            }
            job.status = JobStatus::Running;
            job.lease_expires_at = Some(now + self.config.lease());
            job.updated_at = now;
            uow.save_job(&job)?;
            claimed = Some(job);
            break;
        }
        if claimed.is_none() && gave_up == 0 {
            return Ok(None);
        }
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        if let Some(job) = &claimed {
            debug!(job = job.id, execution = job.execution, "job claimed");
        }
        Ok(claimed)
    }

    /// Requeues running jobs whose lease expired, or gives up on those reclaimed
    /// `max_reclaims` times already.
    #[instrument(skip(self))]
    pub async fn reclaim_stalled(&self) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await;
        let mut outbox = Outbox::new();
        let mut reclaimed = Vec::new();
        for mut job in uow.queued_jobs().await? {
            if !job.is_stalled(now) {
                continue;
            }
            if job.reclaims >= self.config.max_reclaims {
                self.give_up_in(&mut uow, &mut job, LEASE_EXHAUSTED_REASON, &mut outbox)
                    .await?;
                continue;
            }
            job.status = JobStatus::Queued;
            job.reclaims += 1;
            job.lease_expires_at = None;
            job.not_before = now;
            job.updated_at = now;
            uow.save_job(&job)?;
            reclaimed.push(job.id);
        }
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "stalled jobs requeued");
            self.queue.wake();
        }
        Ok(reclaimed)
    }

    async fn observe(&self, job: &VerificationJob) -> Observation {
        match self.config.policy_for(job.kind) {
            VerificationPolicy::Optimistic => return Observation::Passed,
            VerificationPolicy::Manual => return Observation::NeedsReview,
            VerificationPolicy::Automated => {}
        }

        let lookup = match job.kind {
            TaskKind::ChannelSubscription | TaskKind::GroupJoin => {
                self.verifier.check_membership(job.user, &job.target)
            }
            TaskKind::PostReaction => self.verifier.check_reaction(job.user, &job.target),
            TaskKind::PostView | TaskKind::BotStart => {
                return Observation::Errored(format!(
                    "{} cannot be observed automatically",
                    job.kind.as_str()
                ));
            }
        };
        match tokio::time::timeout(self.config.verifier_timeout(), lookup).await {
            Ok(Ok(Verdict::Satisfied)) => Observation::Passed,
            Ok(Ok(Verdict::NotSatisfied)) => {
                Observation::NotPassed("condition not satisfied".to_string())
            }
            Ok(Ok(Verdict::Undetermined(reason))) => Observation::Errored(reason),
            Ok(Err(err)) => Observation::Errored(err.to_string()),
            Err(_) => Observation::Errored("verifier timed out".to_string()),
        }
    }

    /// Runs one claimed job to its next state.
    #[instrument(skip(self, claimed), fields(job = claimed.id, execution = claimed.execution))]
    pub async fn process(&self, claimed: VerificationJob) -> Result<JobOutcome> {
        let pending = self
            .store
            .read()
            .execution(claimed.execution)
            .await?
            .is_some_and(|e| e.status == ExecutionStatus::Pending);
        let observation = if pending {
            self.observe(&claimed).await
        } else {
            Observation::Passed
        };

        let now = self.clock.now();
        let mut uow = self.store.begin().await;
        let mut job = uow
            .job(claimed.id)
            .await?
            .ok_or_else(|| MarketError::not_found("job", claimed.id))?;
        if !holds_lease(&job, &claimed) {
            debug!("lease lost, dropping result");
            return Ok(JobOutcome::Superseded);
        }
        job.updated_at = now;
        job.lease_expires_at = None;

        let mut outbox = Outbox::new();
        let applied = self.apply(&mut uow, &mut job, observation, &mut outbox).await;
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(err) => {
                drop(uow);
                return self.abandon(&claimed, err.to_string()).await;
            }
        };
        uow.save_job(&job)?;
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        debug!(?outcome, "job processed");
        Ok(outcome)
    }

    /// Stages the effect of `observation` on the job's execution.
    async fn apply(
        &self,
        uow: &mut UnitOfWork,
        job: &mut VerificationJob,
        observation: Observation,
        outbox: &mut Outbox,
    ) -> Result<JobOutcome> {
        let mut execution = uow.require_execution(job.execution).await?;
        if execution.status != ExecutionStatus::Pending {
            job.status = JobStatus::Succeeded;
            debug!(status = ?execution.status, "execution already decided");
            return Ok(JobOutcome::Obsolete);
        }

        let outcome = match observation {
            Observation::Passed => {
                let (_, notes) = self
                    .tasks
                    .resolve_execution_in(
                        uow,
                        execution.id,
                        Resolution::Approve(ApprovalSource::AutoCheck),
                    )
                    .await?;
                outbox.extend(notes);
                job.status = JobStatus::Succeeded;
                JobOutcome::Approved
            }
            Observation::NeedsReview => {
                let (_, notes) = self
                    .tasks
                    .escalate_in(uow, execution.id, "manual review required")
                    .await?;
                outbox.extend(notes);
                job.status = JobStatus::Succeeded;
                JobOutcome::Escalated
            }
            Observation::NotPassed(reason) => {
                self.record_failure(uow, job, &mut execution, reason, false, outbox)
                    .await?
            }
            Observation::Errored(reason) => {
                self.record_failure(uow, job, &mut execution, reason, true, outbox)
                    .await?
            }
        };
        Ok(outcome)
    }

    /// Fails a job whose outcome could not be applied, in a fresh unit of work.
    async fn abandon(&self, claimed: &VerificationJob, reason: String) -> Result<JobOutcome> {
        let mut uow = self.store.begin().await;
        let mut job = uow
            .job(claimed.id)
            .await?
            .ok_or_else(|| MarketError::not_found("job", claimed.id))?;
        if !holds_lease(&job, claimed) {
            return Ok(JobOutcome::Superseded);
        }
        let mut outbox = Outbox::new();
        self.give_up_in(&mut uow, &mut job, &reason, &mut outbox).await?;
        uow.commit().await?;
        outbox.deliver(&self.notifier).await;
        Ok(JobOutcome::Abandoned)
    }

    /// Marks `job` failed for good and escalates its execution if still pending.
    ///
    /// A failed escalation is logged and does not keep the job alive.
    async fn give_up_in(
        &self,
        uow: &mut UnitOfWork,
        job: &mut VerificationJob,
        reason: &str,
        outbox: &mut Outbox,
    ) -> Result<()> {
        error!(job = job.id, execution = job.execution, %reason, "giving up on verification job");
        job.status = JobStatus::FailedFinal;
        job.lease_expires_at = None;
        job.last_error = Some(reason.to_string());
        job.updated_at = self.clock.now();

        let pending = uow
            .execution(job.execution)
            .await?
            .is_some_and(|e| e.status == ExecutionStatus::Pending);
        if pending {
            match self.tasks.escalate_in(uow, job.execution, reason).await {
                Ok((_, notes)) => outbox.extend(notes),
                Err(err) => warn!(job = job.id, error = %err, "execution left pending"),
            }
        }
        uow.save_job(job)
    }

    /// Counts a failed attempt, then retries, rejects or escalates.
    ///
    /// A run of definite "not satisfied" answers rejects; any error along the way
    /// sends the execution to manual review instead.
    async fn record_failure(
        &self,
        uow: &mut UnitOfWork,
        job: &mut VerificationJob,
        execution: &mut TaskExecution,
        reason: String,
        errored: bool,
        outbox: &mut Outbox,
    ) -> Result<JobOutcome> {
        let now = self.clock.now();
        job.attempts += 1;
        job.saw_error |= errored;
        job.last_error = Some(reason.clone());
        execution.auto_check_attempts = job.attempts;
        execution.auto_check_result = Some(reason.clone());
        uow.save_execution(execution)?;

        if job.attempts < self.config.max_attempts {
            job.status = JobStatus::FailedRetryable;
            job.not_before = now + self.config.retry_delay();
            info!(attempts = job.attempts, %reason, "verification failed, will retry");
            return Ok(JobOutcome::Retrying);
        }

        job.status = JobStatus::FailedFinal;
        if job.saw_error {
            let (_, notes) = self.tasks.escalate_in(uow, execution.id, &reason).await?;
            outbox.extend(notes);
            Ok(JobOutcome::Escalated)
        } else {
            let (_, notes) = self
                .tasks
                .resolve_execution_in(uow, execution.id, Resolution::reject(EXHAUSTED_REASON))
                .await?;
            outbox.extend(notes);
            Ok(JobOutcome::Rejected)
        }
    }

    /// Claims and processes one job, if any is due.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        match self.claim_next().await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Processes jobs until none is due.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn job(&self, id: JobId) -> Result<VerificationJob> {
        self.store
            .read()
            .job(id)
            .await?
            .ok_or_else(|| MarketError::not_found("job", id))
    }

    pub async fn jobs(&self) -> Result<Vec<VerificationJob>> {
        self.store.read().jobs().await
    }

    /// Starts `worker_count` background workers.
    pub fn spawn(&self) -> WorkerPool {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(workers = self.config.worker_count, "starting verification workers");
        let workers = (0..self.config.worker_count)
            .map(|worker_id| {
                let pipeline = self.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { pipeline.worker_loop(worker_id, shutdown).await })
            })
            .collect();
        WorkerPool {
            shutdown: shutdown_tx,
            workers,
        }
    }

    async fn worker_loop(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let wake = self.queue.waker();
        let poll = self.config.poll_interval();
        debug!(worker_id, "verification worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => error!(worker_id, error = %err, "verification job failed"),
            }
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(worker_id, "verification worker stopped");
    }
}

fn holds_lease(current: &VerificationJob, claimed: &VerificationJob) -> bool {
    current.status == JobStatus::Running && current.reclaims == claimed.reclaims
}

/// Handle on running workers.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits for them to finish their current job.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "verification worker panicked");
            }
        }
        info!("verification workers stopped");
    }
}
