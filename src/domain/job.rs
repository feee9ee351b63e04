use super::task::TaskKind;
use super::{ExecutionId, JobId, TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    /// Waiting for `not_before` before the next attempt.
    FailedRetryable,
    FailedFinal,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedFinal)
    }
}

/// A durable verification request for one submitted execution.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct VerificationJob {
    pub id: JobId,
    pub execution: ExecutionId,
    pub task: TaskId,
    pub user: UserId,
    pub kind: TaskKind,
    pub target: String,
    pub status: JobStatus,
    pub attempts: u32,
    /// Set once any attempt ended undetermined or with a verifier error.
    pub saw_error: bool,
    pub not_before: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reclaims: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationJob {
    /// Whether a worker may pick this job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued | JobStatus::FailedRetryable => self.not_before <= now,
            _ => false,
        }
    }

    /// A running job whose worker stopped renewing its lease.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(status: JobStatus) -> VerificationJob {
        let now = Utc::now();
        VerificationJob {
            id: 1,
            execution: 1,
            task: 1,
            user: 1,
            kind: TaskKind::GroupJoin,
            target: "@group".into(),
            status,
            attempts: 0,
            saw_error: false,
            not_before: now,
            lease_expires_at: None,
            reclaims: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_due_and_stalled() {
        let mut retry = job(JobStatus::FailedRetryable);
        retry.not_before = retry.created_at + Duration::minutes(30);
        assert!(!retry.is_due(retry.created_at));
        assert!(retry.is_due(retry.created_at + Duration::minutes(30)));

        let mut running = job(JobStatus::Running);
        running.lease_expires_at = Some(running.created_at + Duration::minutes(5));
        assert!(!running.is_due(running.created_at));
        assert!(!running.is_stalled(running.created_at));
        assert!(running.is_stalled(running.created_at + Duration::minutes(5)));
        assert!(JobStatus::FailedFinal.is_terminal());
    }
}
