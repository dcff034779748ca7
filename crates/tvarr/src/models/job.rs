//! Persisted job records and their per-attempt history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use ulid::Ulid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    StreamIngestion,
    EpgIngestion,
    ProxyGeneration,
    LogoCleanup,
    Backup,
}

impl JobKind {
    /// Deduplication key: at most one non-terminal job per (kind, target).
    pub fn job_key(&self, target_id: Option<Ulid>) -> String {
        match target_id {
            Some(id) => format!("{self}:{id}"),
            None => format!("{self}:-"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, never attempted.
    Pending,
    /// Waiting for a retry after a failed attempt.
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States a worker may claim from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

/// One persisted unit of work. Created by the scheduler (or an API trigger),
/// mutated only by the worker that claimed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Ulid,
    pub kind: JobKind,
    pub target_id: Option<Ulid>,
    pub status: JobStatus,
    pub next_run_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Name of the claiming worker; empty while unclaimed.
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Retry delay for the attempt that just failed: base · 2^(attempt−1),
    /// capped at one hour.
    pub fn retry_backoff(&self) -> Duration {
        let exponent = (self.attempt_count - 1).clamp(0, 30) as u32;
        let delay = self.base_backoff.saturating_mul(1u32 << exponent.min(12));
        delay.min(Duration::from_secs(3600))
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub id: Ulid,
    pub job_id: Ulid,
    pub kind: JobKind,
    pub target_id: Option<Ulid>,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_attempt(attempt: i32) -> Job {
        let now = Utc::now();
        Job {
            id: Ulid::new(),
            kind: JobKind::StreamIngestion,
            target_id: None,
            status: JobStatus::Running,
            next_run_at: now,
            attempt_count: attempt,
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            last_error: None,
            result: None,
            started_at: Some(now),
            finished_at: None,
            worker_id: "worker-0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(job_with_attempt(1).retry_backoff(), Duration::from_secs(1));
        assert_eq!(job_with_attempt(2).retry_backoff(), Duration::from_secs(2));
        assert_eq!(job_with_attempt(3).retry_backoff(), Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        let mut job = job_with_attempt(12);
        job.base_backoff = Duration::from_secs(600);
        assert_eq!(job.retry_backoff(), Duration::from_secs(3600));
    }

    #[test]
    fn job_key_dedupes_on_kind_and_target() {
        let target = Ulid::new();
        assert_eq!(
            JobKind::StreamIngestion.job_key(Some(target)),
            format!("stream_ingestion:{target}")
        );
        assert_eq!(JobKind::Backup.job_key(None), "backup:-");
    }

    #[test]
    fn terminal_and_claimable_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Pending.is_claimable());
        assert!(JobStatus::Scheduled.is_claimable());
        assert!(!JobStatus::Running.is_claimable());
    }
}
