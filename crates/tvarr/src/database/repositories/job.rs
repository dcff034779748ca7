//! Job repository: enqueue, claim, finalize, recover.
//!
//! The claim is an optimistic single-row update conditioned on the status
//! the scan observed; rows_affected == 0 means another worker won and the
//! scan restarts. Two workers can never both own a row.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use ulid::Ulid;

use crate::entities::{job_history, jobs, prelude::{JobHistory, Jobs}};
use crate::errors::{AppError, AppResult};
use crate::models::{Job, JobHistoryEntry, JobKind, JobOutcome, JobStatus};

use super::{parse_enum, parse_ulid};

/// Parameters for enqueuing one job row.
#[derive(Debug, Clone)]
pub struct JobEnqueue {
    pub kind: JobKind,
    pub target_id: Option<Ulid>,
    pub next_run_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub base_backoff: Duration,
}

const CLAIMABLE: [&str; 2] = ["pending", "scheduled"];
const NON_TERMINAL: [&str; 3] = ["pending", "scheduled", "running"];

#[derive(Clone)]
pub struct JobRepository {
    connection: Arc<DatabaseConnection>,
}

impl JobRepository {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self { connection }
    }

    /// Insert one pending row unless a non-terminal row for the same
    /// (kind, target) already exists. Returns the new job, or `None` when
    /// the enqueue was suppressed.
    pub async fn enqueue(&self, request: JobEnqueue) -> AppResult<Option<Job>> {
        if self
            .find_non_terminal(request.kind, request.target_id)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let now = Utc::now();
        let id = Ulid::new();
        let model = jobs::ActiveModel {
            id: Set(id.to_string()),
            kind: Set(request.kind.to_string()),
            target_id: Set(request.target_id.map(|t| t.to_string())),
            status: Set(JobStatus::Pending.to_string()),
            next_run_at: Set(request.next_run_at),
            attempt_count: Set(0),
            max_attempts: Set(request.max_attempts),
            base_backoff_ms: Set(request.base_backoff.as_millis() as i64),
            last_error: Set(None),
            result: Set(None),
            started_at: Set(None),
            finished_at: Set(None),
            worker_id: Set(String::new()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Jobs::insert(model).exec(&*self.connection).await?;
        Ok(Some(self.find_by_id(id).await?))
    }

    /// Atomically claim the earliest due claimable row for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> AppResult<Option<Job>> {
        loop {
            let candidate = Jobs::find()
                .filter(jobs::Column::Status.is_in(CLAIMABLE))
                .filter(jobs::Column::NextRunAt.lte(now))
                .order_by_asc(jobs::Column::NextRunAt)
                .order_by_asc(jobs::Column::Id)
                .limit(1)
                .one(&*self.connection)
                .await?;

            let Some(row) = candidate else {
                return Ok(None);
            };

            let observed_status = row.status.clone();
            let update = Jobs::update_many()
                .col_expr(jobs::Column::Status, Expr::value(JobStatus::Running.to_string()))
                .col_expr(jobs::Column::WorkerId, Expr::value(worker_id))
                .col_expr(jobs::Column::StartedAt, Expr::value(Some(now)))
                .col_expr(
                    jobs::Column::AttemptCount,
                    Expr::col(jobs::Column::AttemptCount).add(1),
                )
                .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
                .filter(jobs::Column::Id.eq(row.id.clone()))
                .filter(jobs::Column::Status.eq(observed_status))
                .exec(&*self.connection)
                .await?;

            if update.rows_affected == 1 {
                return Ok(Some(self.find_by_id(parse_ulid(&row.id)?).await?));
            }
            // Lost the race to another worker; rescan.
        }
    }

    pub async fn find_by_id(&self, id: Ulid) -> AppResult<Job> {
        let row = Jobs::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
        to_model(row)
    }

    pub async fn find_non_terminal(
        &self,
        kind: JobKind,
        target_id: Option<Ulid>,
    ) -> AppResult<Option<Job>> {
        let mut query = Jobs::find()
            .filter(jobs::Column::Kind.eq(kind.to_string()))
            .filter(jobs::Column::Status.is_in(NON_TERMINAL));
        query = match target_id {
            Some(target) => query.filter(jobs::Column::TargetId.eq(target.to_string())),
            None => query.filter(jobs::Column::TargetId.is_null()),
        };
        query.one(&*self.connection).await?.map(to_model).transpose()
    }

    pub async fn finalize_success(&self, id: Ulid, result: Option<String>) -> AppResult<Job> {
        self.finalize(id, JobStatus::Completed, None, result).await
    }

    /// Failed attempt with retries remaining: back off and reschedule.
    pub async fn finalize_retry(&self, id: Ulid, error: String) -> AppResult<Job> {
        let job = self.find_by_id(id).await?;
        let now = Utc::now();
        let next_run_at = now + chrono::Duration::from_std(job.retry_backoff())
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));

        let row = Jobs::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
        let mut active: jobs::ActiveModel = row.into();
        active.status = Set(JobStatus::Scheduled.to_string());
        active.next_run_at = Set(next_run_at);
        active.last_error = Set(Some(error));
        active.finished_at = Set(Some(now));
        active.worker_id = Set(String::new());
        active.updated_at = Set(now);
        active.update(&*self.connection).await?;
        self.find_by_id(id).await
    }

    pub async fn finalize_failed(&self, id: Ulid, error: String) -> AppResult<Job> {
        self.finalize(id, JobStatus::Failed, Some(error), None).await
    }

    pub async fn finalize_cancelled(&self, id: Ulid) -> AppResult<Job> {
        self.finalize(id, JobStatus::Cancelled, None, None).await
    }

    async fn finalize(
        &self,
        id: Ulid,
        status: JobStatus,
        error: Option<String>,
        result: Option<String>,
    ) -> AppResult<Job> {
        let now = Utc::now();
        let row = Jobs::find_by_id(id.to_string())
            .one(&*self.connection)
            .await?
            .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
        let mut active: jobs::ActiveModel = row.into();
        active.status = Set(status.to_string());
        active.finished_at = Set(Some(now));
        if let Some(error) = error {
            active.last_error = Set(Some(error));
        }
        if result.is_some() {
            active.result = Set(result);
        }
        active.updated_at = Set(now);
        active.update(&*self.connection).await?;
        self.find_by_id(id).await
    }

    /// Cancel a claimable job. Returns true when a row transitioned;
    /// running jobs are cancelled cooperatively by the runner instead.
    pub async fn cancel_if_claimable(&self, id: Ulid) -> AppResult<bool> {
        let now = Utc::now();
        let update = Jobs::update_many()
            .col_expr(
                jobs::Column::Status,
                Expr::value(JobStatus::Cancelled.to_string()),
            )
            .col_expr(jobs::Column::FinishedAt, Expr::value(Some(now)))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(id.to_string()))
            .filter(jobs::Column::Status.is_in(CLAIMABLE))
            .exec(&*self.connection)
            .await?;
        Ok(update.rows_affected == 1)
    }

    /// Reset running rows whose claim has gone stale. Each recovered row
    /// becomes claimable immediately with an annotation in last_error.
    pub async fn recover_orphans(&self, staleness: Duration) -> AppResult<u64> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(staleness).unwrap_or_else(|_| chrono::Duration::hours(2));
        let update = Jobs::update_many()
            .col_expr(
                jobs::Column::Status,
                Expr::value(JobStatus::Scheduled.to_string()),
            )
            .col_expr(jobs::Column::NextRunAt, Expr::value(now))
            .col_expr(jobs::Column::WorkerId, Expr::value(""))
            .col_expr(
                jobs::Column::LastError,
                Expr::value(Some("recovered: worker claim went stale".to_string())),
            )
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Status.eq(JobStatus::Running.to_string()))
            .filter(jobs::Column::StartedAt.lt(cutoff))
            .exec(&*self.connection)
            .await?;
        Ok(update.rows_affected)
    }

    pub async fn append_history(&self, entry: JobHistoryEntry) -> AppResult<()> {
        job_history::ActiveModel {
            id: Set(entry.id.to_string()),
            job_id: Set(entry.job_id.to_string()),
            kind: Set(entry.kind.to_string()),
            target_id: Set(entry.target_id.map(|t| t.to_string())),
            attempt: Set(entry.attempt),
            started_at: Set(entry.started_at),
            finished_at: Set(entry.finished_at),
            outcome: Set(entry.outcome.to_string()),
            error: Set(entry.error),
        }
        .insert(&*self.connection)
        .await
        .map(|_| ())
        .map_err(AppError::from)
    }

    pub async fn history_for_job(&self, job_id: Ulid) -> AppResult<Vec<JobHistoryEntry>> {
        let rows = JobHistory::find()
            .filter(job_history::Column::JobId.eq(job_id.to_string()))
            .order_by_asc(job_history::Column::Attempt)
            .all(&*self.connection)
            .await?;
        rows.into_iter().map(history_to_model).collect()
    }

    pub async fn prune_history(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let result = JobHistory::delete_many()
            .filter(job_history::Column::FinishedAt.lt(older_than))
            .exec(&*self.connection)
            .await?;
        Ok(result.rows_affected)
    }

    /// Finish time of the most recent completed run for (kind, target);
    /// the scheduler keys internal cron entries on this.
    pub async fn last_completed_at(
        &self,
        kind: JobKind,
        target_id: Option<Ulid>,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let mut query = Jobs::find()
            .filter(jobs::Column::Kind.eq(kind.to_string()))
            .filter(jobs::Column::Status.eq(JobStatus::Completed.to_string()));
        query = match target_id {
            Some(target) => query.filter(jobs::Column::TargetId.eq(target.to_string())),
            None => query.filter(jobs::Column::TargetId.is_null()),
        };
        let row = query
            .order_by_desc(jobs::Column::FinishedAt)
            .limit(1)
            .one(&*self.connection)
            .await?;
        Ok(row.and_then(|r| r.finished_at))
    }

    pub async fn count_by_status(&self, status: JobStatus) -> AppResult<u64> {
        Ok(Jobs::find()
            .filter(jobs::Column::Status.eq(status.to_string()))
            .count(&*self.connection)
            .await?)
    }
}

fn to_model(row: jobs::Model) -> AppResult<Job> {
    Ok(Job {
        id: parse_ulid(&row.id)?,
        kind: parse_enum(&row.kind, "job kind")?,
        target_id: row.target_id.as_deref().map(parse_ulid).transpose()?,
        status: parse_enum(&row.status, "job status")?,
        next_run_at: row.next_run_at,
        attempt_count: row.attempt_count,
        max_attempts: row.max_attempts,
        base_backoff: Duration::from_millis(row.base_backoff_ms.max(0) as u64),
        last_error: row.last_error,
        result: row.result,
        started_at: row.started_at,
        finished_at: row.finished_at,
        worker_id: row.worker_id,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn history_to_model(row: job_history::Model) -> AppResult<JobHistoryEntry> {
    Ok(JobHistoryEntry {
        id: parse_ulid(&row.id)?,
        job_id: parse_ulid(&row.job_id)?,
        kind: parse_enum(&row.kind, "job kind")?,
        target_id: row.target_id.as_deref().map(parse_ulid).transpose()?,
        attempt: row.attempt,
        started_at: row.started_at,
        finished_at: row.finished_at,
        outcome: parse_enum(&row.outcome, "job outcome")?,
        error: row.error,
    })
}
