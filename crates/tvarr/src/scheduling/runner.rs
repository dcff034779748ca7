//! Job runner: a bounded worker pool over the persisted queue.
//!
//! Each worker loops claim → dispatch → execute → finalize. The claim is
//! the store's optimistic single-row update, so a job runs on exactly one
//! worker. Failures reschedule with exponential backoff until attempts
//! are exhausted; every attempt leaves a history row. A separate task
//! recovers rows whose claims went stale (crashed workers).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::database::repositories::JobRepository;
use crate::errors::{AppError, AppResult};
use crate::models::{Job, JobHistoryEntry, JobOutcome};

use super::executor::{JobContext, JobExecutor};

pub struct JobRunner {
    jobs: JobRepository,
    executor: Arc<JobExecutor>,
    config: SchedulerConfig,
    /// Tokens of currently-executing jobs, for external cancellation.
    running: Arc<Mutex<HashMap<Ulid, CancellationToken>>>,
}

impl JobRunner {
    pub fn new(jobs: JobRepository, executor: Arc<JobExecutor>, config: SchedulerConfig) -> Self {
        Self {
            jobs,
            executor,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the worker pool plus orphan recovery until cancelled. Running
    /// handlers are cancelled cooperatively on shutdown; their rows stay
    /// `running` and are orphan-recovered at next start.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> AppResult<()> {
        info!(workers = self.config.workers, "starting job runner");

        let mut tasks = Vec::new();
        for index in 0..self.config.workers.max(1) {
            let runner = self.clone();
            let token = cancel.clone();
            let worker_id = format!("worker-{}-{index}", std::process::id());
            tasks.push(tokio::spawn(async move {
                runner.worker_loop(worker_id, token).await;
            }));
        }

        let recovery_runner = self.clone();
        let recovery_token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            recovery_runner.recovery_loop(recovery_token).await;
        }));

        for task in tasks {
            let _ = task.await;
        }
        info!("job runner stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: String, cancel: CancellationToken) {
        debug!(worker = %worker_id, "worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.jobs.claim_next(&worker_id, Utc::now()).await {
                Ok(Some(job)) => {
                    self.execute_claimed(job, &cancel).await;
                }
                Ok(None) => {
                    let jitter = rand::rng().random_range(0..250);
                    let pause = self.config.poll_interval + Duration::from_millis(jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        debug!(worker = %worker_id, "worker stopped");
    }

    async fn execute_claimed(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        let child = shutdown.child_token();
        self.running
            .lock()
            .expect("running map lock poisoned")
            .insert(job_id, child.clone());

        info!(
            job = %job_id,
            kind = %job.kind,
            target = ?job.target_id,
            attempt = job.attempt_count,
            worker = %job.worker_id,
            "executing job"
        );

        let result = self.dispatch(&job, child.clone()).await;

        self.running
            .lock()
            .expect("running map lock poisoned")
            .remove(&job_id);

        if let Err(e) = self.finalize(&job, result).await {
            error!(job = %job_id, error = %e, "failed to finalize job");
        }
    }

    async fn dispatch(&self, job: &Job, cancel: CancellationToken) -> AppResult<Option<String>> {
        let Some(handler) = self.executor.handler_for(job.kind) else {
            return Err(AppError::validation(format!(
                "no handler registered for job kind '{}'",
                job.kind
            )));
        };

        let ctx = JobContext {
            job: job.clone(),
            cancel: cancel.clone(),
        };

        let outcome = tokio::time::timeout(self.config.job_timeout, handler.run(&ctx)).await;
        match outcome {
            Ok(result) => result,
            Err(_elapsed) => {
                // Give the handler its cancellation signal; the attempt is
                // recorded as a failure either way.
                cancel.cancel();
                Err(AppError::internal(format!(
                    "job timed out after {:?}",
                    self.config.job_timeout
                )))
            }
        }
    }

    async fn finalize(&self, job: &Job, result: AppResult<Option<String>>) -> AppResult<()> {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let finished_at = Utc::now();

        let (outcome, error_text) = match &result {
            Ok(_) => (JobOutcome::Completed, None),
            Err(e) if e.is_cancelled() => (JobOutcome::Cancelled, None),
            Err(e) => (JobOutcome::Failed, Some(e.to_string())),
        };

        // Every attempt leaves a history row.
        self.jobs
            .append_history(JobHistoryEntry {
                id: Ulid::new(),
                job_id: job.id,
                kind: job.kind,
                target_id: job.target_id,
                attempt: job.attempt_count,
                started_at,
                finished_at,
                outcome,
                error: error_text.clone(),
            })
            .await?;

        match result {
            Ok(payload) => {
                self.jobs.finalize_success(job.id, payload).await?;
                info!(job = %job.id, kind = %job.kind, "job completed");
            }
            Err(e) if e.is_cancelled() => {
                self.jobs.finalize_cancelled(job.id).await?;
                debug!(job = %job.id, "job cancelled");
            }
            Err(e) => {
                let terminal = is_terminal_error(&e) || job.attempts_exhausted();
                if terminal {
                    self.jobs.finalize_failed(job.id, e.to_string()).await?;
                    error!(
                        job = %job.id,
                        kind = %job.kind,
                        attempts = job.attempt_count,
                        error = %e,
                        "job failed terminally"
                    );
                } else {
                    let updated = self.jobs.finalize_retry(job.id, e.to_string()).await?;
                    warn!(
                        job = %job.id,
                        kind = %job.kind,
                        attempt = job.attempt_count,
                        next_run_at = %updated.next_run_at,
                        error = %e,
                        "job failed, retry scheduled"
                    );
                }
            }
        }
        Ok(())
    }

    /// External cancellation: claimable rows flip to cancelled in the
    /// store; a running job gets its token cancelled and finalizes as
    /// cancelled when the handler unwinds.
    pub async fn cancel_job(&self, job_id: Ulid) -> AppResult<bool> {
        if self.jobs.cancel_if_claimable(job_id).await? {
            info!(job = %job_id, "cancelled queued job");
            return Ok(true);
        }
        let token = self
            .running
            .lock()
            .expect("running map lock poisoned")
            .get(&job_id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                info!(job = %job_id, "cancellation requested for running job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recovery_loop(&self, cancel: CancellationToken) {
        let staleness = self.config.job_timeout + self.config.orphan_slack;
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.jobs.recover_orphans(staleness).await {
                        Ok(0) => {}
                        Ok(recovered) => {
                            warn!(recovered, "recovered orphaned jobs");
                        }
                        Err(e) => error!(error = %e, "orphan recovery failed"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

/// Errors that never warrant another attempt, regardless of the retry
/// budget.
fn is_terminal_error(error: &AppError) -> bool {
    matches!(
        error,
        AppError::Validation { .. }
            | AppError::NotFound { .. }
            | AppError::Conflict { .. }
            | AppError::UpstreamPermanent { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_and_validation_errors_are_terminal() {
        assert!(is_terminal_error(&AppError::validation("bad input")));
        assert!(is_terminal_error(&AppError::upstream_permanent("h", "404")));
        assert!(!is_terminal_error(&AppError::upstream_transient("h", "timeout")));
        assert!(!is_terminal_error(&AppError::internal("disk full")));
    }
}
