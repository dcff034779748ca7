//! Job subsystem integration tests over an in-memory store: atomic
//! claims, retry/backoff, history, cancellation and orphan recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use tvarr::config::{DatabaseConfig, SchedulerConfig};
use tvarr::database::repositories::{JobEnqueue, JobRepository};
use tvarr::database::Database;
use tvarr::errors::{AppError, AppResult};
use tvarr::models::{JobKind, JobOutcome, JobStatus};
use tvarr::scheduling::{JobContext, JobExecutor, JobHandler, JobRunner};

async fn test_database() -> Database {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        app_secret: "test".to_string(),
    };
    Database::connect(&config).await.expect("in-memory database")
}

fn enqueue_request(kind: JobKind, target: Option<Ulid>) -> JobEnqueue {
    JobEnqueue {
        kind,
        target_id: target,
        next_run_at: Utc::now(),
        max_attempts: 3,
        base_backoff: Duration::from_millis(50),
    }
}

fn runner_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        poll_interval: Duration::from_millis(20),
        job_timeout: Duration::from_secs(10),
        ..SchedulerConfig::default()
    }
}

/// Counts executions; fails the first `failures` attempts per target.
struct CountingHandler {
    kind: JobKind,
    executions: AtomicUsize,
    failures: AtomicUsize,
}

impl CountingHandler {
    fn new(kind: JobKind, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            executions: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn run(&self, _ctx: &JobContext) -> AppResult<Option<String>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if remaining {
            Err(AppError::upstream_transient("test", "induced failure"))
        } else {
            Ok(Some("done".to_string()))
        }
    }
}

#[tokio::test]
async fn enqueue_is_idempotent_per_kind_and_target() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    let target = Ulid::new();

    let first = jobs
        .enqueue(enqueue_request(JobKind::StreamIngestion, Some(target)))
        .await
        .unwrap();
    assert!(first.is_some());

    // A second fire for the same (kind, target) does nothing.
    let second = jobs
        .enqueue(enqueue_request(JobKind::StreamIngestion, Some(target)))
        .await
        .unwrap();
    assert!(second.is_none());

    // A different target is a different queue entry.
    let other = jobs
        .enqueue(enqueue_request(JobKind::StreamIngestion, Some(Ulid::new())))
        .await
        .unwrap();
    assert!(other.is_some());
}

#[tokio::test]
async fn claim_stamps_worker_and_is_exclusive() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    jobs.enqueue(enqueue_request(JobKind::Backup, None))
        .await
        .unwrap();

    let claimed = jobs.claim_next("worker-a", Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.worker_id, "worker-a");
    assert_eq!(claimed.attempt_count, 1);
    assert!(claimed.started_at.is_some());

    // The row is running; nothing else is claimable.
    assert!(jobs.claim_next("worker-b", Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_backoff_grows_and_attempts_are_bounded() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    let created = jobs
        .enqueue(enqueue_request(JobKind::StreamIngestion, Some(Ulid::new())))
        .await
        .unwrap()
        .unwrap();

    // Attempt 1 fails: scheduled with >= base backoff.
    let claimed = jobs.claim_next("w", Utc::now()).await.unwrap().unwrap();
    let before = Utc::now();
    let retried = jobs
        .finalize_retry(claimed.id, "boom".to_string())
        .await
        .unwrap();
    assert_eq!(retried.status, JobStatus::Scheduled);
    let gap = (retried.next_run_at - before).num_milliseconds();
    assert!(gap >= 40, "expected >= base backoff, got {gap}ms");

    // Attempt 2 fails: gap doubles.
    let claimed = jobs
        .claim_next("w", retried.next_run_at + chrono::Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempt_count, 2);
    let before = Utc::now();
    let retried = jobs
        .finalize_retry(claimed.id, "boom".to_string())
        .await
        .unwrap();
    let gap2 = (retried.next_run_at - before).num_milliseconds();
    assert!(gap2 >= 90, "expected doubled backoff, got {gap2}ms");

    assert!(retried.attempt_count <= retried.max_attempts);
    let _ = created;
}

#[tokio::test]
async fn ten_jobs_complete_across_four_workers_with_unique_claims() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());

    let mut ids = Vec::new();
    for _ in 0..10 {
        let job = jobs
            .enqueue(enqueue_request(JobKind::ProxyGeneration, Some(Ulid::new())))
            .await
            .unwrap()
            .unwrap();
        ids.push(job.id);
    }

    let handler = CountingHandler::new(JobKind::ProxyGeneration, 0);
    let mut executor = JobExecutor::new();
    executor.register(handler.clone());
    let runner = Arc::new(JobRunner::new(
        jobs.clone(),
        Arc::new(executor),
        runner_config(4),
    ));

    let cancel = CancellationToken::new();
    let runner_task = tokio::spawn(runner.clone().run(cancel.clone()));

    // Wait for all jobs to finish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let completed = jobs.count_by_status(JobStatus::Completed).await.unwrap();
        if completed == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not complete in time ({completed}/10)"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
    let _ = runner_task.await;

    // Each job ran exactly once and kept a single worker stamp.
    assert_eq!(handler.executions.load(Ordering::SeqCst), 10);
    for id in ids {
        let job = jobs.find_by_id(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.worker_id.starts_with("worker-"));
        let history = jobs.history_for_job(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, JobOutcome::Completed);
    }
}

#[tokio::test]
async fn fail_twice_then_succeed_leaves_three_history_rows() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    let job = jobs
        .enqueue(JobEnqueue {
            kind: JobKind::EpgIngestion,
            target_id: Some(Ulid::new()),
            next_run_at: Utc::now(),
            max_attempts: 3,
            base_backoff: Duration::from_millis(30),
        })
        .await
        .unwrap()
        .unwrap();

    let handler = CountingHandler::new(JobKind::EpgIngestion, 2);
    let mut executor = JobExecutor::new();
    executor.register(handler.clone());
    let runner = Arc::new(JobRunner::new(
        jobs.clone(),
        Arc::new(executor),
        runner_config(2),
    ));

    let cancel = CancellationToken::new();
    let runner_task = tokio::spawn(runner.clone().run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = jobs.find_by_id(job.id).await.unwrap();
        if current.status == JobStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not complete, status {:?}",
            current.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
    let _ = runner_task.await;

    assert_eq!(handler.executions.load(Ordering::SeqCst), 3);
    let history = jobs.history_for_job(job.id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].outcome, JobOutcome::Failed);
    assert_eq!(history[1].outcome, JobOutcome::Failed);
    assert_eq!(history[2].outcome, JobOutcome::Completed);

    let finished = jobs.find_by_id(job.id).await.unwrap();
    assert_eq!(finished.attempt_count, 3);
}

#[tokio::test]
async fn max_attempts_one_fails_terminally_without_retry() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    let job = jobs
        .enqueue(JobEnqueue {
            kind: JobKind::StreamIngestion,
            target_id: Some(Ulid::new()),
            next_run_at: Utc::now(),
            max_attempts: 1,
            base_backoff: Duration::from_millis(10),
        })
        .await
        .unwrap()
        .unwrap();

    let handler = CountingHandler::new(JobKind::StreamIngestion, 10);
    let mut executor = JobExecutor::new();
    executor.register(handler.clone());
    let runner = Arc::new(JobRunner::new(
        jobs.clone(),
        Arc::new(executor),
        runner_config(1),
    ));

    let cancel = CancellationToken::new();
    let runner_task = tokio::spawn(runner.clone().run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = jobs.find_by_id(job.id).await.unwrap();
        if current.status == JobStatus::Failed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never failed");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    cancel.cancel();
    let _ = runner_task.await;

    assert_eq!(handler.executions.load(Ordering::SeqCst), 1);
    let finished = jobs.find_by_id(job.id).await.unwrap();
    assert_eq!(finished.attempt_count, 1);
    assert!(finished.last_error.unwrap().contains("induced failure"));
}

#[tokio::test]
async fn stale_running_rows_are_recovered_to_scheduled() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    jobs.enqueue(enqueue_request(JobKind::LogoCleanup, None))
        .await
        .unwrap();

    // Simulate a worker that died mid-run: claim, then vanish.
    let claimed = jobs.claim_next("dead-worker", Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.status, JobStatus::Running);

    // With zero staleness every running row qualifies immediately.
    let recovered = jobs.recover_orphans(Duration::ZERO).await.unwrap();
    assert_eq!(recovered, 1);

    let row = jobs.find_by_id(claimed.id).await.unwrap();
    assert_eq!(row.status, JobStatus::Scheduled);
    assert!(row.worker_id.is_empty());
    assert!(row.last_error.unwrap().contains("recovered"));

    // And it is claimable again.
    let reclaimed = jobs.claim_next("new-worker", Utc::now()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, claimed.id);
    assert_eq!(reclaimed.attempt_count, 2);
}

#[tokio::test]
async fn queued_jobs_cancel_immediately() {
    let db = test_database().await;
    let jobs = JobRepository::new(db.connection());
    let job = jobs
        .enqueue(enqueue_request(JobKind::Backup, None))
        .await
        .unwrap()
        .unwrap();

    assert!(jobs.cancel_if_claimable(job.id).await.unwrap());
    let row = jobs.find_by_id(job.id).await.unwrap();
    assert_eq!(row.status, JobStatus::Cancelled);

    // Terminal rows are not claimable.
    assert!(jobs.claim_next("w", Utc::now()).await.unwrap().is_none());
}
