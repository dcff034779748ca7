//! Cron scheduler: evaluates due schedules every sync interval and
//! materializes pending job rows.
//!
//! Cron entries are derived from the store on every tick (enabled sources
//! with a non-empty cron) plus the internal maintenance entries, so
//! reconciliation against stale registrations is implicit. Firing is
//! idempotent: an existing non-terminal row for the same (kind, target)
//! suppresses the insert.

use chrono::Utc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::database::repositories::{
    EpgSourceRepository, JobEnqueue, JobRepository, StreamSourceRepository,
};
use crate::errors::AppResult;
use crate::models::JobKind;
use crate::utils::cron;

pub struct CronScheduler {
    stream_sources: StreamSourceRepository,
    epg_sources: EpgSourceRepository,
    jobs: JobRepository,
    config: SchedulerConfig,
}

impl CronScheduler {
    pub fn new(
        stream_sources: StreamSourceRepository,
        epg_sources: EpgSourceRepository,
        jobs: JobRepository,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            stream_sources,
            epg_sources,
            jobs,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> AppResult<()> {
        info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            "starting cron scheduler"
        );
        let mut ticker = interval(self.config.sync_interval);

        // The first tick fires immediately; that is the startup catch-up
        // pass (a single make-up run per overdue source). Skip it when
        // catch-up is disabled.
        if !self.config.startup_catchup {
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.schedule_due().await {
                        error!(error = %e, "scheduling pass failed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("cron scheduler stopping");
                    return Ok(());
                }
            }
        }
    }

    /// One reconciliation pass: enqueue everything due right now.
    pub async fn schedule_due(&self) -> AppResult<usize> {
        let now = Utc::now();
        let mut enqueued = 0usize;

        for source in self.stream_sources.find_active().await? {
            if source.update_cron.is_empty() {
                continue;
            }
            if cron::is_due(&source.update_cron, source.last_ingested_at, now)
                && self
                    .enqueue(JobKind::StreamIngestion, Some(source.id))
                    .await?
            {
                info!(source = %source.name, "scheduled stream ingestion");
                enqueued += 1;
            }
        }

        for source in self.epg_sources.find_active().await? {
            if source.update_cron.is_empty() {
                continue;
            }
            if cron::is_due(&source.update_cron, source.last_ingested_at, now)
                && self.enqueue(JobKind::EpgIngestion, Some(source.id)).await?
            {
                info!(source = %source.name, "scheduled EPG ingestion");
                enqueued += 1;
            }
        }

        // Internal maintenance entries key off their own last completion.
        for (kind, schedule) in [
            (JobKind::LogoCleanup, self.config.logo_cleanup_cron.clone()),
            (JobKind::Backup, self.config.backup_cron.clone()),
        ] {
            if schedule.is_empty() {
                continue;
            }
            let last = self.jobs.last_completed_at(kind, None).await?;
            if cron::is_due(&schedule, last, now) && self.enqueue(kind, None).await? {
                debug!(kind = %kind, "scheduled maintenance job");
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            debug!(enqueued, "scheduling pass complete");
        }
        Ok(enqueued)
    }

    /// On-demand trigger (API path): run now regardless of cron.
    pub async fn trigger(&self, kind: JobKind, target_id: Option<Ulid>) -> AppResult<bool> {
        let created = self.enqueue(kind, target_id).await?;
        if created {
            info!(kind = %kind, target = ?target_id, "triggered immediate job");
        } else {
            warn!(kind = %kind, target = ?target_id, "job already queued or running");
        }
        Ok(created)
    }

    async fn enqueue(&self, kind: JobKind, target_id: Option<Ulid>) -> AppResult<bool> {
        let request = JobEnqueue {
            kind,
            target_id,
            next_run_at: Utc::now(),
            max_attempts: self.config.default_max_attempts,
            base_backoff: self.config.default_base_backoff,
        };
        Ok(self.jobs.enqueue(request).await?.is_some())
    }
}
