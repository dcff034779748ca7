//! The five built-in job handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use sandbox_fs::SandboxRoot;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::{DatabaseConfig, SchedulerConfig};
use crate::database::repositories::{
    ChannelRepository, EpgProgramRepository, EpgSourceRepository, JobEnqueue, JobRepository,
    StreamProxyRepository, StreamSourceRepository,
};
use crate::errors::{AppError, AppResult};
use crate::models::{JobKind, ProxyStatus, SourceStatus};
use crate::pipeline::{EpgBinding, GenerationPipeline, PipelineContext, SourceBinding};
use crate::progress::{ProgressBus, ProgressHandle};
use crate::services::logo_cache::LogoCacheService;
use crate::sources::{SourceHandlerFactory, INGEST_STAGES};

use super::executor::{JobContext, JobHandler};

fn require_target(ctx: &JobContext) -> AppResult<Ulid> {
    ctx.job
        .target_id
        .ok_or_else(|| AppError::validation("job requires a target id"))
}

/// After a source ingests, enqueue one generation per referencing
/// auto-regenerate proxy, deduplicated against in-flight rows.
async fn enqueue_regenerations(
    source_id: Ulid,
    proxies: &StreamProxyRepository,
    jobs: &JobRepository,
    config: &SchedulerConfig,
) -> AppResult<usize> {
    let mut enqueued = 0;
    for proxy in proxies.find_auto_regenerate_for_source(source_id).await? {
        let request = JobEnqueue {
            kind: JobKind::ProxyGeneration,
            target_id: Some(proxy.id),
            next_run_at: Utc::now(),
            max_attempts: config.default_max_attempts,
            base_backoff: config.default_base_backoff,
        };
        if jobs.enqueue(request).await?.is_some() {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

pub struct StreamIngestionHandler {
    pub sources: StreamSourceRepository,
    pub proxies: StreamProxyRepository,
    pub jobs: JobRepository,
    pub factory: Arc<SourceHandlerFactory>,
    pub progress: Arc<ProgressBus>,
    pub config: SchedulerConfig,
}

#[async_trait]
impl JobHandler for StreamIngestionHandler {
    fn kind(&self) -> JobKind {
        JobKind::StreamIngestion
    }

    async fn run(&self, ctx: &JobContext) -> AppResult<Option<String>> {
        let source_id = require_target(ctx)?;
        let source = self.sources.find_by_id(source_id).await?;
        if !source.is_active {
            return Ok(Some("source inactive, skipped".to_string()));
        }

        self.sources
            .set_status(source_id, SourceStatus::Ingesting, None)
            .await?;
        let progress = ProgressHandle::new(
            self.progress.clone(),
            source_id,
            "stream_ingestion",
            INGEST_STAGES,
        );

        let handler = self.factory.stream_handler(source.kind);
        match handler.ingest(&source, &progress, &ctx.cancel).await {
            Ok(outcome) => {
                self.sources.mark_ingested(source_id, Utc::now()).await?;
                progress.complete();
                let regenerated =
                    enqueue_regenerations(source_id, &self.proxies, &self.jobs, &self.config)
                        .await?;
                info!(
                    source = %source.name,
                    channels = outcome.records,
                    skipped = outcome.skipped,
                    regenerations = regenerated,
                    "stream ingestion complete"
                );
                Ok(Some(
                    json!({
                        "channels": outcome.records,
                        "skipped": outcome.skipped,
                        "regenerations_enqueued": regenerated,
                    })
                    .to_string(),
                ))
            }
            Err(e) if e.is_cancelled() => {
                progress.cancelled();
                self.sources
                    .set_status(source_id, SourceStatus::Pending, None)
                    .await?;
                Err(e)
            }
            Err(e) => {
                progress.fail(e.to_string());
                self.sources
                    .set_status(source_id, SourceStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}

pub struct EpgIngestionHandler {
    pub sources: EpgSourceRepository,
    pub proxies: StreamProxyRepository,
    pub jobs: JobRepository,
    pub factory: Arc<SourceHandlerFactory>,
    pub progress: Arc<ProgressBus>,
    pub config: SchedulerConfig,
}

#[async_trait]
impl JobHandler for EpgIngestionHandler {
    fn kind(&self) -> JobKind {
        JobKind::EpgIngestion
    }

    async fn run(&self, ctx: &JobContext) -> AppResult<Option<String>> {
        let source_id = require_target(ctx)?;
        let source = self.sources.find_by_id(source_id).await?;
        if !source.is_active {
            return Ok(Some("source inactive, skipped".to_string()));
        }

        self.sources
            .set_status(source_id, SourceStatus::Ingesting, None)
            .await?;
        let progress = ProgressHandle::new(
            self.progress.clone(),
            source_id,
            "epg_ingestion",
            INGEST_STAGES,
        );

        let handler = self.factory.epg_handler(source.kind);
        match handler.ingest(&source, &progress, &ctx.cancel).await {
            Ok(outcome) => {
                self.sources.mark_ingested(source_id, Utc::now()).await?;
                progress.complete();
                let regenerated =
                    enqueue_regenerations(source_id, &self.proxies, &self.jobs, &self.config)
                        .await?;
                info!(
                    source = %source.name,
                    programs = outcome.records,
                    skipped = outcome.skipped,
                    regenerations = regenerated,
                    "epg ingestion complete"
                );
                Ok(Some(
                    json!({
                        "programs": outcome.records,
                        "skipped": outcome.skipped,
                        "regenerations_enqueued": regenerated,
                    })
                    .to_string(),
                ))
            }
            Err(e) if e.is_cancelled() => {
                progress.cancelled();
                self.sources
                    .set_status(source_id, SourceStatus::Pending, None)
                    .await?;
                Err(e)
            }
            Err(e) => {
                progress.fail(e.to_string());
                self.sources
                    .set_status(source_id, SourceStatus::Error, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}

pub struct ProxyGenerationHandler {
    pub proxies: StreamProxyRepository,
    pub stream_sources: StreamSourceRepository,
    pub epg_sources: EpgSourceRepository,
    pub pipeline: Arc<GenerationPipeline>,
    pub progress: Arc<ProgressBus>,
    pub base_url: String,
}

#[async_trait]
impl JobHandler for ProxyGenerationHandler {
    fn kind(&self) -> JobKind {
        JobKind::ProxyGeneration
    }

    async fn run(&self, ctx: &JobContext) -> AppResult<Option<String>> {
        let proxy_id = require_target(ctx)?;
        let proxy = self.proxies.find_by_id(proxy_id).await?;
        if !proxy.is_active {
            return Ok(Some("proxy inactive, skipped".to_string()));
        }

        self.proxies
            .set_status(proxy_id, ProxyStatus::Generating)
            .await?;
        let progress = Arc::new(ProgressHandle::new(
            self.progress.clone(),
            proxy_id,
            "proxy_generation",
            crate::pipeline::PIPELINE_STAGES,
        ));

        let mut sources = Vec::new();
        for reference in &proxy.sources {
            match self.stream_sources.find_by_id(reference.source_id).await {
                Ok(source) => sources.push(SourceBinding {
                    source,
                    priority_order: reference.priority_order,
                }),
                Err(AppError::NotFound { .. }) => {
                    warn!(proxy = %proxy.name, source = %reference.source_id, "referenced source is gone");
                }
                Err(e) => return Err(e),
            }
        }
        let mut epg_sources = Vec::new();
        for reference in &proxy.epg_sources {
            match self.epg_sources.find_by_id(reference.source_id).await {
                Ok(source) => epg_sources.push(EpgBinding {
                    source,
                    priority_order: reference.priority_order,
                }),
                Err(AppError::NotFound { .. }) => {
                    warn!(proxy = %proxy.name, source = %reference.source_id, "referenced EPG source is gone");
                }
                Err(e) => return Err(e),
            }
        }

        let mut pipeline_ctx = PipelineContext::new(
            proxy.clone(),
            sources,
            epg_sources,
            self.base_url.clone(),
            ctx.cancel.clone(),
            Some(progress.clone()),
        );

        match self.pipeline.run(&mut pipeline_ctx).await {
            Ok(summary) => {
                self.proxies.mark_generated(proxy_id, Utc::now()).await?;
                progress.complete();
                Ok(Some(
                    json!({
                        "channels": summary.channel_count,
                        "programs": summary.program_count,
                        "m3u": summary.m3u_path,
                        "xmltv": summary.xmltv_path,
                    })
                    .to_string(),
                ))
            }
            Err(e) if e.is_cancelled() => {
                progress.cancelled();
                self.proxies
                    .set_status(proxy_id, ProxyStatus::Pending)
                    .await?;
                Err(e)
            }
            Err(e) => {
                progress.fail(e.to_string());
                self.proxies.set_status(proxy_id, ProxyStatus::Error).await?;
                Err(e)
            }
        }
    }
}

pub struct LogoCleanupHandler {
    pub logos: Arc<LogoCacheService>,
    pub channels: ChannelRepository,
    pub jobs: JobRepository,
    pub history_retention: std::time::Duration,
}

#[async_trait]
impl JobHandler for LogoCleanupHandler {
    fn kind(&self) -> JobKind {
        JobKind::LogoCleanup
    }

    async fn run(&self, _ctx: &JobContext) -> AppResult<Option<String>> {
        let referenced = self.channels.referenced_logo_urls().await?;
        let removed = self.logos.cleanup(&referenced).await?;

        // Maintenance piggybacks: trim job history past its retention.
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.history_retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        let pruned = self.jobs.prune_history(cutoff).await?;

        info!(removed, pruned, "logo cleanup complete");
        Ok(Some(
            json!({"logos_removed": removed, "history_pruned": pruned}).to_string(),
        ))
    }
}

pub struct BackupHandler {
    pub database: DatabaseConfig,
    pub sandbox: SandboxRoot,
    pub channels: ChannelRepository,
    pub programs: EpgProgramRepository,
    pub retention: std::time::Duration,
}

#[async_trait]
impl JobHandler for BackupHandler {
    fn kind(&self) -> JobKind {
        JobKind::Backup
    }

    async fn run(&self, _ctx: &JobContext) -> AppResult<Option<String>> {
        let Some(db_path) = self.database.sqlite_path() else {
            return Ok(Some("backup skipped: not a file-backed database".to_string()));
        };

        let raw = tokio::fs::read(&db_path).await.map_err(|e| {
            AppError::internal(format!("cannot read database file {}: {e}", db_path.display()))
        })?;

        let checksum = hex::encode(Sha256::digest(&raw));
        let compressed = {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            std::io::Write::write_all(&mut encoder, &raw)
                .map_err(|e| AppError::internal(format!("gzip failed: {e}")))?;
            encoder
                .finish()
                .map_err(|e| AppError::internal(format!("gzip failed: {e}")))?
        };

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let backup_path = format!("backups/tvarr-backup-{stamp}.db.gz");
        self.sandbox.write_atomic(&backup_path, &compressed).await?;

        let meta = json!({
            "tvarr_version": env!("CARGO_PKG_VERSION"),
            "checksum_sha256": checksum,
            "row_counts": {
                "channels": self.channels.count_all().await?,
                "epg_programs": self.programs.count_all().await?,
            },
        });
        self.sandbox
            .write_atomic(&format!("{backup_path}.meta.json"), meta.to_string())
            .await?;

        let expired = self.expire_old_backups().await?;
        info!(backup = %backup_path, expired, "backup complete");
        Ok(Some(
            json!({"backup": backup_path, "expired": expired}).to_string(),
        ))
    }
}

impl BackupHandler {
    /// Backup names embed a UTC timestamp, so lexicographic order is
    /// chronological; everything older than the retention window goes.
    async fn expire_old_backups(&self) -> AppResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .unwrap_or_else(|_| chrono::Duration::days(14));
        let cutoff_name = format!(
            "tvarr-backup-{}.db.gz",
            cutoff.format("%Y%m%dT%H%M%SZ")
        );

        let mut removed = 0;
        for name in self.sandbox.list_dir("backups").await? {
            if name.ends_with(".db.gz") && name.as_str() < cutoff_name.as_str() {
                let _ = self.sandbox.remove_file(&format!("backups/{name}")).await;
                let _ = self
                    .sandbox
                    .remove_file(&format!("backups/{name}.meta.json"))
                    .await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
