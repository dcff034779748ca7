//! Drives the stage sequence for one proxy generation.

use std::sync::Arc;
use std::time::Instant;

use sandbox_fs::SandboxRoot;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::database::repositories::{ChannelRepository, EpgProgramRepository, RuleRepository};
use crate::errors::{AppError, AppResult};
use crate::expression::RuleCache;
use crate::progress::ProgressBus;
use crate::services::logo_cache::LogoCacheService;

use super::context::{GenerationSummary, PipelineContext};
use super::stages::{
    DataMappingStage, FilteringStage, IngestionGuardStage, LoadChannelsStage, LoadProgramsStage,
    LogoCachingStage, NumberingStage, PublishStage, RenderM3uStage, RenderXmltvStage,
};
use super::PipelineStage;

pub struct GenerationPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl GenerationPipeline {
    /// The standard stage order. The guard is dropped when disabled in
    /// configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn standard(
        config: &PipelineConfig,
        progress_bus: Arc<ProgressBus>,
        channels: ChannelRepository,
        programs: EpgProgramRepository,
        rules: RuleRepository,
        rule_cache: Arc<RuleCache>,
        logos: Arc<LogoCacheService>,
        sandbox: SandboxRoot,
    ) -> Self {
        let mut stages: Vec<Box<dyn PipelineStage>> = Vec::new();
        if config.ingestion_guard {
            stages.push(Box::new(IngestionGuardStage::new(
                progress_bus,
                config.ingestion_guard_timeout,
            )));
        }
        stages.push(Box::new(LoadChannelsStage::new(channels)));
        stages.push(Box::new(LoadProgramsStage::new(programs)));
        stages.push(Box::new(DataMappingStage::new(
            rules.clone(),
            rule_cache.clone(),
        )));
        stages.push(Box::new(FilteringStage::new(rules, rule_cache)));
        stages.push(Box::new(NumberingStage));
        stages.push(Box::new(LogoCachingStage::new(logos)));
        stages.push(Box::new(RenderM3uStage));
        stages.push(Box::new(RenderXmltvStage));
        stages.push(Box::new(PublishStage::new(sandbox)));
        Self { stages }
    }

    /// Run all stages in order, fail-fast. Cancellation is checked between
    /// stages; stages also honor the token at their own I/O boundaries.
    pub async fn run(&self, ctx: &mut PipelineContext) -> AppResult<GenerationSummary> {
        let started = Instant::now();
        info!(proxy = %ctx.proxy.name, "starting generation");

        for stage in &self.stages {
            if ctx.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let stage_started = Instant::now();
            match stage.execute(ctx).await {
                Ok(()) => {
                    debug!(
                        proxy = %ctx.proxy.name,
                        stage = stage.name(),
                        elapsed_ms = stage_started.elapsed().as_millis() as u64,
                        "stage complete"
                    );
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(
                        proxy = %ctx.proxy.name,
                        stage = stage.name(),
                        error = %e,
                        "stage failed"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            proxy = %ctx.proxy.name,
            channels = ctx.channels.len(),
            programs = ctx.programs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation complete"
        );

        Ok(GenerationSummary {
            channel_count: ctx.channels.len(),
            program_count: ctx.programs.len(),
            m3u_path: PublishStage::m3u_path(ctx.proxy.id),
            xmltv_path: PublishStage::xmltv_path(ctx.proxy.id),
            counters: ctx.counters.clone(),
        })
    }
}
