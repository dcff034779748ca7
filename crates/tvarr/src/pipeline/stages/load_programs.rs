//! Loads programs for the kept channels' tvg ids, EPG sources in priority
//! order. The first source to provide a channel's guide owns that channel;
//! later sources fill only channels still missing.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::debug;

use crate::database::repositories::EpgProgramRepository;
use crate::errors::AppResult;
use crate::pipeline::{PipelineContext, PipelineStage};

pub struct LoadProgramsStage {
    programs: EpgProgramRepository,
}

impl LoadProgramsStage {
    pub fn new(programs: EpgProgramRepository) -> Self {
        Self { programs }
    }
}

#[async_trait]
impl PipelineStage for LoadProgramsStage {
    fn name(&self) -> &'static str {
        "load_programs"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let wanted = ctx.kept_tvg_ids();
        if wanted.is_empty() {
            ctx.counters.record("load_programs", 0, 0);
            return Ok(());
        }

        let now = Utc::now();
        let mut owned: HashSet<String> = HashSet::new();
        let mut programs = Vec::new();

        let total = ctx.epg_sources.len().max(1);
        for (index, binding) in ctx.epg_sources.clone().iter().enumerate() {
            if !binding.source.is_active {
                continue;
            }
            let missing: Vec<String> = wanted
                .iter()
                .filter(|id| !owned.contains(*id))
                .cloned()
                .collect();
            if missing.is_empty() {
                break;
            }

            let retention = Duration::days(binding.source.retention_days.max(1) as i64);
            let loaded = self
                .programs
                .find_for_channels(binding.source.id, &missing, now - retention, now + retention)
                .await?;
            for program in &loaded {
                owned.insert(program.channel_id.clone());
            }
            programs.extend(loaded);

            ctx.stage_progress(
                "load_programs",
                ((index + 1) as f64 / total as f64) * 100.0,
                &binding.source.name,
            );
        }

        programs.sort_by(|a, b| a.channel_id.cmp(&b.channel_id).then(a.start.cmp(&b.start)));
        debug!(
            proxy = %ctx.proxy.name,
            programs = programs.len(),
            channels_with_epg = owned.len(),
            "loaded programs"
        );
        ctx.counters.record("load_programs", programs.len(), 0);
        ctx.programs = programs;
        Ok(())
    }
}
