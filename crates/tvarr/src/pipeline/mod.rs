//! Proxy generation pipeline.
//!
//! A linear, fail-fast sequence of stages over one in-memory context:
//! guard, load, map, filter, number, logos, render, publish. Stages never
//! touch proxy status; the generation job handler owns that.

pub mod context;
pub mod orchestrator;
pub mod stages;

use async_trait::async_trait;

use crate::errors::AppResult;

pub use context::{
    EpgBinding, GenerationSummary, PipelineContext, SourceBinding, StageCount, StageCounters,
};
pub use orchestrator::GenerationPipeline;

/// One pipeline stage. Stages mutate the context bag and report their
/// counts into `ctx.counters`; any error aborts the run.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()>;
}

/// Stage names double as progress stage ids.
pub const PIPELINE_STAGES: &[&str] = &[
    "guard",
    "load_channels",
    "load_programs",
    "data_mapping",
    "filtering",
    "numbering",
    "logos",
    "render_m3u",
    "render_xmltv",
    "publish",
];
