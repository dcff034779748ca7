//! The in-memory bag passed through the generation stages.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::models::{Channel, EpgProgram, EpgSource, StreamProxy, StreamSource};
use crate::progress::ProgressHandle;

/// A proxy's stream source together with its evaluation order
/// (ascending priority_order evaluates first and wins conflicts).
#[derive(Debug, Clone)]
pub struct SourceBinding {
    pub source: StreamSource,
    pub priority_order: i32,
}

#[derive(Debug, Clone)]
pub struct EpgBinding {
    pub source: EpgSource,
    pub priority_order: i32,
}

/// Per-stage record counts plus per-rule match counters.
#[derive(Debug, Clone, Default)]
pub struct StageCounters {
    pub stages: Vec<StageCount>,
    pub rule_matches: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct StageCount {
    pub stage: &'static str,
    pub kept: usize,
    pub removed: usize,
}

impl StageCounters {
    pub fn record(&mut self, stage: &'static str, kept: usize, removed: usize) {
        self.stages.push(StageCount {
            stage,
            kept,
            removed,
        });
    }

    pub fn count_rule_match(&mut self, rule_name: &str) {
        *self.rule_matches.entry(rule_name.to_string()).or_insert(0) += 1;
    }
}

pub struct PipelineContext {
    pub proxy: StreamProxy,
    /// Stream sources sorted by (priority_order, source id).
    pub sources: Vec<SourceBinding>,
    /// EPG sources sorted the same way.
    pub epg_sources: Vec<EpgBinding>,
    pub channels: Vec<Channel>,
    pub programs: Vec<EpgProgram>,
    /// Rendered artifacts, filled by the render stages.
    pub m3u_output: Option<String>,
    pub xmltv_output: Option<String>,
    pub counters: StageCounters,
    pub cancel: CancellationToken,
    pub progress: Option<Arc<ProgressHandle>>,
    /// Absolute base for artifact and relay URLs.
    pub base_url: String,
}

impl PipelineContext {
    pub fn new(
        proxy: StreamProxy,
        mut sources: Vec<SourceBinding>,
        mut epg_sources: Vec<EpgBinding>,
        base_url: String,
        cancel: CancellationToken,
        progress: Option<Arc<ProgressHandle>>,
    ) -> Self {
        sources.sort_by(|a, b| {
            a.priority_order
                .cmp(&b.priority_order)
                .then(a.source.id.cmp(&b.source.id))
        });
        epg_sources.sort_by(|a, b| {
            a.priority_order
                .cmp(&b.priority_order)
                .then(a.source.id.cmp(&b.source.id))
        });
        Self {
            proxy,
            sources,
            epg_sources,
            channels: Vec::new(),
            programs: Vec::new(),
            m3u_output: None,
            xmltv_output: None,
            counters: StageCounters::default(),
            cancel,
            progress,
            base_url,
        }
    }

    pub fn stage_progress(&self, stage: &str, percentage: f64, step: &str) {
        if let Some(progress) = &self.progress {
            progress.update_stage(stage, percentage, step);
        }
    }

    /// The tvg ids of currently kept channels, deduplicated.
    pub fn kept_tvg_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .iter()
            .filter_map(|c| c.tvg_id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Summary returned to the generation job handler.
#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub channel_count: usize,
    pub program_count: usize,
    pub m3u_path: String,
    pub xmltv_path: String,
    pub counters: StageCounters,
}
