//! Loads channels from the proxy's sources in priority order, resolving
//! duplicates: the key is tvg_id (or the lowercased name when unset), the
//! earlier-evaluated source wins.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::database::repositories::ChannelRepository;
use crate::errors::AppResult;
use crate::pipeline::{PipelineContext, PipelineStage};

pub struct LoadChannelsStage {
    channels: ChannelRepository,
}

impl LoadChannelsStage {
    pub fn new(channels: ChannelRepository) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl PipelineStage for LoadChannelsStage {
    fn name(&self) -> &'static str {
        "load_channels"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut kept = Vec::new();
        let mut removed = 0usize;

        let total = ctx.sources.len().max(1);
        for (index, binding) in ctx.sources.clone().iter().enumerate() {
            if !binding.source.is_active {
                continue;
            }
            let channels = self.channels.find_by_source(binding.source.id).await?;
            for channel in channels {
                let key = channel
                    .tvg_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .map(|id| format!("id:{id}"))
                    .unwrap_or_else(|| format!("name:{}", channel.channel_name.to_lowercase()));
                if seen.insert(key) {
                    kept.push(channel);
                } else {
                    removed += 1;
                }
            }
            ctx.stage_progress(
                "load_channels",
                ((index + 1) as f64 / total as f64) * 100.0,
                &binding.source.name,
            );
        }

        debug!(
            proxy = %ctx.proxy.name,
            kept = kept.len(),
            duplicates = removed,
            "loaded channels"
        );
        ctx.counters.record("load_channels", kept.len(), removed);
        ctx.channels = kept;
        Ok(())
    }
}
