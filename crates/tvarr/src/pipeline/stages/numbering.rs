//! Assigns channel numbers per the proxy's numbering mode. Numbers are
//! unique and stable within one run.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;
use ulid::Ulid;

use crate::errors::AppResult;
use crate::models::NumberingMode;
use crate::pipeline::{PipelineContext, PipelineStage};

pub struct NumberingStage;

#[async_trait]
impl PipelineStage for NumberingStage {
    fn name(&self) -> &'static str {
        "numbering"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        match ctx.proxy.numbering_mode {
            NumberingMode::Sequential => {
                let start = ctx.proxy.starting_channel_number.max(1);
                for (offset, channel) in ctx.channels.iter_mut().enumerate() {
                    channel.channel_number = Some(start + offset as i32);
                }
            }
            NumberingMode::Preserve => {
                assign_preserving(ctx);
            }
            NumberingMode::SourceBased => {
                // Bucket by the 1-based priority index of the owning source.
                let bucket_of = |source_id: Ulid| -> i32 {
                    ctx.sources
                        .iter()
                        .position(|b| b.source.id == source_id)
                        .map(|p| p as i32 + 1)
                        .unwrap_or(1)
                };
                let mut counters: std::collections::HashMap<i32, i32> =
                    std::collections::HashMap::new();
                for channel in ctx.channels.iter_mut() {
                    let bucket = bucket_of(channel.source_id);
                    let k = counters.entry(bucket).or_insert(0);
                    *k += 1;
                    channel.channel_number = Some(1000 * bucket + *k);
                }
            }
        }

        // Sort into numbering order for the render stages.
        ctx.channels
            .sort_by_key(|c| c.channel_number.unwrap_or(i32::MAX));

        debug!(
            proxy = %ctx.proxy.name,
            mode = %ctx.proxy.numbering_mode,
            channels = ctx.channels.len(),
            "assigned channel numbers"
        );
        ctx.counters.record("numbering", ctx.channels.len(), 0);
        ctx.stage_progress("numbering", 100.0, &ctx.proxy.numbering_mode.to_string());
        Ok(())
    }
}

/// Preserve incoming numbers; conflicts and unnumbered channels shift to
/// the next free integer. Channels arrive in source-priority order, so the
/// higher-priority holder keeps its number.
fn assign_preserving(ctx: &mut PipelineContext) {
    let mut used: HashSet<i32> = HashSet::new();
    let floor = ctx.proxy.starting_channel_number.max(1);
    let mut next_free = floor;

    let mut take_next_free = |used: &mut HashSet<i32>, from: i32| -> i32 {
        let mut candidate = from.max(floor);
        while used.contains(&candidate) {
            candidate += 1;
        }
        used.insert(candidate);
        candidate
    };

    for channel in ctx.channels.iter_mut() {
        match channel.channel_number {
            Some(wanted) if wanted >= 1 && !used.contains(&wanted) => {
                used.insert(wanted);
            }
            Some(wanted) if wanted >= 1 => {
                // Conflict: shift up to the next free number.
                channel.channel_number = Some(take_next_free(&mut used, wanted + 1));
            }
            _ => {
                let assigned = take_next_free(&mut used, next_free);
                next_free = assigned + 1;
                channel.channel_number = Some(assigned);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Channel, NumberingMode, ProxyMode, ProxyStatus, StreamProxy,
    };
    use crate::pipeline::context::PipelineContext;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn proxy(mode: NumberingMode, start: i32) -> StreamProxy {
        StreamProxy {
            id: Ulid::new(),
            name: "test".into(),
            description: None,
            proxy_mode: ProxyMode::Redirect,
            is_active: true,
            auto_regenerate: false,
            starting_channel_number: start,
            numbering_mode: mode,
            cache_channel_logos: false,
            cache_program_logos: false,
            status: ProxyStatus::Pending,
            last_generated_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            sources: Vec::new(),
            epg_sources: Vec::new(),
        }
    }

    fn channel(name: &str, number: Option<i32>) -> Channel {
        Channel {
            id: Ulid::new(),
            source_id: Ulid::new(),
            external_id: None,
            tvg_id: None,
            tvg_name: None,
            tvg_logo: None,
            group_title: None,
            channel_name: name.into(),
            channel_number: number,
            stream_url: "http://u/x.ts".into(),
            stream_type: None,
            language: None,
            country: None,
            is_adult: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn context(mode: NumberingMode, start: i32, channels: Vec<Channel>) -> PipelineContext {
        let mut ctx = PipelineContext::new(
            proxy(mode, start),
            Vec::new(),
            Vec::new(),
            "http://localhost".into(),
            CancellationToken::new(),
            None,
        );
        ctx.channels = channels;
        ctx
    }

    #[tokio::test]
    async fn sequential_numbers_from_start() {
        let mut ctx = context(
            NumberingMode::Sequential,
            100,
            vec![channel("a", Some(7)), channel("b", None), channel("c", Some(1))],
        );
        NumberingStage.execute(&mut ctx).await.unwrap();
        let numbers: Vec<i32> = ctx.channels.iter().filter_map(|c| c.channel_number).collect();
        assert_eq!(numbers, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn preserve_keeps_numbers_and_shifts_conflicts() {
        let mut ctx = context(
            NumberingMode::Preserve,
            1,
            vec![
                channel("keeps-5", Some(5)),
                channel("conflicts-5", Some(5)),
                channel("unnumbered", None),
            ],
        );
        NumberingStage.execute(&mut ctx).await.unwrap();
        let mut by_name: std::collections::HashMap<String, i32> = ctx
            .channels
            .iter()
            .map(|c| (c.channel_name.clone(), c.channel_number.unwrap()))
            .collect();
        assert_eq!(by_name.remove("keeps-5"), Some(5));
        assert_eq!(by_name.remove("conflicts-5"), Some(6));
        assert_eq!(by_name.remove("unnumbered"), Some(1));
    }

    #[tokio::test]
    async fn numbers_are_unique() {
        let mut ctx = context(
            NumberingMode::Preserve,
            1,
            (0..50).map(|i| channel(&format!("c{i}"), Some(i % 10))).collect(),
        );
        NumberingStage.execute(&mut ctx).await.unwrap();
        let mut seen = HashSet::new();
        for c in &ctx.channels {
            assert!(seen.insert(c.channel_number.unwrap()));
        }
    }
}
