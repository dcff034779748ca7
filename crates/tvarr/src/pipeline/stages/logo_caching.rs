//! Caches channel and program logos through the logo service and rewrites
//! records to the canonical in-service URL. Failures keep the original
//! URL; this stage is never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::AppResult;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::services::logo_cache::LogoCacheService;

pub struct LogoCachingStage {
    logos: Arc<LogoCacheService>,
}

impl LogoCachingStage {
    pub fn new(logos: Arc<LogoCacheService>) -> Self {
        Self { logos }
    }
}

fn is_absolute_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[async_trait]
impl PipelineStage for LogoCachingStage {
    fn name(&self) -> &'static str {
        "logos"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let mut wanted: Vec<String> = Vec::new();
        if ctx.proxy.cache_channel_logos {
            wanted.extend(
                ctx.channels
                    .iter()
                    .filter_map(|c| c.tvg_logo.clone())
                    .filter(|url| is_absolute_http(url)),
            );
        }
        if ctx.proxy.cache_program_logos {
            wanted.extend(
                ctx.programs
                    .iter()
                    .filter_map(|p| p.icon.clone())
                    .filter(|url| is_absolute_http(url)),
            );
        }
        wanted.sort();
        wanted.dedup();

        if wanted.is_empty() {
            ctx.counters.record("logos", 0, 0);
            return Ok(());
        }

        // The service bounds concurrency and collapses duplicate URLs; we
        // just fan the futures out.
        let mut rewrites: HashMap<String, String> = HashMap::new();
        let mut failed = 0usize;
        let results = futures::future::join_all(wanted.iter().map(|url| {
            let logos = self.logos.clone();
            let cancel = ctx.cancel.clone();
            async move { (url.clone(), logos.cache_logo(url, &cancel).await) }
        }))
        .await;

        for (url, result) in results {
            match result {
                Ok(path) => {
                    rewrites.insert(url, format!("{}/{}", ctx.base_url, path));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(_) => failed += 1,
            }
        }

        if ctx.proxy.cache_channel_logos {
            for channel in ctx.channels.iter_mut() {
                if let Some(logo) = &channel.tvg_logo
                    && let Some(cached) = rewrites.get(logo)
                {
                    channel.tvg_logo = Some(cached.clone());
                }
            }
        }
        if ctx.proxy.cache_program_logos {
            for program in ctx.programs.iter_mut() {
                if let Some(icon) = &program.icon
                    && let Some(cached) = rewrites.get(icon)
                {
                    program.icon = Some(cached.clone());
                }
            }
        }

        debug!(
            proxy = %ctx.proxy.name,
            cached = rewrites.len(),
            failed,
            "cached logos"
        );
        ctx.counters.record("logos", rewrites.len(), failed);
        ctx.stage_progress(
            "logos",
            100.0,
            &format!("{} cached, {failed} kept original", rewrites.len()),
        );
        Ok(())
    }
}
