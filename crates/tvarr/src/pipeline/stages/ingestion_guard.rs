//! Waits for in-flight ingestions of the proxy's sources before loading,
//! so generation never reads a half-replaced channel set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::progress::{ProgressBus, ProgressState};

pub struct IngestionGuardStage {
    bus: Arc<ProgressBus>,
    timeout: Duration,
}

impl IngestionGuardStage {
    pub fn new(bus: Arc<ProgressBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    fn active_ingestions(&self, ctx: &PipelineContext) -> usize {
        let mut active = 0;
        for binding in &ctx.sources {
            if let Some(event) = self.bus.latest_for(binding.source.id)
                && event.state == ProgressState::Running
            {
                active += 1;
            }
        }
        for binding in &ctx.epg_sources {
            if let Some(event) = self.bus.latest_for(binding.source.id)
                && event.state == ProgressState::Running
            {
                active += 1;
            }
        }
        active
    }
}

#[async_trait]
impl PipelineStage for IngestionGuardStage {
    fn name(&self) -> &'static str {
        "guard"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let active = self.active_ingestions(ctx);
            if active == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    proxy = %ctx.proxy.name,
                    active,
                    "ingestion guard timed out, proceeding with current data"
                );
                return Ok(());
            }
            debug!(proxy = %ctx.proxy.name, active, "waiting for source ingestions");
            ctx.stage_progress("guard", 50.0, &format!("{active} ingestions in flight"));

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = ctx.cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
    }
}
