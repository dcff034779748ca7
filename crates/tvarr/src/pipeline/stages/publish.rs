//! Publishes the rendered artifacts: temp file, fsync, atomic rename.
//! Readers of `<proxyId>.m3u` / `<proxyId>.xmltv` never see partials.

use async_trait::async_trait;
use sandbox_fs::SandboxRoot;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::pipeline::{PipelineContext, PipelineStage};

pub struct PublishStage {
    sandbox: SandboxRoot,
}

impl PublishStage {
    pub fn new(sandbox: SandboxRoot) -> Self {
        Self { sandbox }
    }

    pub fn m3u_path(proxy_id: ulid::Ulid) -> String {
        format!("{proxy_id}.m3u")
    }

    pub fn xmltv_path(proxy_id: ulid::Ulid) -> String {
        format!("{proxy_id}.xmltv")
    }
}

#[async_trait]
impl PipelineStage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let m3u = ctx
            .m3u_output
            .take()
            .ok_or_else(|| AppError::internal("publish ran before render_m3u"))?;
        let xmltv = ctx
            .xmltv_output
            .take()
            .ok_or_else(|| AppError::internal("publish ran before render_xmltv"))?;

        let m3u_path = Self::m3u_path(ctx.proxy.id);
        let xmltv_path = Self::xmltv_path(ctx.proxy.id);

        self.sandbox.write_atomic(&m3u_path, m3u.as_bytes()).await?;
        self.sandbox
            .write_atomic(&xmltv_path, xmltv.as_bytes())
            .await?;

        info!(
            proxy = %ctx.proxy.name,
            m3u = %m3u_path,
            xmltv = %xmltv_path,
            "published proxy artifacts"
        );
        ctx.counters.record("publish", 2, 0);
        ctx.stage_progress("publish", 100.0, "artifacts published");
        Ok(())
    }
}
