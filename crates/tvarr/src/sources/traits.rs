//! Source handler contracts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::AppResult;
use crate::models::{EpgSource, StreamSource};
use crate::progress::ProgressHandle;

/// The staged progress every ingestion reports.
pub const INGEST_STAGES: &[&str] = &["fetch", "parse", "store"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Rows now owned by the source (channels or programs).
    pub records: usize,
    /// Malformed or duplicate entries dropped along the way.
    pub skipped: usize,
}

#[async_trait]
pub trait StreamSourceHandler: Send + Sync {
    /// Fetch, parse and bulk-replace the source's channels. Progress is
    /// emitted per stage; the caller owns source status transitions.
    async fn ingest(
        &self,
        source: &StreamSource,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome>;
}

#[async_trait]
pub trait EpgSourceHandler: Send + Sync {
    async fn ingest(
        &self,
        source: &EpgSource,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome>;
}
