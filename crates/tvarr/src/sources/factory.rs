//! Handler selection by source kind.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::database::repositories::{ChannelRepository, EpgProgramRepository};
use crate::errors::AppResult;
use crate::models::{EpgSourceKind, StreamSource, StreamSourceKind};
use crate::progress::ProgressHandle;
use crate::utils::UpstreamHttpClient;

use super::m3u::M3uHandler;
use super::traits::{EpgSourceHandler, IngestOutcome, StreamSourceHandler};
use super::xmltv::XmltvEpgHandler;
use super::xtream::{XtreamEpgHandler, XtreamHandler};

/// Manual sources are user-managed: ingestion touches nothing and reports
/// the rows already present.
struct ManualHandler {
    channels: ChannelRepository,
}

#[async_trait]
impl StreamSourceHandler for ManualHandler {
    async fn ingest(
        &self,
        source: &StreamSource,
        progress: &ProgressHandle,
        _cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome> {
        let records = self.channels.count_for_source(source.id).await? as usize;
        progress.complete_stage("fetch");
        progress.complete_stage("parse");
        progress.complete_stage("store");
        Ok(IngestOutcome {
            records,
            skipped: 0,
        })
    }
}

pub struct SourceHandlerFactory {
    m3u: Arc<M3uHandler>,
    xtream: Arc<XtreamHandler>,
    manual: Arc<ManualHandler>,
    xmltv_epg: Arc<XmltvEpgHandler>,
    xtream_epg: Arc<XtreamEpgHandler>,
}

impl SourceHandlerFactory {
    pub fn new(
        http: UpstreamHttpClient,
        channels: ChannelRepository,
        programs: EpgProgramRepository,
        batch_size: usize,
    ) -> Self {
        Self {
            m3u: Arc::new(M3uHandler::new(http.clone(), channels.clone(), batch_size)),
            xtream: Arc::new(XtreamHandler::new(http.clone(), channels.clone(), batch_size)),
            manual: Arc::new(ManualHandler { channels }),
            xmltv_epg: Arc::new(XmltvEpgHandler::new(
                http.clone(),
                programs.clone(),
                batch_size,
            )),
            xtream_epg: Arc::new(XtreamEpgHandler::new(XmltvEpgHandler::new(
                http, programs, batch_size,
            ))),
        }
    }

    pub fn stream_handler(&self, kind: StreamSourceKind) -> Arc<dyn StreamSourceHandler> {
        match kind {
            StreamSourceKind::M3u => self.m3u.clone(),
            StreamSourceKind::Xtream => self.xtream.clone(),
            StreamSourceKind::Manual => self.manual.clone(),
        }
    }

    pub fn epg_handler(&self, kind: EpgSourceKind) -> Arc<dyn EpgSourceHandler> {
        match kind {
            EpgSourceKind::Xmltv => self.xmltv_epg.clone(),
            EpgSourceKind::Xtream => self.xtream_epg.clone(),
        }
    }
}
