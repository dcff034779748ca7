//! Session registry: join-or-create per (channel, variant), the upstream
//! driver task, and the idle reaper.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::RelayConfig;
use crate::errors::{AppError, AppResult};
use crate::expression::RequestMeta;
use crate::models::relay::{
    ClientCapabilities, ContainerFormat, RelayRoute, RelaySessionStats, SessionState,
    StreamVariant,
};
use crate::models::Channel;
use crate::utils::UpstreamHttpClient;

use super::buffer::{RelayBuffer, SegmentStore};
use super::probe::StreamProber;
use super::routing;
use super::segmenter::{Fmp4Segmenter, TsSegmenter};
use super::session::{RelayClient, RelaySession};
use super::transcoder::{TranscodeSpec, Transcoder};

type SessionKey = (Ulid, StreamVariant);

pub struct RelayManager {
    sessions: RwLock<HashMap<SessionKey, Arc<RelaySession>>>,
    prober: Arc<StreamProber>,
    transcoder: Arc<dyn Transcoder>,
    http: UpstreamHttpClient,
    config: RelayConfig,
}

impl RelayManager {
    pub fn new(
        prober: Arc<StreamProber>,
        transcoder: Arc<dyn Transcoder>,
        http: UpstreamHttpClient,
        config: RelayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            prober,
            transcoder,
            http,
            config,
        })
    }

    /// Join (or create) the session for a channel and the variant resolved
    /// from the client's capabilities. A variant change by the same player
    /// is simply a join against a differently-keyed session.
    pub async fn join(
        self: &Arc<Self>,
        channel: &Channel,
        capabilities: &ClientCapabilities,
        matched_rule: Option<String>,
        meta: &RequestMeta,
        format_override: Option<ContainerFormat>,
    ) -> AppResult<(Arc<RelaySession>, Arc<RelayClient>)> {
        let probe = self.prober.probe(channel.id, &channel.stream_url).await?;
        let variant = routing::resolve_variant(&probe, capabilities, format_override);
        let route = routing::decide_route(&probe, &variant, capabilities);
        let key = (channel.id, variant);

        loop {
            let session = {
                let sessions = self.sessions.read().await;
                sessions.get(&key).cloned()
            };

            let session = match session {
                Some(session) => session,
                None => {
                    let mut sessions = self.sessions.write().await;
                    if let Some(existing) = sessions.get(&key) {
                        existing.clone()
                    } else {
                        let created = self.open_session(channel, variant, route)?;
                        sessions.insert(key, created.clone());
                        created
                    }
                }
            };

            match session.try_add_client(
                meta.remote_addr.clone(),
                meta.user_agent.clone(),
                matched_rule.clone(),
            ) {
                Some(client) => return Ok((session, client)),
                None => {
                    // Stopping session: drop it from the registry and
                    // force a fresh create.
                    let mut sessions = self.sessions.write().await;
                    if let Some(existing) = sessions.get(&key)
                        && Arc::ptr_eq(existing, &session)
                    {
                        sessions.remove(&key);
                    }
                }
            }
        }
    }

    fn open_session(
        self: &Arc<Self>,
        channel: &Channel,
        variant: StreamVariant,
        route: RelayRoute,
    ) -> AppResult<Arc<RelaySession>> {
        let buffer = Arc::new(RelayBuffer::new(
            self.config.buffer_bytes,
            self.config.buffer_samples,
        ));
        let segments = if variant.container.is_segmented() {
            Some(Arc::new(SegmentStore::new(
                16,
                self.config.segment_duration.as_secs_f64(),
            )))
        } else {
            None
        };

        let session = RelaySession::new(
            channel.id,
            channel.stream_url.clone(),
            variant,
            buffer,
            segments,
        );
        session.set_route(route);
        info!(
            session = %session.id,
            channel = %channel.id,
            variant = %variant,
            route = %route,
            "created relay session"
        );

        let manager = self.clone();
        let driver_session = session.clone();
        tokio::spawn(async move {
            manager.drive_upstream(driver_session, route).await;
        });

        Ok(session)
    }

    /// The single upstream pull: connect (directly for passthrough,
    /// through the transcoder otherwise), feed the buffer/segmenter,
    /// retry with capped exponential backoff, and fault the session when
    /// the retry budget is gone.
    async fn drive_upstream(&self, session: Arc<RelaySession>, route: RelayRoute) {
        let cancel = session.cancel.clone();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            session.set_state(SessionState::Streaming);

            let result = self.pump_once(&session, route, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            attempt += 1;
            let error = match result {
                Ok(()) => "upstream ended".to_string(),
                Err(e) => e.to_string(),
            };
            if attempt > self.config.max_session_retries {
                session.fault(format!(
                    "upstream failed after {attempt} attempts: {error}"
                ));
                return;
            }

            let backoff = self
                .config
                .session_retry_backoff
                .saturating_mul(1u32 << (attempt - 1).min(8));
            warn!(
                session = %session.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "upstream pull failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => break,
            }
        }

        session.set_state(SessionState::Gone);
    }

    async fn pump_once(
        &self,
        session: &Arc<RelaySession>,
        route: RelayRoute,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let mut sink = OutputSink::new(session, &self.config);

        // Passthrough of a continuous TS can bypass ffmpeg entirely; any
        // remux, transcode or segmented output goes through the
        // transcoder interface.
        let direct = route == RelayRoute::Passthrough
            && session.variant.container == ContainerFormat::Mpegts;

        if direct {
            let response = self.http.get_stream(&session.upstream_url).await?;
            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    c = stream.next() => c,
                    _ = cancel.cancelled() => return Ok(()),
                };
                match chunk {
                    Some(Ok(data)) => sink.feed(session, &data),
                    Some(Err(e)) => {
                        return Err(AppError::upstream_transient(
                            crate::utils::http_client::host_of(&session.upstream_url),
                            e.to_string(),
                        ));
                    }
                    None => return Ok(()),
                }
            }
        } else {
            let spec = TranscodeSpec {
                input_url: session.upstream_url.clone(),
                route,
                target: session.variant,
            };
            let mut job = self.transcoder.submit(&spec).await?;
            loop {
                let chunk = tokio::select! {
                    c = job.output.next() => c,
                    _ = cancel.cancelled() => {
                        job.cancel.cancel();
                        return Ok(());
                    }
                };
                match chunk {
                    Some(Ok(data)) => sink.feed(session, &data),
                    Some(Err(e)) => {
                        job.cancel.cancel();
                        return Err(AppError::internal(format!("transcoder stream error: {e}")));
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Drop a channel's cached probe so the next join re-probes and
    /// re-routes.
    pub fn invalidate_probe(&self, channel_id: Ulid) {
        self.prober.invalidate(channel_id);
    }

    /// Collect idle and dead sessions. Runs until cancelled.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reap().await,
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    pub async fn reap(&self) {
        let mut doomed = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (key, session) in sessions.iter() {
                let gone = session.state() == SessionState::Gone;
                let idle_expired = session.client_count() == 0
                    && session
                        .idle_for()
                        .map(|idle| idle >= self.config.idle_grace)
                        .unwrap_or(false);
                if gone || idle_expired {
                    doomed.push(*key);
                }
            }
        }

        if doomed.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for key in doomed {
            if let Some(session) = sessions.remove(&key) {
                debug!(session = %session.id, "reaping idle session");
                session.begin_stop();
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.begin_stop();
        }
    }

    pub async fn stats(&self) -> Vec<RelaySessionStats> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.stats())
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Routes upstream bytes into the right structure for the variant:
/// continuous buffer for MPEG-TS, TS segmenter for HLS-TS, fMP4 splitter
/// for HLS-fMP4/DASH.
enum OutputSink {
    Continuous,
    Ts(TsSegmenter),
    Fmp4(Fmp4Segmenter),
}

impl OutputSink {
    fn new(session: &Arc<RelaySession>, config: &RelayConfig) -> Self {
        match (session.variant.container, session.segments.clone()) {
            (ContainerFormat::Mpegts, _) | (_, None) => Self::Continuous,
            (ContainerFormat::HlsTs, Some(store)) => Self::Ts(TsSegmenter::new(
                store,
                config.segment_duration.as_secs_f64(),
            )),
            (ContainerFormat::HlsFmp4 | ContainerFormat::Dash, Some(store)) => {
                Self::Fmp4(Fmp4Segmenter::new(store))
            }
        }
    }

    fn feed(&mut self, session: &Arc<RelaySession>, data: &[u8]) {
        session.add_upstream_bytes(data.len() as u64);
        match self {
            Self::Continuous => {
                session.buffer.push(bytes::Bytes::copy_from_slice(data));
            }
            Self::Ts(segmenter) => segmenter.feed(data),
            Self::Fmp4(segmenter) => segmenter.feed(data),
        }
    }
}
