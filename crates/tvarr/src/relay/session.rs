//! A relay session: one upstream pull fanned out to N clients for one
//! (channel, variant) pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;
use uuid::Uuid;

use crate::models::relay::{
    RelayClientStats, RelayRoute, RelaySessionStats, SessionState, StreamVariant,
};

use super::buffer::{ReadOutcome, RelayBuffer, SegmentStore};

pub struct RelayClient {
    pub id: Uuid,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub matched_rule: Option<String>,
    pub connected_at: DateTime<Utc>,
    connected_instant: Instant,
    bytes_sent: AtomicU64,
}

impl RelayClient {
    fn new(
        remote_addr: Option<String>,
        user_agent: Option<String>,
        matched_rule: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            user_agent,
            matched_rule,
            connected_at: Utc::now(),
            connected_instant: Instant::now(),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn stats(&self) -> RelayClientStats {
        let connected_secs = self.connected_instant.elapsed().as_secs_f64().max(0.001);
        RelayClientStats {
            id: self.id,
            remote_addr: self.remote_addr.clone(),
            user_agent: self.user_agent.clone(),
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent(),
            egress_bytes_per_sec: self.bytes_sent() as f64 / connected_secs,
            matched_rule: self.matched_rule.clone(),
        }
    }
}

pub struct RelaySession {
    pub id: Uuid,
    pub channel_id: Ulid,
    pub variant: StreamVariant,
    pub upstream_url: String,
    pub buffer: Arc<RelayBuffer>,
    /// Present for segmented output containers.
    pub segments: Option<Arc<SegmentStore>>,
    state: RwLock<SessionState>,
    route: RwLock<Option<RelayRoute>>,
    clients: Mutex<HashMap<Uuid, Arc<RelayClient>>>,
    idle_since: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    upstream_bytes: AtomicU64,
    started_at: DateTime<Utc>,
    pub(super) cancel: CancellationToken,
}

impl RelaySession {
    pub fn new(
        channel_id: Ulid,
        upstream_url: String,
        variant: StreamVariant,
        buffer: Arc<RelayBuffer>,
        segments: Option<Arc<SegmentStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel_id,
            variant,
            upstream_url,
            buffer,
            segments,
            state: RwLock::new(SessionState::Starting),
            route: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
            idle_since: Mutex::new(Some(Instant::now())),
            last_error: Mutex::new(None),
            upstream_bytes: AtomicU64::new(0),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.read().expect("state lock poisoned").clone()
    }

    pub fn set_state(&self, state: SessionState) {
        debug!(session = %self.id, state = %state, "session state change");
        *self.state.write().expect("state lock poisoned") = state;
    }

    pub fn route(&self) -> Option<RelayRoute> {
        *self.route.read().expect("route lock poisoned")
    }

    pub fn set_route(&self, route: RelayRoute) {
        *self.route.write().expect("route lock poisoned") = Some(route);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("error lock poisoned").clone()
    }

    /// Enter fallback: clients stay attached and see the error; new joins
    /// still land until the reaper collects the session.
    pub fn fault(&self, error: impl Into<String>) {
        let error = error.into();
        info!(session = %self.id, error = %error, "session entering fallback");
        *self.last_error.lock().expect("error lock poisoned") = Some(error);
        self.set_state(SessionState::Fallback);
    }

    /// A stopping session rejects joins; the caller creates a fresh one.
    pub fn try_add_client(
        &self,
        remote_addr: Option<String>,
        user_agent: Option<String>,
        matched_rule: Option<String>,
    ) -> Option<Arc<RelayClient>> {
        if matches!(self.state(), SessionState::Stopping | SessionState::Gone) {
            return None;
        }
        let client = Arc::new(RelayClient::new(remote_addr, user_agent, matched_rule));
        self.clients
            .lock()
            .expect("clients lock poisoned")
            .insert(client.id, client.clone());
        *self.idle_since.lock().expect("idle lock poisoned") = None;
        debug!(session = %self.id, client = %client.id, "client joined");
        Some(client)
    }

    pub fn remove_client(&self, client_id: Uuid) {
        let mut clients = self.clients.lock().expect("clients lock poisoned");
        if clients.remove(&client_id).is_some() {
            debug!(session = %self.id, client = %client_id, "client left");
        }
        if clients.is_empty() {
            *self.idle_since.lock().expect("idle lock poisoned") = Some(Instant::now());
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients lock poisoned").len()
    }

    /// How long the session has been without clients.
    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since
            .lock()
            .expect("idle lock poisoned")
            .map(|since| since.elapsed())
    }

    pub fn add_upstream_bytes(&self, bytes: u64) {
        self.upstream_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upstream_bytes(&self) -> u64 {
        self.upstream_bytes.load(Ordering::Relaxed)
    }

    /// Begin teardown: reject joins, cancel the upstream driver.
    pub fn begin_stop(&self) {
        self.set_state(SessionState::Stopping);
        self.cancel.cancel();
    }

    pub fn stats(&self) -> RelaySessionStats {
        let clients = self
            .clients
            .lock()
            .expect("clients lock poisoned")
            .values()
            .map(|c| c.stats())
            .collect();
        RelaySessionStats {
            session_id: self.id,
            channel_id: self.channel_id,
            variant: self.variant,
            route: self.route(),
            state: self.state(),
            upstream_bytes: self.upstream_bytes(),
            buffered_bytes: self.buffer.buffered_bytes(),
            dropped_samples: self.buffer.dropped_chunks(),
            clients,
            started_at: self.started_at,
            last_error: self.last_error(),
        }
    }
}

/// Unregisters the client when the response stream drops.
pub struct ClientGuard {
    session: Arc<RelaySession>,
    client_id: Uuid,
}

impl ClientGuard {
    pub fn new(session: Arc<RelaySession>, client_id: Uuid) -> Self {
        Self { session, client_id }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.session.remove_client(self.client_id);
    }
}

enum ChunkStreamPhase {
    Streaming,
    Done,
}

struct ChunkStreamState {
    session: Arc<RelaySession>,
    client: Arc<RelayClient>,
    _guard: ClientGuard,
    cursor: u64,
    phase: ChunkStreamPhase,
}

/// The continuous MPEG-TS delivery stream for one client: follows the
/// buffer with a private cursor, ends on session teardown, and ends with
/// an error when the client lags past the horizon.
pub fn chunk_stream(
    session: Arc<RelaySession>,
    client: Arc<RelayClient>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let cursor = session.buffer.live_cursor();
    let guard = ClientGuard::new(session.clone(), client.id);
    let state = ChunkStreamState {
        session,
        client,
        _guard: guard,
        cursor,
        phase: ChunkStreamPhase::Streaming,
    };

    futures::stream::unfold(state, |mut state| async move {
        if matches!(state.phase, ChunkStreamPhase::Done) {
            return None;
        }
        loop {
            match state.session.state() {
                SessionState::Gone | SessionState::Stopping => return None,
                SessionState::Fallback => {
                    state.phase = ChunkStreamPhase::Done;
                    let message = state
                        .session
                        .last_error()
                        .unwrap_or_else(|| "relay session faulted".to_string());
                    return Some((
                        Err(std::io::Error::other(message)),
                        state,
                    ));
                }
                _ => {}
            }

            match state.session.buffer.read_after(state.cursor, 64) {
                ReadOutcome::Chunks {
                    chunks,
                    next_cursor,
                } => {
                    state.cursor = next_cursor;
                    let mut combined = BytesMut::new();
                    for chunk in &chunks {
                        combined.extend_from_slice(&chunk.data);
                    }
                    state.client.add_bytes_sent(combined.len() as u64);
                    return Some((Ok(combined.freeze()), state));
                }
                ReadOutcome::UpToDate => {
                    // Re-check session state at least once a second even
                    // when the producer stalls.
                    tokio::select! {
                        _ = state.session.buffer.wait_for_data() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                ReadOutcome::Lagged { oldest_available } => {
                    state.phase = ChunkStreamPhase::Done;
                    return Some((
                        Err(std::io::Error::other(format!(
                            "client lagged past buffer horizon (oldest available {oldest_available})"
                        ))),
                        state,
                    ));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::relay::ContainerFormat;
    use futures::StreamExt;

    fn session() -> Arc<RelaySession> {
        RelaySession::new(
            Ulid::new(),
            "http://up/ch.ts".to_string(),
            StreamVariant::mpegts_default(),
            Arc::new(RelayBuffer::new(1024 * 1024, 256)),
            None,
        )
    }

    #[test]
    fn join_and_leave_tracks_idleness() {
        let session = session();
        assert!(session.idle_for().is_some());

        let client = session
            .try_add_client(Some("127.0.0.1".into()), None, None)
            .unwrap();
        assert_eq!(session.client_count(), 1);
        assert!(session.idle_for().is_none());

        session.remove_client(client.id);
        assert_eq!(session.client_count(), 0);
        assert!(session.idle_for().is_some());
    }

    #[test]
    fn stopping_sessions_reject_joins() {
        let session = session();
        session.begin_stop();
        assert!(session.try_add_client(None, None, None).is_none());
    }

    #[tokio::test]
    async fn chunk_stream_delivers_and_counts_bytes() {
        let session = session();
        session.set_state(SessionState::Streaming);
        let client = session.try_add_client(None, None, None).unwrap();

        let mut stream = Box::pin(chunk_stream(session.clone(), client.clone()));
        session.buffer.push(Bytes::from_static(b"abcd"));
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(item, Bytes::from_static(b"abcd"));
        assert_eq!(client.bytes_sent(), 4);
    }

    #[tokio::test]
    async fn dropping_the_stream_unregisters_the_client() {
        let session = session();
        session.set_state(SessionState::Streaming);
        let client = session.try_add_client(None, None, None).unwrap();
        let stream = Box::pin(chunk_stream(session.clone(), client));
        assert_eq!(session.client_count(), 1);
        drop(stream);
        assert_eq!(session.client_count(), 0);
    }

    #[tokio::test]
    async fn fallback_surfaces_the_error_to_clients() {
        let session = session();
        session.set_state(SessionState::Streaming);
        let client = session.try_add_client(None, None, None).unwrap();
        let mut stream = Box::pin(chunk_stream(session.clone(), client));

        session.fault("codec change mid-stream");
        let item = stream.next().await.unwrap();
        let error = item.unwrap_err();
        assert!(error.to_string().contains("codec change"));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn stats_reflect_variant_and_route() {
        let session = session();
        session.set_route(RelayRoute::Passthrough);
        let stats = session.stats();
        assert_eq!(stats.variant.container, ContainerFormat::Mpegts);
        assert_eq!(stats.route, Some(RelayRoute::Passthrough));
    }
}
