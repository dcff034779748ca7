//! Stream endpoints: how players reach the relay engine.
//!
//! `GET /proxy/{channelId}` serves the default variant;
//! `?format={mpegts|hls|dash}` selects an explicit one, with `seg=N` for
//! media segments and `init=v` for the DASH init segment.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use futures::TryStreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tracing::{debug, warn};
use ulid::Ulid;

/// Extracts `ConnectInfo<SocketAddr>` if present, without rejecting the
/// request when it isn't (mirrors the pre-0.8 `Option<ConnectInfo<T>>`
/// extractor behavior, which axum no longer provides directly).
pub(crate) struct OptionalConnectInfo(Option<ConnectInfo<SocketAddr>>);

impl<S> FromRequestParts<S> for OptionalConnectInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<ConnectInfo<SocketAddr>>().copied()))
    }
}

use crate::database::repositories::{ChannelRepository, StreamProxyRepository};
use crate::errors::AppError;
use crate::expression::RequestMeta;
use crate::models::relay::{ContainerFormat, SessionState};
use crate::models::{Channel, ProxyMode};
use crate::relay::buffer::SegmentLookup;
use crate::relay::{chunk_stream, ClientClassifier, RelayManager};
use crate::utils::UpstreamHttpClient;

pub struct StreamState {
    pub channels: ChannelRepository,
    pub proxies: StreamProxyRepository,
    pub relay: Arc<RelayManager>,
    pub classifier: Arc<ClientClassifier>,
    pub http: UpstreamHttpClient,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub format: Option<String>,
    pub seg: Option<u64>,
    pub init: Option<String>,
}

#[axum::debug_handler]
pub async fn stream_channel(
    State(state): State<Arc<StreamState>>,
    Path(channel_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    OptionalConnectInfo(connect_info): OptionalConnectInfo,
) -> Response {
    let Ok(channel_id) = Ulid::from_string(&channel_id) else {
        return (StatusCode::NOT_FOUND, "unknown channel").into_response();
    };
    let channel = match state.channels.find_by_id(channel_id).await {
        Ok(channel) => channel,
        Err(AppError::NotFound { .. }) => {
            return (StatusCode::NOT_FOUND, "unknown channel").into_response();
        }
        Err(e) => {
            warn!(error = %e, "channel lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
    };

    let mode = resolve_mode(&state, &channel).await;
    debug!(channel = %channel.id, mode = %mode, "stream request");

    match mode {
        ProxyMode::Redirect => Redirect::temporary(&channel.stream_url).into_response(),
        ProxyMode::Proxy => passthrough_response(&state, &channel).await,
        ProxyMode::Relay => {
            relay_response(&state, &channel, &query, &headers, connect_info).await
        }
    }
}

/// The endpoint is keyed by channel, not proxy; the serving mode comes
/// from an active proxy referencing the channel's source. Relay is the
/// default when none is found.
async fn resolve_mode(state: &StreamState, channel: &Channel) -> ProxyMode {
    match state.proxies.find_active().await {
        Ok(proxies) => proxies
            .iter()
            .find(|p| p.sources.iter().any(|s| s.source_id == channel.source_id))
            .map(|p| p.proxy_mode)
            .unwrap_or(ProxyMode::Relay),
        Err(e) => {
            warn!(error = %e, "proxy lookup failed, defaulting to relay");
            ProxyMode::Relay
        }
    }
}

/// One upstream pull per client, bytes forwarded untouched.
async fn passthrough_response(state: &StreamState, channel: &Channel) -> Response {
    match state.http.get_stream(&channel.stream_url).await {
        Ok(response) => {
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("video/MP2T")
                .to_string();
            let stream = response.bytes_stream().map_err(std::io::Error::other);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => upstream_error_response(e),
    }
}

async fn relay_response(
    state: &StreamState,
    channel: &Channel,
    query: &StreamQuery,
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let format_override = match query.format.as_deref() {
        None => None,
        Some("mpegts") => Some(ContainerFormat::Mpegts),
        Some("hls") => Some(ContainerFormat::HlsTs),
        Some("dash") => Some(ContainerFormat::Dash),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown format '{other}'"),
            )
                .into_response();
        }
    };

    let meta = RequestMeta {
        user_agent: header_string(headers, header::USER_AGENT),
        accept: header_string(headers, header::ACCEPT),
        remote_addr: connect_info.map(|ConnectInfo(addr)| addr.to_string()),
        format: query.format.clone(),
    };
    let (capabilities, matched_rule) = state.classifier.classify(&meta);

    let (session, client) = match state
        .relay
        .join(channel, &capabilities, matched_rule, &meta, format_override)
        .await
    {
        Ok(joined) => joined,
        Err(e) => return upstream_error_response(e),
    };

    if session.state() == SessionState::Fallback {
        let message = session
            .last_error()
            .unwrap_or_else(|| "relay session unavailable".to_string());
        session.remove_client(client.id);
        return (StatusCode::SERVICE_UNAVAILABLE, message).into_response();
    }

    match session.variant.container {
        ContainerFormat::Mpegts => {
            let stream = chunk_stream(session.clone(), client);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "video/MP2T")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        ContainerFormat::HlsTs | ContainerFormat::HlsFmp4 => {
            let response = hls_response(&session, channel, query);
            session.remove_client(client.id);
            response
        }
        ContainerFormat::Dash => {
            let response = dash_response(&session, channel, query);
            session.remove_client(client.id);
            response
        }
    }
}

fn hls_response(
    session: &Arc<crate::relay::RelaySession>,
    channel: &Channel,
    query: &StreamQuery,
) -> Response {
    let Some(segments) = session.segments.clone() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "segments unavailable").into_response();
    };

    if let Some(sequence) = query.seg {
        let content_type = match session.variant.container {
            ContainerFormat::HlsFmp4 => "video/mp4",
            _ => "video/MP2T",
        };
        return segment_response(segments.get(sequence), content_type);
    }

    let base = format!("/proxy/{}", channel.id);
    let playlist =
        segments.hls_playlist(&|sequence| format!("{base}?format=hls&seg={sequence}"));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        playlist,
    )
        .into_response()
}

fn dash_response(
    session: &Arc<crate::relay::RelaySession>,
    channel: &Channel,
    query: &StreamQuery,
) -> Response {
    let Some(segments) = session.segments.clone() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "segments unavailable").into_response();
    };

    if query.init.as_deref() == Some("v") {
        return match segments.init_segment() {
            Some(init) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "video/mp4")],
                init,
            )
                .into_response(),
            None => (StatusCode::NOT_FOUND, "init segment not available").into_response(),
        };
    }
    if let Some(sequence) = query.seg {
        return segment_response(segments.get(sequence), "video/mp4");
    }

    let base = format!("/proxy/{}", channel.id);
    let manifest = segments.dash_manifest(&base, "video/mp4");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/dash+xml")],
        manifest,
    )
        .into_response()
}

fn segment_response(lookup: SegmentLookup, content_type: &str) -> Response {
    match lookup {
        SegmentLookup::Found(segment) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type.to_string())],
            segment.data,
        )
            .into_response(),
        SegmentLookup::TooOld => {
            (StatusCode::NOT_FOUND, "segment past buffer horizon").into_response()
        }
        SegmentLookup::NotYet => (StatusCode::NOT_FOUND, "segment not available").into_response(),
    }
}

fn upstream_error_response(error: AppError) -> Response {
    match error {
        AppError::UpstreamTransient { .. } | AppError::CircuitOpen { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, error.to_string()).into_response()
        }
        AppError::NotFound { .. } => (StatusCode::NOT_FOUND, error.to_string()).into_response(),
        other => {
            warn!(error = %other, "stream request failed");
            (StatusCode::BAD_GATEWAY, other.to_string()).into_response()
        }
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
