//! Relay engine value types: codecs, containers, variants and routes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use ulid::Ulid;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
    Mpeg2,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Ac3,
    Eac3,
    Mp3,
    Opus,
}

/// Output container families the relay can produce.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Mpegts,
    HlsTs,
    HlsFmp4,
    Dash,
}

impl ContainerFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mpegts | Self::HlsTs => "video/MP2T",
            Self::HlsFmp4 => "video/mp4",
            Self::Dash => "application/dash+xml",
        }
    }

    /// Whether output is served as a playlist/manifest plus segments rather
    /// than one continuous byte stream.
    pub fn is_segmented(&self) -> bool {
        !matches!(self, Self::Mpegts)
    }
}

/// A concrete output shape; relay sessions are keyed by (channel, variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamVariant {
    pub container: ContainerFormat,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
}

impl StreamVariant {
    pub fn mpegts_default() -> Self {
        Self {
            container: ContainerFormat::Mpegts,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
        }
    }
}

impl std::fmt::Display for StreamVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}+{}",
            self.container, self.video_codec, self.audio_codec
        )
    }
}

/// The routing decision for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RelayRoute {
    /// Upstream bytes forwarded unchanged.
    Passthrough,
    /// Remux into the target container, codecs copied.
    Repackage,
    /// Full decode/encode into the target codecs.
    Transcode,
}

/// Codec facts learned by probing an upstream once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub container: ContainerFormat,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<f64>,
    pub bitrate: Option<u64>,
}

/// What a detected client class accepts and prefers. Produced by the
/// client-classification rules; consumed by routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    pub acceptable_video: Vec<VideoCodec>,
    pub acceptable_audio: Vec<AudioCodec>,
    pub preferred_container: ContainerFormat,
    pub preferred_video: VideoCodec,
    pub preferred_audio: AudioCodec,
    /// Forces a transcode even when codecs would otherwise pass through.
    pub transcode_profile: Option<String>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            acceptable_video: vec![VideoCodec::H264, VideoCodec::H265],
            acceptable_audio: vec![AudioCodec::Aac, AudioCodec::Ac3, AudioCodec::Mp3],
            preferred_container: ContainerFormat::Mpegts,
            preferred_video: VideoCodec::H264,
            preferred_audio: AudioCodec::Aac,
            transcode_profile: None,
        }
    }
}

/// Relay session lifecycle. `Fallback` keeps clients attached with an
/// explanatory error instead of disconnecting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Probing,
    Routing,
    Streaming,
    Fallback,
    Stopping,
    Gone,
}

/// Point-in-time view of one connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayClientStats {
    pub id: Uuid,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub egress_bytes_per_sec: f64,
    pub matched_rule: Option<String>,
}

/// Point-in-time view of one relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySessionStats {
    pub session_id: Uuid,
    pub channel_id: Ulid,
    pub variant: StreamVariant,
    pub route: Option<RelayRoute>,
    pub state: SessionState,
    pub upstream_bytes: u64,
    pub buffered_bytes: u64,
    pub dropped_samples: u64,
    pub clients: Vec<RelayClientStats>,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn container_content_types() {
        assert_eq!(ContainerFormat::Mpegts.content_type(), "video/MP2T");
        assert_eq!(
            ContainerFormat::Dash.content_type(),
            "application/dash+xml"
        );
        assert!(!ContainerFormat::Mpegts.is_segmented());
        assert!(ContainerFormat::HlsTs.is_segmented());
    }

    #[test]
    fn codec_names_round_trip() {
        assert_eq!(VideoCodec::from_str("h264").unwrap(), VideoCodec::H264);
        assert_eq!(AudioCodec::Eac3.to_string(), "eac3");
        assert_eq!(ContainerFormat::from_str("hls_ts").unwrap(), ContainerFormat::HlsTs);
    }

    #[test]
    fn variant_display_is_compact() {
        let v = StreamVariant::mpegts_default();
        assert_eq!(v.to_string(), "mpegts/h264+aac");
    }
}
