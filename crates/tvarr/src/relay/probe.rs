//! Upstream codec probing.
//!
//! One ffprobe pass per (channel, url), cached until explicitly
//! invalidated. A mid-stream codec change is handled by faulting the
//! session and re-probing on the next create, never by repairing an
//! in-flight session.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::errors::{AppError, AppResult};
use crate::models::relay::{AudioCodec, ContainerFormat, ProbeSummary, VideoCodec};

pub struct StreamProber {
    ffprobe_path: String,
    timeout: Duration,
    cache: Mutex<HashMap<(Ulid, String), ProbeSummary>>,
}

impl StreamProber {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probe a channel's upstream, consulting the cache first.
    pub async fn probe(&self, channel_id: Ulid, url: &str) -> AppResult<ProbeSummary> {
        let key = (channel_id, url.to_string());
        if let Some(cached) = self.cache.lock().expect("probe cache poisoned").get(&key) {
            return Ok(cached.clone());
        }

        let summary = self.probe_uncached(url).await?;
        self.cache
            .lock()
            .expect("probe cache poisoned")
            .insert(key, summary.clone());
        Ok(summary)
    }

    /// Drop a channel's cached probes; the next create re-probes.
    pub fn invalidate(&self, channel_id: Ulid) {
        self.cache
            .lock()
            .expect("probe cache poisoned")
            .retain(|(id, _), _| *id != channel_id);
    }

    async fn probe_uncached(&self, url: &str) -> AppResult<ProbeSummary> {
        debug!(url, "probing upstream");
        let mut command = Command::new(&self.ffprobe_path);
        command
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
                "-analyzeduration",
                "5000000",
                "-probesize",
                "5000000",
            ])
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                AppError::upstream_transient("probe", format!("ffprobe timed out after {:?}", self.timeout))
            })?
            .map_err(|e| AppError::internal(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url, stderr = %stderr, "ffprobe failed");
            return Err(AppError::upstream_transient(
                "probe",
                format!("ffprobe exited with {}", output.status),
            ));
        }

        let parsed: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::upstream_permanent("probe", format!("bad ffprobe output: {e}")))?;
        Ok(parse_probe_output(&parsed))
    }
}

/// Map ffprobe JSON into the routing summary.
pub fn parse_probe_output(data: &Value) -> ProbeSummary {
    let mut summary = ProbeSummary {
        container: ContainerFormat::Mpegts,
        video_codec: None,
        audio_codec: None,
        width: None,
        height: None,
        framerate: None,
        bitrate: None,
    };

    if let Some(format_name) = data.pointer("/format/format_name").and_then(|v| v.as_str()) {
        summary.container = container_from_format_name(format_name);
    }
    summary.bitrate = data
        .pointer("/format/bit_rate")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());

    if let Some(streams) = data.get("streams").and_then(|v| v.as_array()) {
        for stream in streams {
            let codec_type = stream.get("codec_type").and_then(|v| v.as_str());
            let codec_name = stream.get("codec_name").and_then(|v| v.as_str());
            match codec_type {
                Some("video") if summary.video_codec.is_none() => {
                    summary.video_codec = codec_name.and_then(video_codec_from_name);
                    summary.width = stream.get("width").and_then(|v| v.as_u64()).map(|v| v as u32);
                    summary.height =
                        stream.get("height").and_then(|v| v.as_u64()).map(|v| v as u32);
                    summary.framerate = stream
                        .get("r_frame_rate")
                        .and_then(|v| v.as_str())
                        .and_then(parse_frame_rate);
                }
                Some("audio") if summary.audio_codec.is_none() => {
                    summary.audio_codec = codec_name.and_then(audio_codec_from_name);
                }
                _ => {}
            }
        }
    }

    summary
}

fn container_from_format_name(format_name: &str) -> ContainerFormat {
    if format_name.contains("hls") {
        ContainerFormat::HlsTs
    } else if format_name.contains("mpegts") {
        ContainerFormat::Mpegts
    } else if format_name.contains("mp4") || format_name.contains("mov") {
        ContainerFormat::HlsFmp4
    } else if format_name.contains("dash") {
        ContainerFormat::Dash
    } else {
        ContainerFormat::Mpegts
    }
}

fn video_codec_from_name(name: &str) -> Option<VideoCodec> {
    match name {
        "h264" | "avc" => Some(VideoCodec::H264),
        "hevc" | "h265" => Some(VideoCodec::H265),
        "vp9" => Some(VideoCodec::Vp9),
        "av1" => Some(VideoCodec::Av1),
        "mpeg2video" => Some(VideoCodec::Mpeg2),
        _ => None,
    }
}

fn audio_codec_from_name(name: &str) -> Option<AudioCodec> {
    match name {
        "aac" => Some(AudioCodec::Aac),
        "ac3" => Some(AudioCodec::Ac3),
        "eac3" => Some(AudioCodec::Eac3),
        "mp3" | "mp2" => Some(AudioCodec::Mp3),
        "opus" => Some(AudioCodec::Opus),
        _ => None,
    }
}

fn parse_frame_rate(value: &str) -> Option<f64> {
    let (numerator, denominator) = value.split_once('/')?;
    let numerator: f64 = numerator.parse().ok()?;
    let denominator: f64 = denominator.parse().ok()?;
    if denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_typical_ts_probe() {
        let data = json!({
            "format": {"format_name": "mpegts", "bit_rate": "5000000"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "r_frame_rate": "25/1"},
                {"codec_type": "audio", "codec_name": "aac"}
            ]
        });
        let summary = parse_probe_output(&data);
        assert_eq!(summary.container, ContainerFormat::Mpegts);
        assert_eq!(summary.video_codec, Some(VideoCodec::H264));
        assert_eq!(summary.audio_codec, Some(AudioCodec::Aac));
        assert_eq!(summary.width, Some(1920));
        assert_eq!(summary.framerate, Some(25.0));
        assert_eq!(summary.bitrate, Some(5_000_000));
    }

    #[test]
    fn parses_hls_hevc_eac3() {
        let data = json!({
            "format": {"format_name": "hls"},
            "streams": [
                {"codec_type": "video", "codec_name": "hevc"},
                {"codec_type": "audio", "codec_name": "eac3"}
            ]
        });
        let summary = parse_probe_output(&data);
        assert_eq!(summary.container, ContainerFormat::HlsTs);
        assert_eq!(summary.video_codec, Some(VideoCodec::H265));
        assert_eq!(summary.audio_codec, Some(AudioCodec::Eac3));
    }

    #[test]
    fn unknown_codecs_stay_none() {
        let data = json!({
            "format": {"format_name": "mpegts"},
            "streams": [{"codec_type": "video", "codec_name": "theora"}]
        });
        let summary = parse_probe_output(&data);
        assert_eq!(summary.video_codec, None);
    }
}
