//! The transcoder seam.
//!
//! The relay sees one interface: submit a job, read the output byte
//! stream, cancel. The local implementation spawns ffmpeg; a remote
//! transcoder daemon honors the same contract over its RPC stream and is
//! configured in place of this one.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::models::relay::{AudioCodec, ContainerFormat, RelayRoute, StreamVariant, VideoCodec};

/// One submission: where to pull, what to produce, and how.
#[derive(Debug, Clone)]
pub struct TranscodeSpec {
    pub input_url: String,
    pub route: RelayRoute,
    pub target: StreamVariant,
}

/// A running job: the output byte stream plus its cancel handle.
/// Cancelling stops the underlying process or remote job.
pub struct MediaJob {
    pub output: std::pin::Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn submit(&self, spec: &TranscodeSpec) -> AppResult<MediaJob>;
}

/// Local ffmpeg child process.
pub struct LocalFfmpegTranscoder {
    ffmpeg_path: String,
}

impl LocalFfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

#[async_trait]
impl Transcoder for LocalFfmpegTranscoder {
    async fn submit(&self, spec: &TranscodeSpec) -> AppResult<MediaJob> {
        let args = build_ffmpeg_args(spec);
        debug!(args = ?args, "spawning ffmpeg");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::internal(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::internal("ffmpeg stdout not captured"))?;

        let cancel = CancellationToken::new();
        let kill_token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = kill_token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill ffmpeg");
                    }
                }
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            debug!("ffmpeg exited cleanly");
                        }
                        Ok(status) => warn!(%status, "ffmpeg exited"),
                        Err(e) => warn!(error = %e, "ffmpeg wait failed"),
                    }
                }
            }
        });

        Ok(MediaJob {
            output: Box::pin(tokio_util::io::ReaderStream::with_capacity(
                stdout,
                64 * 1024,
            )),
            cancel,
        })
    }
}

/// Build the ffmpeg invocation for a spec.
///
/// MPEG-TS outputs carry the container conditioning late joiners need:
/// Annex B NAL format, parameter sets repeated at keyframes, PAT/PMT at
/// a 0.1 s period, and regenerated timestamps.
pub fn build_ffmpeg_args(spec: &TranscodeSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-fflags".into(),
        "+discardcorrupt+genpts".into(),
        "-i".into(),
        spec.input_url.clone(),
    ];

    match spec.route {
        RelayRoute::Passthrough | RelayRoute::Repackage => {
            args.extend(["-c:v".into(), "copy".into(), "-c:a".into(), "copy".into()]);
        }
        RelayRoute::Transcode => {
            args.extend([
                "-c:v".into(),
                video_encoder(spec.target.video_codec).into(),
                "-preset".into(),
                "veryfast".into(),
                "-c:a".into(),
                audio_encoder(spec.target.audio_codec).into(),
            ]);
        }
    }

    let ts_output = matches!(
        spec.target.container,
        ContainerFormat::Mpegts | ContainerFormat::HlsTs
    );
    if ts_output {
        if spec.route != RelayRoute::Transcode {
            // Copied streams may arrive length-prefixed; TS requires
            // Annex B with in-band parameter sets.
            let bsf = match spec.target.video_codec {
                VideoCodec::H265 => "hevc_mp4toannexb",
                _ => "h264_mp4toannexb",
            };
            args.extend(["-bsf:v".into(), bsf.into()]);
        }
        args.extend([
            "-f".into(),
            "mpegts".into(),
            "-mpegts_flags".into(),
            "+resend_headers".into(),
            "-pat_period".into(),
            "0.1".into(),
        ]);
    } else {
        args.extend([
            "-f".into(),
            "mp4".into(),
            "-movflags".into(),
            "frag_keyframe+empty_moov+default_base_moof".into(),
        ]);
    }

    args.extend([
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "pipe:1".into(),
    ]);
    args
}

fn video_encoder(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::H265 => "libx265",
        VideoCodec::Vp9 => "libvpx-vp9",
        VideoCodec::Av1 => "libsvtav1",
        VideoCodec::Mpeg2 => "mpeg2video",
    }
}

fn audio_encoder(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "aac",
        AudioCodec::Ac3 => "ac3",
        AudioCodec::Eac3 => "eac3",
        AudioCodec::Mp3 => "libmp3lame",
        AudioCodec::Opus => "libopus",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(route: RelayRoute, container: ContainerFormat) -> TranscodeSpec {
        TranscodeSpec {
            input_url: "http://up/ch.ts".to_string(),
            route,
            target: StreamVariant {
                container,
                video_codec: VideoCodec::H264,
                audio_codec: AudioCodec::Aac,
            },
        }
    }

    #[test]
    fn repackage_copies_codecs_and_conditions_ts() {
        let args = build_ffmpeg_args(&spec(RelayRoute::Repackage, ContainerFormat::HlsTs));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-bsf:v h264_mp4toannexb"));
        assert!(joined.contains("-mpegts_flags +resend_headers"));
        assert!(joined.contains("-pat_period 0.1"));
        assert!(joined.contains("-avoid_negative_ts make_zero"));
        assert!(joined.contains("+discardcorrupt"));
        assert!(!joined.contains("libx264"));
    }

    #[test]
    fn transcode_engages_encoders() {
        let args = build_ffmpeg_args(&spec(RelayRoute::Transcode, ContainerFormat::Mpegts));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-c:a aac"));
        assert!(!joined.contains("copy"));
    }

    #[test]
    fn hevc_targets_use_the_hevc_bitstream_filter() {
        let mut s = spec(RelayRoute::Repackage, ContainerFormat::Mpegts);
        s.target.video_codec = VideoCodec::H265;
        let joined = build_ffmpeg_args(&s).join(" ");
        assert!(joined.contains("hevc_mp4toannexb"));
    }

    #[test]
    fn fmp4_targets_fragment_for_dash() {
        let args = build_ffmpeg_args(&spec(RelayRoute::Repackage, ContainerFormat::Dash));
        let joined = args.join(" ");
        assert!(joined.contains("-f mp4"));
        assert!(joined.contains("frag_keyframe"));
        assert!(!joined.contains("mpegts_flags"));
    }
}
