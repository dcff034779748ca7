//! Routing: given probed source codecs and a target variant, choose
//! passthrough, repackage or transcode.

use crate::models::relay::{
    AudioCodec, ClientCapabilities, ContainerFormat, ProbeSummary, RelayRoute, StreamVariant,
    VideoCodec,
};

/// Static per-container codec compatibility tables.
pub fn compatible_video(container: ContainerFormat) -> &'static [VideoCodec] {
    match container {
        ContainerFormat::Mpegts | ContainerFormat::HlsTs => {
            &[VideoCodec::H264, VideoCodec::H265, VideoCodec::Mpeg2]
        }
        ContainerFormat::HlsFmp4 | ContainerFormat::Dash => &[
            VideoCodec::H264,
            VideoCodec::H265,
            VideoCodec::Vp9,
            VideoCodec::Av1,
        ],
    }
}

pub fn compatible_audio(container: ContainerFormat) -> &'static [AudioCodec] {
    match container {
        ContainerFormat::Mpegts | ContainerFormat::HlsTs => &[
            AudioCodec::Aac,
            AudioCodec::Ac3,
            AudioCodec::Eac3,
            AudioCodec::Mp3,
        ],
        ContainerFormat::HlsFmp4 | ContainerFormat::Dash => &[
            AudioCodec::Aac,
            AudioCodec::Ac3,
            AudioCodec::Eac3,
            AudioCodec::Mp3,
            AudioCodec::Opus,
        ],
    }
}

/// Resolve the output variant for a client before a session is keyed:
/// the container comes from an explicit `format` override or the client's
/// preference; codecs stay at the source's when the client accepts them
/// (enabling passthrough/repackage), otherwise the client's preferred.
pub fn resolve_variant(
    probe: &ProbeSummary,
    caps: &ClientCapabilities,
    format_override: Option<ContainerFormat>,
) -> StreamVariant {
    let container = format_override.unwrap_or(caps.preferred_container);

    let source_video = probe.video_codec.unwrap_or(VideoCodec::H264);
    let source_audio = probe.audio_codec.unwrap_or(AudioCodec::Aac);

    let video_codec = if caps.acceptable_video.contains(&source_video)
        && compatible_video(container).contains(&source_video)
    {
        source_video
    } else {
        caps.preferred_video
    };
    let audio_codec = if caps.acceptable_audio.contains(&source_audio)
        && compatible_audio(container).contains(&source_audio)
    {
        source_audio
    } else {
        caps.preferred_audio
    };

    StreamVariant {
        container,
        video_codec,
        audio_codec,
    }
}

/// The routing decision table. A transcode profile on the client class
/// forces a transcode regardless of codec compatibility.
pub fn decide_route(
    probe: &ProbeSummary,
    target: &StreamVariant,
    caps: &ClientCapabilities,
) -> RelayRoute {
    if caps.transcode_profile.is_some() {
        return RelayRoute::Transcode;
    }

    let source_video = probe.video_codec.unwrap_or(VideoCodec::H264);
    let source_audio = probe.audio_codec.unwrap_or(AudioCodec::Aac);

    let codecs_unchanged =
        target.video_codec == source_video && target.audio_codec == source_audio;
    let codecs_fit_container = compatible_video(target.container).contains(&target.video_codec)
        && compatible_audio(target.container).contains(&target.audio_codec);

    if !codecs_unchanged || !codecs_fit_container {
        return RelayRoute::Transcode;
    }

    if target.container == probe.container {
        RelayRoute::Passthrough
    } else {
        RelayRoute::Repackage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(container: ContainerFormat, v: VideoCodec, a: AudioCodec) -> ProbeSummary {
        ProbeSummary {
            container,
            video_codec: Some(v),
            audio_codec: Some(a),
            width: None,
            height: None,
            framerate: None,
            bitrate: None,
        }
    }

    #[test]
    fn matching_container_and_codecs_pass_through() {
        let p = probe(ContainerFormat::Mpegts, VideoCodec::H264, AudioCodec::Aac);
        let target = StreamVariant::mpegts_default();
        assert_eq!(
            decide_route(&p, &target, &ClientCapabilities::default()),
            RelayRoute::Passthrough
        );
    }

    #[test]
    fn container_change_with_compatible_codecs_repackages() {
        // TS h264+aac requested as HLS: remux only, no encoder.
        let p = probe(ContainerFormat::Mpegts, VideoCodec::H264, AudioCodec::Aac);
        let target = StreamVariant {
            container: ContainerFormat::HlsTs,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
        };
        assert_eq!(
            decide_route(&p, &target, &ClientCapabilities::default()),
            RelayRoute::Repackage
        );
    }

    #[test]
    fn codec_mismatch_transcodes() {
        // H.265+EAC3 source, legacy client wants H.264/AAC in TS.
        let p = probe(ContainerFormat::Mpegts, VideoCodec::H265, AudioCodec::Eac3);
        let target = StreamVariant {
            container: ContainerFormat::Mpegts,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
        };
        assert_eq!(
            decide_route(&p, &target, &ClientCapabilities::default()),
            RelayRoute::Transcode
        );
    }

    #[test]
    fn transcode_profile_forces_transcode() {
        let p = probe(ContainerFormat::Mpegts, VideoCodec::H264, AudioCodec::Aac);
        let caps = ClientCapabilities {
            transcode_profile: Some("1080p".to_string()),
            ..ClientCapabilities::default()
        };
        assert_eq!(
            decide_route(&p, &StreamVariant::mpegts_default(), &caps),
            RelayRoute::Transcode
        );
    }

    #[test]
    fn vp9_is_rejected_in_ts_containers() {
        assert!(!compatible_video(ContainerFormat::Mpegts).contains(&VideoCodec::Vp9));
        assert!(compatible_video(ContainerFormat::Dash).contains(&VideoCodec::Vp9));
        assert!(!compatible_audio(ContainerFormat::HlsTs).contains(&AudioCodec::Opus));
        assert!(compatible_audio(ContainerFormat::HlsFmp4).contains(&AudioCodec::Opus));
    }

    #[test]
    fn variant_keeps_source_codecs_when_acceptable() {
        let p = probe(ContainerFormat::Mpegts, VideoCodec::H265, AudioCodec::Ac3);
        let caps = ClientCapabilities::default();
        let variant = resolve_variant(&p, &caps, None);
        assert_eq!(variant.video_codec, VideoCodec::H265);
        assert_eq!(variant.audio_codec, AudioCodec::Ac3);
        assert_eq!(variant.container, ContainerFormat::Mpegts);
    }

    #[test]
    fn variant_falls_back_to_preferred_codecs() {
        let p = probe(ContainerFormat::Mpegts, VideoCodec::Av1, AudioCodec::Opus);
        let caps = ClientCapabilities::default();
        let variant = resolve_variant(&p, &caps, None);
        // AV1/Opus are outside the default acceptable set and outside TS
        // compatibility: the preferred codecs take over.
        assert_eq!(variant.video_codec, VideoCodec::H264);
        assert_eq!(variant.audio_codec, AudioCodec::Aac);
    }

    #[test]
    fn format_override_wins_the_container() {
        let p = probe(ContainerFormat::Mpegts, VideoCodec::H264, AudioCodec::Aac);
        let variant = resolve_variant(&p, &ClientCapabilities::default(), Some(ContainerFormat::Dash));
        assert_eq!(variant.container, ContainerFormat::Dash);
    }
}
