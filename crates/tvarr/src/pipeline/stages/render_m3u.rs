//! Renders the proxy's M3U artifact: one EXTINF + URL pair per kept
//! channel, in numbering order. Stream URLs point at this service for
//! proxy/relay modes and at the upstream for redirect mode.

use async_trait::async_trait;
use tracing::debug;

use crate::errors::AppResult;
use crate::models::{Channel, ProxyMode};
use crate::pipeline::{PipelineContext, PipelineStage};

pub struct RenderM3uStage;

#[async_trait]
impl PipelineStage for RenderM3uStage {
    fn name(&self) -> &'static str {
        "render_m3u"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let mut output = String::with_capacity(ctx.channels.len() * 160 + 16);
        output.push_str("#EXTM3U\n");

        for channel in &ctx.channels {
            render_entry(&mut output, channel, ctx.proxy.proxy_mode, &ctx.base_url);
        }

        debug!(
            proxy = %ctx.proxy.name,
            channels = ctx.channels.len(),
            bytes = output.len(),
            "rendered m3u"
        );
        ctx.counters.record("render_m3u", ctx.channels.len(), 0);
        ctx.stage_progress("render_m3u", 100.0, &format!("{} entries", ctx.channels.len()));
        ctx.m3u_output = Some(output);
        Ok(())
    }
}

fn render_entry(output: &mut String, channel: &Channel, mode: ProxyMode, base_url: &str) {
    output.push_str("#EXTINF:-1");
    push_attr(output, "tvg-id", channel.tvg_id.as_deref());
    push_attr(output, "tvg-name", channel.tvg_name.as_deref());
    push_attr(
        output,
        "tvg-chno",
        channel.channel_number.map(|n| n.to_string()).as_deref(),
    );
    push_attr(output, "tvg-logo", absolute_logo(channel, base_url).as_deref());
    push_attr(output, "group-title", channel.group_title.as_deref());
    output.push(',');
    output.push_str(&channel.channel_name);
    output.push('\n');

    let url = match mode {
        ProxyMode::Redirect => channel.stream_url.clone(),
        ProxyMode::Proxy | ProxyMode::Relay => format!("{base_url}/proxy/{}", channel.id),
    };
    output.push_str(&url);
    output.push('\n');
}

fn push_attr(output: &mut String, key: &str, value: Option<&str>) {
    if let Some(value) = value
        && !value.is_empty()
    {
        output.push(' ');
        output.push_str(key);
        output.push_str("=\"");
        // Quotes cannot appear inside attribute values in this format.
        output.push_str(&value.replace('"', "'"));
        output.push('"');
    }
}

/// Already-absolute logo URLs pass through; cached relative paths gain
/// the configured base.
fn absolute_logo(channel: &Channel, base_url: &str) -> Option<String> {
    let logo = channel.tvg_logo.as_deref()?;
    if logo.is_empty() {
        return None;
    }
    if logo.starts_with("http://") || logo.starts_with("https://") {
        Some(logo.to_string())
    } else {
        Some(format!("{base_url}/{}", logo.trim_start_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    fn channel() -> Channel {
        Channel {
            id: Ulid::new(),
            source_id: Ulid::new(),
            external_id: None,
            tvg_id: Some("hbo.us".into()),
            tvg_name: Some("HBO".into()),
            tvg_logo: Some("http://logos/hbo.png".into()),
            group_title: Some("Movies".into()),
            channel_name: "HBO".into(),
            channel_number: Some(100),
            stream_url: "http://up/hbo.ts".into(),
            stream_type: None,
            language: None,
            country: None,
            is_adult: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn redirect_mode_keeps_upstream_urls() {
        let mut out = String::new();
        render_entry(&mut out, &channel(), ProxyMode::Redirect, "http://tvarr");
        assert!(out.contains("#EXTINF:-1 tvg-id=\"hbo.us\" tvg-name=\"HBO\" tvg-chno=\"100\""));
        assert!(out.contains("group-title=\"Movies\",HBO\n"));
        assert!(out.ends_with("http://up/hbo.ts\n"));
    }

    #[test]
    fn relay_mode_points_at_this_service() {
        let c = channel();
        let mut out = String::new();
        render_entry(&mut out, &c, ProxyMode::Relay, "http://tvarr");
        assert!(out.ends_with(&format!("http://tvarr/proxy/{}\n", c.id)));
    }

    #[test]
    fn cached_logo_paths_become_absolute() {
        let mut c = channel();
        c.tvg_logo = Some("logos/ab/abcdef.png".into());
        let mut out = String::new();
        render_entry(&mut out, &c, ProxyMode::Redirect, "http://tvarr");
        assert!(out.contains("tvg-logo=\"http://tvarr/logos/ab/abcdef.png\""));
    }

    #[test]
    fn round_trips_through_the_m3u_parser() {
        let mut out = String::from("#EXTM3U\n");
        render_entry(&mut out, &channel(), ProxyMode::Redirect, "http://tvarr");
        let parsed = crate::sources::m3u::parse_playlist(&out);
        assert_eq!(parsed.channels.len(), 1);
        let round = &parsed.channels[0];
        assert_eq!(round.channel_name, "HBO");
        assert_eq!(round.tvg_id.as_deref(), Some("hbo.us"));
        assert_eq!(round.group_title.as_deref(), Some("Movies"));
        assert_eq!(round.stream_url, "http://up/hbo.ts");
        assert_eq!(round.channel_number, Some(100));
    }
}
