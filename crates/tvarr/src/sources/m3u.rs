//! M3U playlist source handler.
//!
//! Parsing is a two-state line machine: waiting for `#EXTINF`, then
//! waiting for the stream URL. Other `#` lines (`#EXTVLCOPT:` and friends)
//! are ignored. Malformed entries and duplicate (url, name) pairs are
//! counted and skipped, never fatal.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::database::repositories::{ChannelRepository, NewChannel};
use crate::errors::AppResult;
use crate::models::StreamSource;
use crate::progress::ProgressHandle;
use crate::utils::UpstreamHttpClient;

use super::traits::{IngestOutcome, StreamSourceHandler};

pub struct M3uHandler {
    http: UpstreamHttpClient,
    channels: ChannelRepository,
    batch_size: usize,
}

impl M3uHandler {
    pub fn new(http: UpstreamHttpClient, channels: ChannelRepository, batch_size: usize) -> Self {
        Self {
            http,
            channels,
            batch_size,
        }
    }
}

#[async_trait]
impl StreamSourceHandler for M3uHandler {
    async fn ingest(
        &self,
        source: &StreamSource,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome> {
        progress.update_stage("fetch", 10.0, "downloading playlist");
        let text = self.http.get_text(&source.url, cancel).await?;
        progress.complete_stage("fetch");

        let parsed = parse_playlist(&text);
        debug!(
            source = %source.name,
            channels = parsed.channels.len(),
            skipped = parsed.skipped,
            duplicates = parsed.duplicates,
            "parsed m3u playlist"
        );
        if parsed.skipped > 0 {
            warn!(
                source = %source.name,
                skipped = parsed.skipped,
                "playlist contained malformed entries"
            );
        }
        progress.update_stage(
            "parse",
            100.0,
            format!("{} channels", parsed.channels.len()),
        );

        if cancel.is_cancelled() {
            return Err(crate::errors::AppError::Cancelled);
        }

        let skipped = parsed.skipped + parsed.duplicates;
        let records = self
            .channels
            .replace_for_source(source.id, parsed.channels, self.batch_size)
            .await?;
        progress.complete_stage("store");

        Ok(IngestOutcome { records, skipped })
    }
}

#[derive(Debug, Default)]
pub struct ParsedPlaylist {
    pub channels: Vec<NewChannel>,
    pub skipped: usize,
    pub duplicates: usize,
}

/// Parse M3U text into channel rows.
pub fn parse_playlist(content: &str) -> ParsedPlaylist {
    let mut result = ParsedPlaylist::default();
    let mut pending: Option<NewChannel> = None;
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(extinf) = line.strip_prefix("#EXTINF:") {
            if pending.is_some() {
                // Two EXTINF lines in a row: the first had no URL.
                result.skipped += 1;
            }
            match parse_extinf(extinf) {
                Some(channel) => pending = Some(channel),
                None => {
                    result.skipped += 1;
                    pending = None;
                }
            }
        } else if line.starts_with('#') {
            // #EXTM3U header, #EXTVLCOPT and other directives.
            continue;
        } else {
            match pending.take() {
                Some(mut channel) => {
                    channel.stream_url = line.to_string();
                    channel.stream_type = stream_type_hint(line);
                    let key = (channel.stream_url.clone(), channel.channel_name.clone());
                    if seen.insert(key) {
                        result.channels.push(channel);
                    } else {
                        result.duplicates += 1;
                    }
                }
                None => {
                    // URL with no metadata line.
                    result.skipped += 1;
                }
            }
        }
    }

    if pending.is_some() {
        result.skipped += 1;
    }

    result
}

/// Parse the remainder of an `#EXTINF:` line: duration, `key="value"`
/// attributes, then the display name after the comma.
fn parse_extinf(rest: &str) -> Option<NewChannel> {
    let (attrs, name) = split_extinf(rest)?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let attrs = parse_attributes(attrs);
    Some(NewChannel {
        external_id: None,
        tvg_id: attrs.get("tvg-id").cloned().filter(|v| !v.is_empty()),
        tvg_name: attrs.get("tvg-name").cloned().filter(|v| !v.is_empty()),
        tvg_logo: attrs.get("tvg-logo").cloned().filter(|v| !v.is_empty()),
        group_title: attrs.get("group-title").cloned().filter(|v| !v.is_empty()),
        channel_name: name.to_string(),
        channel_number: attrs.get("tvg-chno").and_then(|v| v.parse().ok()),
        stream_url: String::new(),
        stream_type: None,
        language: attrs.get("tvg-language").cloned().filter(|v| !v.is_empty()),
        country: attrs.get("tvg-country").cloned().filter(|v| !v.is_empty()),
        is_adult: false,
    })
}

/// Split an EXTINF payload at the display-name comma, respecting quotes.
fn split_extinf(rest: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return Some((&rest[..i], &rest[i + 1..])),
            _ => {}
        }
    }
    None
}

/// Scan `key="value"` pairs. Unquoted values run to the next space.
fn parse_attributes(input: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !(bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            // Bare token (the duration); skip it.
            continue;
        }
        let key = input[key_start..i].to_ascii_lowercase();
        i += 1;
        if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let value_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            attrs.insert(key, input[value_start..i].to_string());
            i += 1;
        } else {
            let value_start = i;
            while i < bytes.len() && !(bytes[i] as char).is_whitespace() {
                i += 1;
            }
            attrs.insert(key, input[value_start..i].to_string());
        }
    }

    attrs
}

fn stream_type_hint(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        Some("hls".to_string())
    } else if path.ends_with(".ts") {
        Some("mpegts".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"#EXTM3U
#EXTINF:-1 tvg-id="hbo.us" tvg-name="HBO" tvg-logo="http://logos/hbo.png" group-title="Movies",HBO
http://upstream/hbo.ts
#EXTVLCOPT:http-user-agent=VLC
#EXTINF:-1 tvg-id="bbc.uk" group-title="News",BBC News
http://upstream/bbc.m3u8
"#;

    #[test]
    fn parses_entries_with_attributes() {
        let parsed = parse_playlist(SAMPLE);
        assert_eq!(parsed.channels.len(), 2);
        assert_eq!(parsed.skipped, 0);

        let hbo = &parsed.channels[0];
        assert_eq!(hbo.channel_name, "HBO");
        assert_eq!(hbo.tvg_id.as_deref(), Some("hbo.us"));
        assert_eq!(hbo.tvg_logo.as_deref(), Some("http://logos/hbo.png"));
        assert_eq!(hbo.group_title.as_deref(), Some("Movies"));
        assert_eq!(hbo.stream_url, "http://upstream/hbo.ts");
        assert_eq!(hbo.stream_type.as_deref(), Some("mpegts"));

        let bbc = &parsed.channels[1];
        assert_eq!(bbc.stream_type.as_deref(), Some("hls"));
        assert_eq!(bbc.tvg_name, None);
    }

    #[test]
    fn display_name_may_contain_commas_in_quoted_attrs() {
        let parsed = parse_playlist(
            "#EXTINF:-1 tvg-name=\"News, World\" group-title=\"News\",Euronews\nhttp://u/e.ts\n",
        );
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(parsed.channels[0].channel_name, "Euronews");
        assert_eq!(parsed.channels[0].tvg_name.as_deref(), Some("News, World"));
    }

    #[test]
    fn malformed_entries_are_counted_and_skipped() {
        // Orphan URL, nameless EXTINF, URL after the dropped EXTINF, and a
        // trailing EXTINF with no URL: four skips.
        let parsed = parse_playlist(
            "#EXTM3U\nhttp://orphan-url/x.ts\n#EXTINF:-1,\nhttp://u/unnamed.ts\n#EXTINF:-1,Trailing Meta\n",
        );
        assert!(parsed.channels.is_empty());
        assert_eq!(parsed.skipped, 4);
    }

    #[test]
    fn duplicate_url_name_pairs_collapse() {
        let playlist = "#EXTINF:-1,One\nhttp://u/a.ts\n#EXTINF:-1,One\nhttp://u/a.ts\n";
        let parsed = parse_playlist(playlist);
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(parsed.duplicates, 1);
    }

    #[test]
    fn consecutive_extinf_lines_drop_the_first() {
        let parsed =
            parse_playlist("#EXTINF:-1,First\n#EXTINF:-1,Second\nhttp://u/second.ts\n");
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(parsed.channels[0].channel_name, "Second");
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn tvg_chno_populates_channel_number() {
        let parsed =
            parse_playlist("#EXTINF:-1 tvg-chno=\"12\",Numbered\nhttp://u/n.ts\n");
        assert_eq!(parsed.channels[0].channel_number, Some(12));
    }
}
