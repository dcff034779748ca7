//! Xtream Codes source handlers.
//!
//! Live ingestion authenticates against `player_api.php`, walks live
//! categories and streams, and synthesizes `/live/<user>/<pass>/<id>.ts`
//! URLs. The EPG variant pulls the server's `xmltv.php` document and
//! reuses the XMLTV parse.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::database::repositories::{ChannelRepository, NewChannel};
use crate::errors::{AppError, AppResult};
use crate::models::{EpgSource, StreamSource};
use crate::progress::ProgressHandle;
use crate::utils::http_client::host_of;
use crate::utils::UpstreamHttpClient;

use super::traits::{EpgSourceHandler, IngestOutcome, StreamSourceHandler};
use super::xmltv::XmltvEpgHandler;

pub struct XtreamHandler {
    http: UpstreamHttpClient,
    channels: ChannelRepository,
    batch_size: usize,
}

impl XtreamHandler {
    pub fn new(http: UpstreamHttpClient, channels: ChannelRepository, batch_size: usize) -> Self {
        Self {
            http,
            channels,
            batch_size,
        }
    }

    async fn api_call(
        &self,
        base: &str,
        username: &str,
        password: &str,
        action: Option<&str>,
        cancel: &CancellationToken,
    ) -> AppResult<Value> {
        let mut url = format!(
            "{base}/player_api.php?username={}&password={}",
            urlencoded(username),
            urlencoded(password)
        );
        if let Some(action) = action {
            url.push_str("&action=");
            url.push_str(action);
        }
        let text = self.http.get_text(&url, cancel).await?;
        serde_json::from_str(&text).map_err(|e| {
            AppError::upstream_permanent(host_of(base), format!("invalid player_api response: {e}"))
        })
    }
}

#[async_trait]
impl StreamSourceHandler for XtreamHandler {
    async fn ingest(
        &self,
        source: &StreamSource,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome> {
        let (username, password) = credentials(source)?;
        let base = source.url.trim_end_matches('/').to_string();

        progress.update_stage("fetch", 10.0, "authenticating");
        let auth = self
            .api_call(&base, &username, &password, None, cancel)
            .await?;
        let authorized = auth
            .pointer("/user_info/auth")
            .map(|v| v == &Value::from(1) || v == &Value::from(true))
            .unwrap_or(false);
        if !authorized {
            return Err(AppError::upstream_permanent(
                host_of(&base),
                "player_api rejected the credentials",
            ));
        }

        progress.update_stage("fetch", 40.0, "loading categories");
        let categories = self
            .api_call(&base, &username, &password, Some("get_live_categories"), cancel)
            .await?;
        let category_names: HashMap<String, String> = categories
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|c| {
                        Some((
                            value_as_string(c.get("category_id")?)?,
                            value_as_string(c.get("category_name")?)?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        progress.update_stage("fetch", 70.0, "loading live streams");
        let streams = self
            .api_call(&base, &username, &password, Some("get_live_streams"), cancel)
            .await?;
        progress.complete_stage("fetch");

        let mut skipped = 0usize;
        let mut channels = Vec::new();
        if let Some(list) = streams.as_array() {
            for stream in list {
                match build_channel(stream, &base, &username, &password, &category_names) {
                    Some(channel) => channels.push(channel),
                    None => skipped += 1,
                }
            }
        }
        debug!(
            source = %source.name,
            categories = category_names.len(),
            channels = channels.len(),
            skipped,
            "parsed xtream live streams"
        );
        progress.update_stage("parse", 100.0, format!("{} channels", channels.len()));

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let records = self
            .channels
            .replace_for_source(source.id, channels, self.batch_size)
            .await?;
        progress.complete_stage("store");

        Ok(IngestOutcome { records, skipped })
    }
}

/// EPG over Xtream: the server exposes a standard XMLTV document.
pub struct XtreamEpgHandler {
    inner: XmltvEpgHandler,
}

impl XtreamEpgHandler {
    pub fn new(inner: XmltvEpgHandler) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EpgSourceHandler for XtreamEpgHandler {
    async fn ingest(
        &self,
        source: &EpgSource,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome> {
        let username = source
            .username
            .clone()
            .ok_or_else(|| AppError::validation("xtream EPG source requires a username"))?;
        let password = source
            .password
            .clone()
            .ok_or_else(|| AppError::validation("xtream EPG source requires a password"))?;
        let url = format!(
            "{}/xmltv.php?username={}&password={}",
            source.url.trim_end_matches('/'),
            urlencoded(&username),
            urlencoded(&password)
        );
        self.inner.ingest_url(source, &url, progress, cancel).await
    }
}

fn credentials(source: &StreamSource) -> AppResult<(String, String)> {
    let username = source
        .username
        .clone()
        .ok_or_else(|| AppError::validation("xtream source requires a username"))?;
    let password = source
        .password
        .clone()
        .ok_or_else(|| AppError::validation("xtream source requires a password"))?;
    Ok((username, password))
}

fn build_channel(
    stream: &Value,
    base: &str,
    username: &str,
    password: &str,
    categories: &HashMap<String, String>,
) -> Option<NewChannel> {
    let stream_id = value_as_string(stream.get("stream_id")?)?;
    let name = value_as_string(stream.get("name")?)?;
    if name.is_empty() {
        return None;
    }

    let category_id = stream.get("category_id").and_then(value_as_string);
    let group_title = category_id
        .as_ref()
        .and_then(|id| categories.get(id))
        .cloned();
    let is_adult = stream
        .get("is_adult")
        .and_then(value_as_string)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
        || group_title
            .as_deref()
            .map(|g| g.to_ascii_lowercase().contains("adult"))
            .unwrap_or(false);

    Some(NewChannel {
        external_id: Some(stream_id.clone()),
        tvg_id: stream
            .get("epg_channel_id")
            .and_then(value_as_string)
            .filter(|v| !v.is_empty()),
        tvg_name: Some(name.clone()),
        tvg_logo: stream
            .get("stream_icon")
            .and_then(value_as_string)
            .filter(|v| !v.is_empty()),
        group_title,
        channel_name: name,
        channel_number: stream
            .get("num")
            .and_then(value_as_string)
            .and_then(|v| v.parse().ok()),
        stream_url: format!(
            "{base}/live/{}/{}/{stream_id}.ts",
            urlencoded(username),
            urlencoded(password)
        ),
        stream_type: Some("mpegts".to_string()),
        language: None,
        country: None,
        is_adult,
    })
}

/// Xtream servers hand back numbers and strings interchangeably.
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn urlencoded(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_channels_from_live_streams() {
        let categories: HashMap<String, String> =
            [("7".to_string(), "Movies".to_string())].into();
        let stream = json!({
            "stream_id": 42,
            "name": "HBO",
            "category_id": "7",
            "epg_channel_id": "hbo.us",
            "stream_icon": "http://logos/hbo.png",
            "num": "12",
            "is_adult": "0"
        });
        let channel = build_channel(&stream, "http://host", "u", "p", &categories).unwrap();
        assert_eq!(channel.channel_name, "HBO");
        assert_eq!(channel.stream_url, "http://host/live/u/p/42.ts");
        assert_eq!(channel.group_title.as_deref(), Some("Movies"));
        assert_eq!(channel.tvg_id.as_deref(), Some("hbo.us"));
        assert_eq!(channel.channel_number, Some(12));
        assert!(!channel.is_adult);
    }

    #[test]
    fn numeric_and_string_ids_both_work() {
        let stream = json!({"stream_id": "99", "name": "X"});
        let channel =
            build_channel(&stream, "http://host", "u", "p", &HashMap::new()).unwrap();
        assert!(channel.stream_url.ends_with("/99.ts"));
    }

    #[test]
    fn adult_flag_from_field_or_category() {
        let categories: HashMap<String, String> =
            [("1".to_string(), "Adult XXX".to_string())].into();
        let by_field = json!({"stream_id": 1, "name": "A", "is_adult": "1"});
        assert!(build_channel(&by_field, "http://h", "u", "p", &HashMap::new())
            .unwrap()
            .is_adult);
        let by_category = json!({"stream_id": 2, "name": "B", "category_id": "1"});
        assert!(build_channel(&by_category, "http://h", "u", "p", &categories)
            .unwrap()
            .is_adult);
    }

    #[test]
    fn nameless_streams_are_skipped() {
        let stream = json!({"stream_id": 5, "name": ""});
        assert!(build_channel(&stream, "http://h", "u", "p", &HashMap::new()).is_none());
    }

    #[test]
    fn credentials_are_url_encoded_in_stream_urls() {
        let stream = json!({"stream_id": 1, "name": "X"});
        let channel =
            build_channel(&stream, "http://h", "user name", "p&ss", &HashMap::new()).unwrap();
        assert_eq!(channel.stream_url, "http://h/live/user+name/p%26ss/1.ts");
    }
}
