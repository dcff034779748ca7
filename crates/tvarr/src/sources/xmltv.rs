//! XMLTV guide source handler.
//!
//! Streams the document through quick-xml: `<channel>` elements first,
//! then `<programme>` elements in document order. Programs outside the
//! source's retention window are discarded during the parse, not after.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::database::repositories::{EpgProgramRepository, NewEpgProgram};
use crate::errors::{AppError, AppResult};
use crate::models::EpgSource;
use crate::progress::ProgressHandle;
use crate::utils::UpstreamHttpClient;

use super::traits::{EpgSourceHandler, IngestOutcome};

pub struct XmltvEpgHandler {
    http: UpstreamHttpClient,
    programs: EpgProgramRepository,
    batch_size: usize,
}

impl XmltvEpgHandler {
    pub fn new(
        http: UpstreamHttpClient,
        programs: EpgProgramRepository,
        batch_size: usize,
    ) -> Self {
        Self {
            http,
            programs,
            batch_size,
        }
    }

    pub(super) async fn ingest_url(
        &self,
        source: &EpgSource,
        url: &str,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome> {
        progress.update_stage("fetch", 10.0, "downloading guide");
        let text = self.http.get_text(url, cancel).await?;
        progress.complete_stage("fetch");

        let retention = Duration::days(source.retention_days.max(1) as i64);
        let now = Utc::now();
        let guide = parse_guide(&text, now - retention, now + retention)
            .map_err(|e| AppError::upstream_permanent(crate::utils::http_client::host_of(url), e))?;
        debug!(
            source = %source.name,
            channels = guide.channels_seen,
            programs = guide.programs.len(),
            out_of_window = guide.out_of_window,
            skipped = guide.skipped,
            "parsed xmltv guide"
        );
        if guide.skipped > 0 {
            warn!(
                source = %source.name,
                skipped = guide.skipped,
                "guide contained malformed programme entries"
            );
        }
        progress.update_stage("parse", 100.0, format!("{} programs", guide.programs.len()));

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let records = self
            .programs
            .replace_for_source(source.id, guide.programs, self.batch_size)
            .await?;
        progress.complete_stage("store");

        Ok(IngestOutcome {
            records,
            skipped: guide.skipped + guide.out_of_window,
        })
    }
}

#[async_trait]
impl EpgSourceHandler for XmltvEpgHandler {
    async fn ingest(
        &self,
        source: &EpgSource,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> AppResult<IngestOutcome> {
        let url = source.url.clone();
        self.ingest_url(source, &url, progress, cancel).await
    }
}

#[derive(Debug, Default)]
pub struct ParsedGuide {
    pub programs: Vec<NewEpgProgram>,
    pub channels_seen: usize,
    pub skipped: usize,
    pub out_of_window: usize,
}

/// Parse an XMLTV document, keeping programs inside [from, until].
pub fn parse_guide(
    content: &str,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<ParsedGuide, String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut guide = ParsedGuide::default();
    let mut current: Option<ProgramBuilder> = None;
    let mut text_target: Option<TextTarget> = None;
    let mut in_rating = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"channel" => guide.channels_seen += 1,
                b"programme" => {
                    let mut builder = ProgramBuilder::default();
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .unescape_value()
                            .map(|v| v.into_owned())
                            .unwrap_or_default();
                        match attr.key.as_ref() {
                            b"start" => builder.start = parse_xmltv_time(&value),
                            b"stop" => builder.stop = parse_xmltv_time(&value),
                            b"channel" => builder.channel_id = value,
                            _ => {}
                        }
                    }
                    current = Some(builder);
                }
                b"title" if current.is_some() => text_target = Some(TextTarget::Title),
                b"desc" if current.is_some() => text_target = Some(TextTarget::Description),
                b"category" if current.is_some() => text_target = Some(TextTarget::Category),
                b"rating" if current.is_some() => in_rating = true,
                b"value" if in_rating => text_target = Some(TextTarget::Rating),
                b"icon" => {
                    if let Some(builder) = current.as_mut() {
                        builder.icon = icon_src(&e);
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if let Some(builder) = current.as_mut() {
                    match e.name().as_ref() {
                        b"new" => builder.is_new = true,
                        b"premiere" => builder.is_premiere = true,
                        b"live" => builder.is_live = true,
                        b"previously-shown" => builder.is_new = false,
                        b"icon" => builder.icon = icon_src(&e),
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(builder), Some(target)) = (current.as_mut(), text_target) {
                    let text = t.decode().map(|v| v.into_owned()).unwrap_or_default();
                    match target {
                        TextTarget::Title => builder.title = text,
                        TextTarget::Description => builder.description = Some(text),
                        TextTarget::Category => builder.category = Some(text),
                        TextTarget::Rating => builder.rating = Some(text),
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"programme" => {
                    if let Some(builder) = current.take() {
                        match builder.finish() {
                            Some(program) => {
                                if program.stop < from || program.start > until {
                                    guide.out_of_window += 1;
                                } else {
                                    guide.programs.push(program);
                                }
                            }
                            None => guide.skipped += 1,
                        }
                    }
                    text_target = None;
                    in_rating = false;
                }
                b"rating" => in_rating = false,
                b"title" | b"desc" | b"category" | b"value" => text_target = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("xml parse error at byte {}: {e}", reader.buffer_position())),
        }
    }

    Ok(guide)
}

#[derive(Debug, Clone, Copy)]
enum TextTarget {
    Title,
    Description,
    Category,
    Rating,
}

#[derive(Debug, Default)]
struct ProgramBuilder {
    channel_id: String,
    title: String,
    description: Option<String>,
    category: Option<String>,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    icon: Option<String>,
    rating: Option<String>,
    is_new: bool,
    is_premiere: bool,
    is_live: bool,
}

impl ProgramBuilder {
    fn finish(self) -> Option<NewEpgProgram> {
        let start = self.start?;
        let stop = self.stop?;
        if self.channel_id.is_empty() || self.title.is_empty() || stop <= start {
            return None;
        }
        Some(NewEpgProgram {
            channel_id: self.channel_id,
            title: self.title,
            description: self.description,
            category: self.category,
            start,
            stop,
            icon: self.icon,
            rating: self.rating,
            is_new: self.is_new,
            is_premiere: self.is_premiere,
            is_live: self.is_live,
        })
    }
}

fn icon_src(element: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == b"src")
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// `YYYYMMDDHHMMSS ±HHMM`; a missing offset reads as UTC.
pub fn parse_xmltv_time(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(with_offset) = DateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S %z") {
        return Some(with_offset.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Format a timestamp the way XMLTV output wants it.
pub fn format_xmltv_time(value: DateTime<Utc>) -> String {
    value.format("%Y%m%d%H%M%S %z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="bbc.uk">
    <display-name>BBC One</display-name>
    <icon src="http://logos/bbc.png"/>
  </channel>
  <programme start="20260801120000 +0000" stop="20260801130000 +0000" channel="bbc.uk">
    <title>News at Noon</title>
    <desc>Headlines.</desc>
    <category>News</category>
    <rating system="UK"><value>PG</value></rating>
    <new/>
    <live/>
  </programme>
  <programme start="20200101000000 +0000" stop="20200101010000 +0000" channel="bbc.uk">
    <title>Ancient Rerun</title>
  </programme>
  <programme start="20260801140000 +0000" channel="bbc.uk">
    <title>No Stop Time</title>
  </programme>
</tv>
"#;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let from = parse_xmltv_time("20260725000000 +0000").unwrap();
        let until = parse_xmltv_time("20260808000000 +0000").unwrap();
        (from, until)
    }

    #[test]
    fn parses_programs_and_flags() {
        let (from, until) = window();
        let guide = parse_guide(SAMPLE, from, until).unwrap();
        assert_eq!(guide.channels_seen, 1);
        assert_eq!(guide.programs.len(), 1);

        let program = &guide.programs[0];
        assert_eq!(program.title, "News at Noon");
        assert_eq!(program.channel_id, "bbc.uk");
        assert_eq!(program.description.as_deref(), Some("Headlines."));
        assert_eq!(program.category.as_deref(), Some("News"));
        assert_eq!(program.rating.as_deref(), Some("PG"));
        assert!(program.is_new);
        assert!(program.is_live);
        assert!(!program.is_premiere);
    }

    #[test]
    fn out_of_window_and_malformed_are_counted() {
        let (from, until) = window();
        let guide = parse_guide(SAMPLE, from, until).unwrap();
        assert_eq!(guide.out_of_window, 1);
        assert_eq!(guide.skipped, 1);
    }

    #[test]
    fn offsets_normalize_to_utc() {
        let a = parse_xmltv_time("20260801120000 +0200").unwrap();
        let b = parse_xmltv_time("20260801100000 +0000").unwrap();
        assert_eq!(a, b);
        // Offset-free times read as UTC.
        let c = parse_xmltv_time("20260801100000").unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn time_round_trips_through_output_format() {
        let t = parse_xmltv_time("20260801120000 +0000").unwrap();
        assert_eq!(format_xmltv_time(t), "20260801120000 +0000");
        assert_eq!(parse_xmltv_time(&format_xmltv_time(t)), Some(t));
    }

    #[test]
    fn broken_xml_is_an_error() {
        let (from, until) = window();
        assert!(parse_guide("<tv><programme", from, until).is_err());
    }
}
