//! Canonical domain records.
//!
//! Persisted records carry a ULID id (lexicographically sortable, assigned on
//! create) plus created/updated timestamps. Repositories translate between
//! these models and their store entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use ulid::Ulid;

pub mod job;
pub mod relay;

pub use job::{Job, JobHistoryEntry, JobKind, JobOutcome, JobStatus};

/// An upstream playlist provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSource {
    pub id: Ulid,
    pub name: String,
    pub kind: StreamSourceKind,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    /// Higher priority wins merge conflicts during generation.
    pub priority: i32,
    /// Six-field cron; empty disables scheduled ingestion.
    pub update_cron: String,
    pub status: SourceStatus,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StreamSourceKind {
    M3u,
    Xtream,
    Manual,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Ingesting,
    Ready,
    Error,
}

/// An upstream program-guide provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgSource {
    pub id: Ulid,
    pub name: String,
    pub kind: EpgSourceKind,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub update_cron: String,
    /// Programs outside now ± retention_days are discarded on ingest.
    pub retention_days: i32,
    pub status: SourceStatus,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EpgSourceKind {
    Xmltv,
    Xtream,
}

/// A normalized playlist entry owned by a stream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Ulid,
    pub source_id: Ulid,
    pub external_id: Option<String>,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub tvg_logo: Option<String>,
    pub group_title: Option<String>,
    pub channel_name: String,
    /// Assigned by the numbering stage; `None` until then.
    pub channel_number: Option<i32>,
    pub stream_url: String,
    pub stream_type: Option<String>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub is_adult: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single EPG entry; `channel_id` is the XMLTV channel (tvg) id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpgProgram {
    pub id: Ulid,
    pub source_id: Ulid,
    pub channel_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub icon: Option<String>,
    pub rating: Option<String>,
    pub is_new: bool,
    pub is_premiere: bool,
    pub is_live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A configured output: one M3U + XMLTV artifact pair, plus how its
/// channels stream to players.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProxy {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub proxy_mode: ProxyMode,
    pub is_active: bool,
    pub auto_regenerate: bool,
    pub starting_channel_number: i32,
    pub numbering_mode: NumberingMode,
    pub cache_channel_logos: bool,
    pub cache_program_logos: bool,
    pub status: ProxyStatus,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stream sources in evaluation order (ascending priority_order).
    pub sources: Vec<ProxySourceRef>,
    /// EPG sources in evaluation order.
    pub epg_sources: Vec<ProxySourceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySourceRef {
    pub source_id: Ulid,
    pub priority_order: i32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// 302 to the upstream URL.
    Redirect,
    /// Byte passthrough through this service, one upstream pull per client.
    Proxy,
    /// Full relay engine: shared upstream, probing, repackage/transcode.
    Relay,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NumberingMode {
    Preserve,
    Sequential,
    SourceBased,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Pending,
    Generating,
    Ready,
    Error,
}

/// Which record family a rule addresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleDomain {
    Stream,
    Epg,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    Include,
    Exclude,
}

/// A filter rule: first match (ascending priority) decides a record's fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub domain: RuleDomain,
    pub expression: String,
    pub action: FilterAction,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A data-mapping rule: condition plus field-rewriting actions, applied
/// cumulatively in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMappingRule {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub domain: RuleDomain,
    pub expression: String,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn enum_round_trips_snake_case() {
        assert_eq!(StreamSourceKind::M3u.to_string(), "m3u");
        assert_eq!(
            StreamSourceKind::from_str("xtream").unwrap(),
            StreamSourceKind::Xtream
        );
        assert_eq!(NumberingMode::SourceBased.to_string(), "source_based");
        assert_eq!(JobKind::ProxyGeneration.to_string(), "proxy_generation");
        assert_eq!(
            ProxyMode::from_str("redirect").unwrap(),
            ProxyMode::Redirect
        );
    }
}
