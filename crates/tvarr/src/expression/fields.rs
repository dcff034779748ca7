//! Domain-scoped field registry and record field access.
//!
//! Fields are a fixed set per domain, compiled into exhaustive accessor
//! matches. Unknown fields are diagnostics at validation time and evaluate
//! to "no value" at runtime.

use crate::models::{Channel, EpgProgram, RuleDomain};

/// The record family an expression is authored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionDomain {
    Stream,
    Epg,
    /// Request metadata, used by relay client-detection rules.
    Request,
}

impl From<RuleDomain> for ExpressionDomain {
    fn from(domain: RuleDomain) -> Self {
        match domain {
            RuleDomain::Stream => Self::Stream,
            RuleDomain::Epg => Self::Epg,
        }
    }
}

const STREAM_FIELDS: &[&str] = &[
    "channel_name",
    "channel_number",
    "country",
    "external_id",
    "group_title",
    "is_adult",
    "language",
    "stream_type",
    "stream_url",
    "tvg_id",
    "tvg_logo",
    "tvg_name",
];

const EPG_FIELDS: &[&str] = &[
    "category",
    "channel_id",
    "description",
    "icon",
    "is_live",
    "is_new",
    "is_premiere",
    "rating",
    "title",
];

const REQUEST_FIELDS: &[&str] = &["accept", "format", "remote_addr", "user_agent"];

pub fn fields(domain: ExpressionDomain) -> &'static [&'static str] {
    match domain {
        ExpressionDomain::Stream => STREAM_FIELDS,
        ExpressionDomain::Epg => EPG_FIELDS,
        ExpressionDomain::Request => REQUEST_FIELDS,
    }
}

pub fn is_valid_field(domain: ExpressionDomain, name: &str) -> bool {
    fields(domain).contains(&name)
}

/// Nearest-name suggestion for an unknown field, by character overlap.
pub fn suggest(domain: ExpressionDomain, name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    let name_chars: std::collections::HashSet<char> = lower.chars().collect();
    let mut best: Option<(&'static str, usize)> = None;
    for candidate in fields(domain) {
        let candidate_chars: std::collections::HashSet<char> = candidate.chars().collect();
        let common = name_chars.intersection(&candidate_chars).count();
        let score = common * 100 / candidate.len().max(lower.len()).max(1);
        if score >= 55 && best.is_none_or(|(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Field-addressed access to a record. Getters return `None` for unknown
/// fields; setters on unknown or read-only fields return false.
pub trait FieldAccess {
    fn get_field(&self, field: &str) -> Option<String>;
    fn set_field(&mut self, field: &str, value: &str) -> bool;
}

fn opt(value: &Option<String>) -> Option<String> {
    Some(value.clone().unwrap_or_default())
}

impl FieldAccess for Channel {
    fn get_field(&self, field: &str) -> Option<String> {
        match field {
            "channel_name" => Some(self.channel_name.clone()),
            "channel_number" => Some(
                self.channel_number
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
            ),
            "country" => opt(&self.country),
            "external_id" => opt(&self.external_id),
            "group_title" => opt(&self.group_title),
            "is_adult" => Some(self.is_adult.to_string()),
            "language" => opt(&self.language),
            "stream_type" => opt(&self.stream_type),
            "stream_url" => Some(self.stream_url.clone()),
            "tvg_id" => opt(&self.tvg_id),
            "tvg_logo" => opt(&self.tvg_logo),
            "tvg_name" => opt(&self.tvg_name),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: &str) -> bool {
        let as_option = || {
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };
        match field {
            "channel_name" => self.channel_name = value.to_string(),
            "channel_number" => self.channel_number = value.parse().ok(),
            "country" => self.country = as_option(),
            "external_id" => self.external_id = as_option(),
            "group_title" => self.group_title = as_option(),
            "is_adult" => self.is_adult = value.eq_ignore_ascii_case("true"),
            "language" => self.language = as_option(),
            "stream_type" => self.stream_type = as_option(),
            "stream_url" => self.stream_url = value.to_string(),
            "tvg_id" => self.tvg_id = as_option(),
            "tvg_logo" => self.tvg_logo = as_option(),
            "tvg_name" => self.tvg_name = as_option(),
            _ => return false,
        }
        true
    }
}

impl FieldAccess for EpgProgram {
    fn get_field(&self, field: &str) -> Option<String> {
        match field {
            "category" => opt(&self.category),
            "channel_id" => Some(self.channel_id.clone()),
            "description" => opt(&self.description),
            "icon" => opt(&self.icon),
            "is_live" => Some(self.is_live.to_string()),
            "is_new" => Some(self.is_new.to_string()),
            "is_premiere" => Some(self.is_premiere.to_string()),
            "rating" => opt(&self.rating),
            "title" => Some(self.title.clone()),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: &str) -> bool {
        let as_option = || {
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };
        match field {
            "category" => self.category = as_option(),
            "channel_id" => self.channel_id = value.to_string(),
            "description" => self.description = as_option(),
            "icon" => self.icon = as_option(),
            "is_live" => self.is_live = value.eq_ignore_ascii_case("true"),
            "is_new" => self.is_new = value.eq_ignore_ascii_case("true"),
            "is_premiere" => self.is_premiere = value.eq_ignore_ascii_case("true"),
            "rating" => self.rating = as_option(),
            "title" => self.title = value.to_string(),
            _ => return false,
        }
        true
    }
}

/// Request metadata evaluated by client-detection rules. Read-only.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub remote_addr: Option<String>,
    pub format: Option<String>,
}

impl FieldAccess for RequestMeta {
    fn get_field(&self, field: &str) -> Option<String> {
        match field {
            "accept" => opt(&self.accept),
            "format" => opt(&self.format),
            "remote_addr" => opt(&self.remote_addr),
            "user_agent" => opt(&self.user_agent),
            _ => None,
        }
    }

    fn set_field(&mut self, _field: &str, _value: &str) -> bool {
        false
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
            tvg_id: Some("bbc.uk".into()),
            tvg_name: None,
            tvg_logo: None,
            group_title: Some("News".into()),
            channel_name: "BBC News".into(),
            channel_number: Some(101),
            stream_url: "http://up/1.ts".into(),
            stream_type: None,
            language: None,
            country: None,
            is_adult: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn channel_fields_resolve() {
        let c = channel();
        assert_eq!(c.get_field("channel_name").as_deref(), Some("BBC News"));
        assert_eq!(c.get_field("channel_number").as_deref(), Some("101"));
        assert_eq!(c.get_field("is_adult").as_deref(), Some("false"));
        // Absent optionals read as empty, unknown fields as None.
        assert_eq!(c.get_field("tvg_name").as_deref(), Some(""));
        assert_eq!(c.get_field("nope"), None);
    }

    #[test]
    fn channel_fields_write_back() {
        let mut c = channel();
        assert!(c.set_field("group_title", "World News"));
        assert_eq!(c.group_title.as_deref(), Some("World News"));
        assert!(c.set_field("tvg_logo", ""));
        assert_eq!(c.tvg_logo, None);
        assert!(!c.set_field("nope", "x"));
    }

    #[test]
    fn suggestions_find_near_misses() {
        assert_eq!(
            suggest(ExpressionDomain::Stream, "chanel_name"),
            Some("channel_name")
        );
        assert_eq!(suggest(ExpressionDomain::Stream, "zzzz"), None);
    }

    #[test]
    fn request_meta_is_read_only() {
        let mut meta = RequestMeta {
            user_agent: Some("VLC/3.0".into()),
            ..RequestMeta::default()
        };
        assert_eq!(meta.get_field("user_agent").as_deref(), Some("VLC/3.0"));
        assert!(!meta.set_field("user_agent", "x"));
    }
}
