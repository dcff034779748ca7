//! Client-class detection: ordered request-domain rules (same DSL as the
//! filter engine) mapping a request to codec capabilities. First match
//! wins; no match uses the defaults.

use std::str::FromStr;

use tracing::debug;

use crate::config::ClientRuleConfig;
use crate::errors::{AppError, AppResult};
use crate::expression::{self, CompiledExpression, ExpressionDomain, RequestMeta};
use crate::models::relay::{AudioCodec, ClientCapabilities, ContainerFormat, VideoCodec};

struct ClientRule {
    name: String,
    priority: i32,
    expression: CompiledExpression,
    capabilities: ClientCapabilities,
}

pub struct ClientClassifier {
    rules: Vec<ClientRule>,
}

impl ClientClassifier {
    /// Compile the configured rules. A rule that fails to parse is a
    /// configuration error, surfaced at startup.
    pub fn from_config(configs: &[ClientRuleConfig]) -> AppResult<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let expression =
                expression::compile_text(&config.expression, ExpressionDomain::Request).map_err(
                    |e| AppError::validation(format!("client rule '{}': {e}", config.name)),
                )?;
            rules.push(ClientRule {
                name: config.name.clone(),
                priority: config.priority,
                expression,
                capabilities: parse_capabilities(config)?,
            });
        }
        rules.sort_by_key(|r| r.priority);
        Ok(Self { rules })
    }

    /// First matching rule's capabilities, plus its name for telemetry.
    pub fn classify(&self, meta: &RequestMeta) -> (ClientCapabilities, Option<String>) {
        for rule in &self.rules {
            if rule.expression.matches(meta) {
                debug!(rule = %rule.name, "client rule matched");
                return (rule.capabilities.clone(), Some(rule.name.clone()));
            }
        }
        (ClientCapabilities::default(), None)
    }
}

fn parse_capabilities(config: &ClientRuleConfig) -> AppResult<ClientCapabilities> {
    let parse_list = |values: &[String], what: &str| -> AppResult<Vec<VideoCodec>> {
        values
            .iter()
            .map(|v| {
                VideoCodec::from_str(v).map_err(|_| {
                    AppError::validation(format!(
                        "client rule '{}': unknown {what} codec '{v}'",
                        config.name
                    ))
                })
            })
            .collect()
    };
    let parse_audio_list = |values: &[String]| -> AppResult<Vec<AudioCodec>> {
        values
            .iter()
            .map(|v| {
                AudioCodec::from_str(v).map_err(|_| {
                    AppError::validation(format!(
                        "client rule '{}': unknown audio codec '{v}'",
                        config.name
                    ))
                })
            })
            .collect()
    };

    Ok(ClientCapabilities {
        acceptable_video: parse_list(&config.acceptable_video, "video")?,
        acceptable_audio: parse_audio_list(&config.acceptable_audio)?,
        preferred_container: ContainerFormat::from_str(&config.preferred_container).map_err(
            |_| {
                AppError::validation(format!(
                    "client rule '{}': unknown container '{}'",
                    config.name, config.preferred_container
                ))
            },
        )?,
        preferred_video: VideoCodec::from_str(&config.preferred_video).map_err(|_| {
            AppError::validation(format!(
                "client rule '{}': unknown video codec '{}'",
                config.name, config.preferred_video
            ))
        })?,
        preferred_audio: AudioCodec::from_str(&config.preferred_audio).map_err(|_| {
            AppError::validation(format!(
                "client rule '{}': unknown audio codec '{}'",
                config.name, config.preferred_audio
            ))
        })?,
        transcode_profile: config.transcode_profile.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_tv_rule() -> ClientRuleConfig {
        ClientRuleConfig {
            name: "legacy-tv".to_string(),
            priority: 10,
            expression: "user_agent contains \"SmartTV-2014\"".to_string(),
            acceptable_video: vec!["h264".to_string()],
            acceptable_audio: vec!["aac".to_string()],
            preferred_container: "mpegts".to_string(),
            preferred_video: "h264".to_string(),
            preferred_audio: "aac".to_string(),
            transcode_profile: None,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut catch_all = legacy_tv_rule();
        catch_all.name = "catch-all".to_string();
        catch_all.priority = 99;
        catch_all.expression = "user_agent is_not_empty".to_string();
        let classifier =
            ClientClassifier::from_config(&[catch_all, legacy_tv_rule()]).unwrap();

        let meta = RequestMeta {
            user_agent: Some("SmartTV-2014 WebKit".to_string()),
            ..RequestMeta::default()
        };
        let (caps, matched) = classifier.classify(&meta);
        assert_eq!(matched.as_deref(), Some("legacy-tv"));
        assert_eq!(caps.acceptable_video, vec![VideoCodec::H264]);
    }

    #[test]
    fn no_match_uses_defaults() {
        let classifier = ClientClassifier::from_config(&[legacy_tv_rule()]).unwrap();
        let meta = RequestMeta {
            user_agent: Some("VLC/3.0.18".to_string()),
            ..RequestMeta::default()
        };
        let (caps, matched) = classifier.classify(&meta);
        assert_eq!(matched, None);
        assert_eq!(caps, ClientCapabilities::default());
    }

    #[test]
    fn bad_expression_is_a_startup_error() {
        let mut rule = legacy_tv_rule();
        rule.expression = "channel_name contains \"x\"".to_string();
        // Stream-domain field in a request-domain rule.
        assert!(ClientClassifier::from_config(&[rule]).is_err());
    }

    #[test]
    fn bad_codec_name_is_a_startup_error() {
        let mut rule = legacy_tv_rule();
        rule.preferred_video = "divx".to_string();
        assert!(ClientClassifier::from_config(&[rule]).is_err());
    }
}
