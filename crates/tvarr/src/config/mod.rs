//! Hierarchical service configuration.
//!
//! Sources merge with fixed precedence: built-in defaults, then the config
//! file, then `TVARR_`-prefixed environment variables, then CLI flags
//! (applied by the binary after extraction).

pub mod duration_serde;

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub ingestion: IngestionConfig,
    pub pipeline: PipelineConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Load configuration from defaults, an optional TOML file, and the
    /// environment.
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("TVARR_").split("__"));
        figment
            .extract()
            .map_err(|e| AppError::validation(format!("configuration error: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Absolute base used when rendering artifact and logo URLs.
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8084,
            base_url: "http://localhost:8084".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Application secret used to obfuscate stored credentials.
    pub app_secret: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/tvarr.db?mode=rwc".to_string(),
            max_connections: 10,
            app_secret: "change-me".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Filesystem path of the sqlite database, when sqlite is in use.
    /// Backups read the raw file; other backends are skipped.
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        let rest = self.url.strip_prefix("sqlite://")?;
        let path = rest.split('?').next().unwrap_or(rest);
        if path == ":memory:" {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Sandbox root for published artifacts, cached logos and backups.
    pub data_dir: PathBuf,
    /// Retention window for job history rows.
    #[serde(with = "duration_serde::duration")]
    pub job_history_retention: Duration,
    /// Retention window for backups.
    #[serde(with = "duration_serde::duration")]
    pub backup_retention: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            job_history_retention: Duration::from_secs(30 * 86_400),
            backup_retention: Duration::from_secs(14 * 86_400),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Initial level; adjustable at runtime through the log control handle.
    pub level: String,
    /// Emit JSON instead of the human format.
    pub json: bool,
    /// Capacity of the in-process record ring buffer.
    pub capture_buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            capture_buffer: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often cron entries are reconciled and due jobs materialized.
    #[serde(with = "duration_serde::duration")]
    pub sync_interval: Duration,
    /// Worker pool size.
    pub workers: usize,
    /// Per-job execution timeout.
    #[serde(with = "duration_serde::duration")]
    pub job_timeout: Duration,
    /// Extra slack past job_timeout before a running row is considered
    /// orphaned.
    #[serde(with = "duration_serde::duration")]
    pub orphan_slack: Duration,
    /// How often workers poll for claimable jobs when idle.
    #[serde(with = "duration_serde::duration")]
    pub poll_interval: Duration,
    pub default_max_attempts: i32,
    #[serde(with = "duration_serde::duration")]
    pub default_base_backoff: Duration,
    /// Run one make-up ingestion per overdue source at startup.
    pub startup_catchup: bool,
    /// Cron for the internal logo cleanup job.
    pub logo_cleanup_cron: String,
    /// Cron for the internal backup job; empty disables backups.
    pub backup_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            workers: 4,
            job_timeout: Duration::from_secs(3600),
            orphan_slack: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            default_max_attempts: 3,
            default_base_backoff: Duration::from_secs(30),
            startup_catchup: true,
            logo_cleanup_cron: "0 0 4 * * *".to_string(),
            backup_cron: "0 30 3 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    #[serde(with = "duration_serde::duration")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde::duration")]
    pub request_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_serde::duration")]
    pub retry_backoff: Duration,
    #[serde(with = "duration_serde::byte_size")]
    pub max_body_bytes: u64,
    /// Channels/programs per insert batch and per progress tick.
    pub batch_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            max_body_bytes: 512 * 1024 * 1024,
            batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wait for in-flight ingestions of the proxy's sources before loading.
    pub ingestion_guard: bool,
    #[serde(with = "duration_serde::duration")]
    pub ingestion_guard_timeout: Duration,
    /// Concurrent logo downloads per generation.
    pub logo_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingestion_guard: true,
            ingestion_guard_timeout: Duration::from_secs(300),
            logo_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    #[serde(with = "duration_serde::duration")]
    pub probe_timeout: Duration,
    /// Session terminates after this long with zero clients.
    #[serde(with = "duration_serde::duration")]
    pub idle_grace: Duration,
    /// Per-session buffer byte ceiling.
    #[serde(with = "duration_serde::byte_size")]
    pub buffer_bytes: u64,
    /// Maximum samples retained per session buffer.
    pub buffer_samples: usize,
    /// Target HLS/DASH segment length.
    #[serde(with = "duration_serde::duration")]
    pub segment_duration: Duration,
    /// Session creation retry cap on upstream/transcoder faults.
    pub max_session_retries: u32,
    #[serde(with = "duration_serde::duration")]
    pub session_retry_backoff: Duration,
    /// Ordered client-detection rules; first match wins.
    pub client_rules: Vec<ClientRuleConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            probe_timeout: Duration::from_secs(10),
            idle_grace: Duration::from_secs(30),
            buffer_bytes: 32 * 1024 * 1024,
            buffer_samples: 4096,
            segment_duration: Duration::from_secs(4),
            max_session_retries: 3,
            session_retry_backoff: Duration::from_secs(2),
            client_rules: Vec::new(),
        }
    }
}

/// One client-detection rule: a request-domain expression plus the
/// capabilities granted when it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRuleConfig {
    pub name: String,
    pub priority: i32,
    pub expression: String,
    pub acceptable_video: Vec<String>,
    pub acceptable_audio: Vec<String>,
    pub preferred_container: String,
    pub preferred_video: String,
    pub preferred_audio: String,
    #[serde(default)]
    pub transcode_profile: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.scheduler.default_max_attempts, 3);
        assert_eq!(config.scheduler.job_timeout, Duration::from_secs(3600));
        assert!(config.pipeline.ingestion_guard);
    }

    #[test]
    fn file_overrides_defaults() {
        let toml = r#"
            [scheduler]
            workers = 8
            job_timeout = "30m"

            [ingestion]
            max_body_bytes = "64MB"
        "#;
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml));
        let config: Config = figment.extract().unwrap();
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.ingestion.max_body_bytes, 64 * 1024 * 1024);
        // Untouched sections keep defaults.
        assert_eq!(config.server.port, 8084);
    }

    #[test]
    fn sqlite_path_extraction() {
        let db = DatabaseConfig {
            url: "sqlite://./data/tvarr.db?mode=rwc".to_string(),
            ..DatabaseConfig::default()
        };
        assert_eq!(db.sqlite_path(), Some(PathBuf::from("./data/tvarr.db")));

        let pg = DatabaseConfig {
            url: "postgres://localhost/tvarr".to_string(),
            ..DatabaseConfig::default()
        };
        assert_eq!(pg.sqlite_path(), None);
    }
}
