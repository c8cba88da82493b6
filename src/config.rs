//! Layered configuration.
//!
//! Sources, lowest to highest precedence: compiled-in defaults, an optional
//! `config/default.toml`, then environment variables prefixed
//! `REVIEW_ENGINE_` (double-underscore-separated for nested keys, e.g.
//! `REVIEW_ENGINE_SERVER__PORT`). `.env` is loaded via `dotenvy::dotenv()`
//! before the environment is read, same as the teacher's binaries do at
//! startup. Paths accept a leading `~` via `shellexpand`.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ReviewError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub data_dir: String,
    pub working_copy_base: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            working_copy_base: "./data/working-copies".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    pub worker_count: usize,
    pub channel_capacity: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { worker_count: 2, channel_capacity: 256 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerSection {
    pub tick_interval_secs: u64,
    pub max_concurrent_polls: usize,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self { tick_interval_secs: 60, max_concurrent_polls: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantSection {
    pub binary: String,
    pub batch_timeout_secs: u64,
    pub max_tokens_per_batch: usize,
    pub context_map_tokens: usize,
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            binary: "code-assistant".to_string(),
            batch_timeout_secs: 1800,
            max_tokens_per_batch: 100_000,
            context_map_tokens: 262_144,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentSection {
    pub dry_run: bool,
}

impl Default for CommentSection {
    fn default() -> Self {
        Self { dry_run: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    pub enabled: bool,
    pub otlp_endpoint: String,
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub assistant: AssistantSection,
    #[serde(default)]
    pub comment: CommentSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl Config {
    /// Load layered config: compiled defaults -> `config/default.toml` (if
    /// present) -> `REVIEW_ENGINE_*` env vars. Loads `.env` as a side effect
    /// the first time it's called, matching the teacher's binaries.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).map_err(config_err)?)
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("REVIEW_ENGINE").separator("__"));

        let raw: Config = builder.build().map_err(config_err)?.try_deserialize().map_err(config_err)?;
        raw.validate()?;
        Ok(raw)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.worker_count == 0 {
            return Err(ReviewError::Validation("scheduler.worker_count must be at least 1".to_string()));
        }
        if self.assistant.max_tokens_per_batch == 0 {
            return Err(ReviewError::Validation("assistant.max_tokens_per_batch must be positive".to_string()));
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.data_dir_path().join("review_engine.db").display())
    }

    pub fn data_dir_path(&self) -> PathBuf {
        expand_path(&self.storage.data_dir)
    }

    pub fn working_copy_base_path(&self) -> PathBuf {
        expand_path(&self.storage.working_copy_base)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn config_err(e: config::ConfigError) -> ReviewError {
    ReviewError::Fatal(format!("configuration error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = Config::default();
        config.scheduler.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tilde_expands_against_home() {
        let expanded = expand_path("~/review-engine-data");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn database_url_points_inside_data_dir() {
        let config = Config::default();
        assert!(config.database_url().ends_with("review_engine.db"));
    }
}
