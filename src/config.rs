//! Configuration loader and validator for the livesync agent runner.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::uploader::BatchSizes;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub livesync: LiveSync,
    pub repository: Repository,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
}

/// Queue draining settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveSync {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    /// Processed queue entries older than this many days are purged by `clean`.
    #[serde(default = "default_queue_entry_ttl_days")]
    pub queue_entry_ttl_days: u32,
}

/// Record repository the MARCXML backend uploads to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_initial_batch_size() -> usize {
    500
}

fn default_queue_entry_ttl_days() -> u32 {
    30
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        let dir = self.app.data_dir.trim();
        match (dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => dir.to_string(),
        }
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/livesync.db", self.resolved_data_dir()))
    }

    pub fn batch_sizes(&self) -> BatchSizes {
        BatchSizes {
            batch_size: self.livesync.batch_size,
            initial_batch_size: self.livesync.initial_batch_size,
        }
    }

    pub fn repository_timeout(&self) -> Duration {
        Duration::from_secs(self.repository.timeout_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.livesync.batch_size == 0 {
        return Err(ConfigError::Invalid("livesync.batch_size must be > 0"));
    }
    if cfg.livesync.initial_batch_size == 0 {
        return Err(ConfigError::Invalid(
            "livesync.initial_batch_size must be > 0",
        ));
    }

    if Url::parse(cfg.repository.url.trim()).is_err() {
        return Err(ConfigError::Invalid("repository.url must be an absolute URL"));
    }
    if cfg.repository.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("repository.timeout_seconds must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000

livesync:
  batch_size: 100
  initial_batch_size: 500
  queue_entry_ttl_days: 30

repository:
  url: "https://records.example.org/"
  token: "YOUR_REPOSITORY_TOKEN"
  timeout_seconds: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.batch_sizes().batch_size, 100);
        assert_eq!(cfg.batch_sizes().initial_batch_size, 500);
    }

    #[test]
    fn livesync_defaults_apply() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
livesync: {}
repository:
  url: "http://localhost:8080/"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.livesync.batch_size, 100);
        assert_eq!(cfg.livesync.initial_batch_size, 500);
        assert_eq!(cfg.livesync.queue_entry_ttl_days, 30);
        assert_eq!(cfg.repository.timeout_seconds, 30);
        assert!(cfg.repository.token.is_empty());
    }

    #[test]
    fn zero_batch_sizes_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.livesync.batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("livesync.batch_size")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.livesync.initial_batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("initial_batch_size")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_repository() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.repository.url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.repository.timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_app() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = "  ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.livesync.queue_entry_ttl_days, 30);
        assert_eq!(cfg.repository.url, "https://records.example.org/");
    }
}
