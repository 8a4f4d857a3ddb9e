/// Runtime settings
///
/// Loaded from a JSON file. Every field has a default, so an empty object
/// is a complete configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed settings: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where a failed update check leads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFailurePolicy {
    /// Always offer the cached path
    #[default]
    PreferCached,
    /// Offer the cached path only when the cache holds a readable manifest
    DetectCache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub utility_path: PathBuf,
    pub utility_timeout_ms: Option<u64>,
    pub reprogram_timeout_ms: Option<u64>,
    pub serial_baud: u32,
    pub session_timeout_ms: u64,
    pub repository_prefix: Option<String>,
    pub index_extension: String,
    pub repository_root: PathBuf,
    /// Keys returned per listing; `None` lists everything
    pub repository_page_limit: Option<usize>,
    pub cache_dir: PathBuf,
    pub settle_delay_ms: u64,
    pub progress_total_lines: u64,
    pub check_failure_policy: CheckFailurePolicy,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            utility_path: PathBuf::from("cfgtool"),
            utility_timeout_ms: Some(30_000),
            reprogram_timeout_ms: Some(600_000),
            serial_baud: devadapter::session::DEFAULT_BAUD,
            session_timeout_ms: 10_000,
            repository_prefix: None,
            index_extension: ".xml".to_string(),
            repository_root: PathBuf::from("repository"),
            repository_page_limit: None,
            cache_dir: std::env::temp_dir().join("fwpilot"),
            settle_delay_ms: 500,
            progress_total_lines: 30_000,
            check_failure_policy: CheckFailurePolicy::PreferCached,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn utility_timeout(&self) -> Option<Duration> {
        self.utility_timeout_ms.map(Duration::from_millis)
    }

    pub fn reprogram_timeout(&self) -> Option<Duration> {
        self.reprogram_timeout_ms.map(Duration::from_millis)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Parsed `log_level`, `Info` when unrecognised
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', using info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_all_defaults() {
        assert_eq!(Settings::from_json("{}").unwrap(), Settings::default());
    }

    #[test]
    fn test_partial_settings_override_defaults() {
        let settings = Settings::from_json(
            r#"{"utility_path": "/opt/cfgtool", "utility_timeout_ms": null,
                "check_failure_policy": "detect_cache", "log_level": "debug"}"#,
        )
        .unwrap();
        assert_eq!(settings.utility_path, PathBuf::from("/opt/cfgtool"));
        assert_eq!(settings.utility_timeout(), None);
        assert_eq!(settings.check_failure_policy, CheckFailurePolicy::DetectCache);
        assert_eq!(settings.level_filter(), log::LevelFilter::Debug);
        assert_eq!(settings.progress_total_lines, 30_000);
        assert_eq!(settings.settle_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_malformed_and_missing_files() {
        assert!(matches!(
            Settings::from_json(r#"{"serial_baud": "fast"}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            Settings::load(Path::new("/nonexistent/fwpilot.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwpilot.json");
        std::fs::write(&path, r#"{"serial_baud": 57600, "log_level": "shouting"}"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.serial_baud, 57_600);
        assert_eq!(settings.level_filter(), log::LevelFilter::Info);
    }
}
