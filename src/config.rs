//! Configuration loading and validation.
//!
//! Configuration lives in a TOML file (`asktrack.toml` by default). Every
//! field has a default, so an empty or missing file is a valid setup:
//!
//! ```toml
//! [ai_service]
//! endpoint = "http://localhost:5555"
//! request_timeout_ms = 30000
//!
//! [tracker]
//! poll_interval_ms = 1000
//! adjustment_retention_secs = 300
//! stuck_after_failures = 60
//!
//! [store]
//! path = "asktrack.db"
//!
//! [telemetry]
//! enabled = true
//! # endpoint = "http://collector:4318/events"
//! service = "asktrack"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{IntoTrackerError, Result, TrackerError};
use crate::tracker::TrackerOptions;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "asktrack.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ai_service: AiServiceConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where and how to reach the AI service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiServiceConfig {
    /// Base URL (default: http://localhost:5555)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout in milliseconds (default: 30000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "http://localhost:5555".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for AiServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Polling behaviour shared by all trackers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Tick interval in milliseconds (default: 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long finalized adjustments stay readable, in seconds (default: 300)
    #[serde(default = "default_adjustment_retention_secs")]
    pub adjustment_retention_secs: u64,

    /// Consecutive poll failures before a task is reported stuck (default: 60)
    #[serde(default = "default_stuck_after_failures")]
    pub stuck_after_failures: u32,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_adjustment_retention_secs() -> u64 {
    300
}

fn default_stuck_after_failures() -> u32 {
    60
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            adjustment_retention_secs: default_adjustment_retention_secs(),
            stuck_after_failures: default_stuck_after_failures(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file (default: asktrack.db)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("asktrack.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Finalization events.
///
/// Without an `endpoint`, events are written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_service")]
    pub service: String,
}

fn default_true() -> bool {
    true
}

fn default_service() -> String {
    "asktrack".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            service: default_service(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::config_with_path(format!("cannot read config: {}", e), path.to_path_buf())
        })?;
        toml::from_str(&content)
            .map_err(|e| TrackerError::config_with_path(e.to_string(), path.to_path_buf()))
    }

    /// Load configuration from `path`, or use defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            debug!(path = %path.display(), "Loaded configuration");
            Ok(config)
        } else {
            debug!(path = %path.display(), "No configuration file; using defaults");
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).into_config()
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).into_config()
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        validate_url("ai_service.endpoint", &self.ai_service.endpoint)?;
        if self.ai_service.request_timeout_ms == 0 {
            return Err(TrackerError::invalid_config(
                "ai_service.request_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.tracker.poll_interval_ms == 0 {
            return Err(TrackerError::invalid_config(
                "tracker.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.tracker.adjustment_retention_secs == 0 {
            return Err(TrackerError::invalid_config(
                "tracker.adjustment_retention_secs",
                "must be greater than zero",
            ));
        }
        if self.tracker.stuck_after_failures == 0 {
            return Err(TrackerError::invalid_config(
                "tracker.stuck_after_failures",
                "must be greater than zero",
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(TrackerError::invalid_config("store.path", "must not be empty"));
        }
        if let Some(endpoint) = &self.telemetry.endpoint {
            validate_url("telemetry.endpoint", endpoint)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_service.request_timeout_ms)
    }

    /// Options for trackers that forget finalized tasks immediately.
    #[must_use]
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions::default()
            .with_poll_interval(Duration::from_millis(self.tracker.poll_interval_ms))
            .with_stuck_after_failures(self.tracker.stuck_after_failures)
    }

    /// Options for the adjustment tracker, which retains finalized tasks.
    #[must_use]
    pub fn adjustment_options(&self) -> TrackerOptions {
        let secs = i64::try_from(self.tracker.adjustment_retention_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        self.tracker_options()
            .with_retention(chrono::Duration::seconds(secs))
    }
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(TrackerError::invalid_config(
            field,
            format!("'{}' is not an http(s) URL", value),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.ai_service.endpoint, "http://localhost:5555");
        assert_eq!(config.tracker.poll_interval_ms, 1000);
        assert_eq!(config.tracker.adjustment_retention_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_toml_is_config_error() {
        let err = AppConfig::from_toml_str("[tracker\npoll_interval_ms =").unwrap_err();
        assert!(matches!(err, TrackerError::Config { path: None, .. }));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [tracker]
            poll_interval_ms = 250

            [telemetry]
            endpoint = "https://collector.example.com/events"
            "#,
        )
        .unwrap();
        assert_eq!(config.tracker.poll_interval_ms, 250);
        assert_eq!(config.tracker.stuck_after_failures, 60);
        assert!(config.telemetry.enabled);
        assert_eq!(
            config.tracker_options().poll_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_adjustment_options_carry_retention() {
        let config = AppConfig::default();
        assert_eq!(
            config.adjustment_options().retention,
            Some(chrono::Duration::minutes(5))
        );
        assert!(config.tracker_options().retention.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.ai_service.endpoint = "localhost:5555".to_string();
        assert!(matches!(
            config.validate(),
            Err(TrackerError::InvalidConfig { ref field, .. }) if field == "ai_service.endpoint"
        ));

        let mut config = AppConfig::default();
        config.tracker.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.telemetry.endpoint = Some("collector".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tracker\npoll_interval_ms = ").unwrap();
        match AppConfig::load(file.path()) {
            Err(TrackerError::Config { path, .. }) => assert_eq!(path.as_deref(), Some(file.path())),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[ai_service]"));
        assert_eq!(AppConfig::from_toml_str(&rendered).unwrap(), AppConfig::default());
    }
}
