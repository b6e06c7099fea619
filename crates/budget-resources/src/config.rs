use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MEMORY_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_MEMORY_PRESSURE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_AUTO_CLEANUP_INTERVAL_SECONDS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read resource config `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid resource config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings the resource core reads from the application's preferences.
///
/// Field names follow the preferences file (`memoryThresholdBytes`, `memoryPressureBytes`,
/// `debugMode`, `autoCleanupIntervalSeconds`); missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Growth of process memory across a monitored operation above which a diagnostic is
    /// emitted (default: 100MB).
    pub memory_threshold_bytes: u64,
    /// Resident process memory above which the process counts as under memory pressure;
    /// `0` disables pressure detection (default: 2GB).
    pub memory_pressure_bytes: u64,
    /// Log every monitored operation and auto-cleanup tick at `debug` level (default: off).
    pub debug_mode: bool,
    /// Period of the background auto-cleanup check; `0` disables it (default: 300s).
    pub auto_cleanup_interval_seconds: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            memory_pressure_bytes: DEFAULT_MEMORY_PRESSURE_BYTES,
            debug_mode: false,
            auto_cleanup_interval_seconds: DEFAULT_AUTO_CLEANUP_INTERVAL_SECONDS,
        }
    }
}

impl ResourceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Clamp values that would make the monitor useless.
    pub fn normalized(mut self) -> Self {
        // A zero threshold would flag every operation as a potential leak.
        self.memory_threshold_bytes = self.memory_threshold_bytes.max(1);
        self
    }

    /// The auto-cleanup period, or `None` when the background task is disabled.
    pub fn auto_cleanup_interval(&self) -> Option<Duration> {
        match self.auto_cleanup_interval_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = ResourceConfig::from_json_str(r#"{ "debugMode": true }"#).expect("parse");
        assert!(config.debug_mode);
        assert_eq!(config.memory_threshold_bytes, DEFAULT_MEMORY_THRESHOLD_BYTES);
        assert_eq!(config.memory_pressure_bytes, DEFAULT_MEMORY_PRESSURE_BYTES);
        assert_eq!(
            config.auto_cleanup_interval(),
            Some(Duration::from_secs(DEFAULT_AUTO_CLEANUP_INTERVAL_SECONDS))
        );
    }

    #[test]
    fn zero_interval_disables_auto_cleanup_and_zero_threshold_is_clamped() {
        let config = ResourceConfig::from_json_str(
            r#"{ "memoryThresholdBytes": 0, "autoCleanupIntervalSeconds": 0 }"#,
        )
        .expect("parse");
        assert_eq!(config.auto_cleanup_interval(), None);
        assert_eq!(config.memory_threshold_bytes, 1);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("resources.json");
        std::fs::write(
            &path,
            r#"{ "memoryThresholdBytes": 2048, "debugMode": false, "autoCleanupIntervalSeconds": 5 }"#,
        )
        .expect("write config");

        let config = ResourceConfig::from_path(&path).expect("load config");
        assert_eq!(
            config,
            ResourceConfig {
                memory_threshold_bytes: 2048,
                memory_pressure_bytes: DEFAULT_MEMORY_PRESSURE_BYTES,
                debug_mode: false,
                auto_cleanup_interval_seconds: 5,
            }
        );
    }

    #[test]
    fn reports_missing_file_and_bad_json() {
        let err = ResourceConfig::from_path("/definitely/not/here.json").expect_err("missing");
        assert!(matches!(err, ConfigError::Io { .. }), "{err}");

        let err = ResourceConfig::from_json_str(r#"{ "debugMode": "yes" }"#).expect_err("bad");
        assert!(matches!(err, ConfigError::Json(_)), "{err}");
    }
}
