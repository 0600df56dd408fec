use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{LevelFilter, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::{
    DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_LIVENESS_INTERVAL_MS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_SCAN_DURATION_MS,
};
use crate::utils::ensure_directory_exists;

/// Bounds accepted by the `set` command, in seconds
pub const MIN_SETTING_SECS: u64 = 1;
pub const MAX_SETTING_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    #[default]
    Text,
    Json,
}

/// Which BLE backend drives the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[default]
    Bluest,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    /// How long a scan runs
    pub scan_duration_ms: u64,
    /// Upper bound for one connect attempt, discovery included
    pub connection_timeout_ms: u64,
    /// Pause between liveness cycles
    pub liveness_interval_ms: u64,
    /// How long the console waits for a read before reporting it as slow
    pub read_timeout_ms: u64,
    /// `error`, `warn`, `info`, `debug` or `trace`
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_format: EventFormat,
    pub adapter: AdapterKind,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        InspectorConfig {
            scan_duration_ms: DEFAULT_SCAN_DURATION_MS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            event_format: EventFormat::default(),
            adapter: AdapterKind::default(),
        }
    }
}

impl InspectorConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// The configured level, or `Info` when it does not parse
    pub fn log_level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or_else(|_| {
            warn!("Unknown log level {:?}, using info.", self.log_level);
            LevelFilter::Info
        })
    }

    pub fn set_scan_duration_secs(&mut self, seconds: u64) -> Result<()> {
        Self::check_setting("scan time", seconds)?;
        self.scan_duration_ms = seconds * 1000;
        Ok(())
    }

    pub fn set_connection_timeout_secs(&mut self, seconds: u64) -> Result<()> {
        Self::check_setting("connection timeout", seconds)?;
        self.connection_timeout_ms = seconds * 1000;
        Ok(())
    }

    fn check_setting(name: &str, seconds: u64) -> Result<()> {
        if !(MIN_SETTING_SECS..=MAX_SETTING_SECS).contains(&seconds) {
            bail!(
                "{} must be between {} and {} seconds, got {}",
                name,
                MIN_SETTING_SECS,
                MAX_SETTING_SECS,
                seconds
            );
        }
        Ok(())
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!(
                "Config file not found at {:?}, using default.",
                file_path_str
            );
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(config_dir).await?;
        }
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize inspector config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Inspector config saved to {:?}.", file_path_str);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ble-inspector-{}-{}", name, std::process::id()))
    }

    #[test]
    fn default_timings() {
        let config = InspectorConfig::default();
        assert_eq!(config.scan_duration(), Duration::from_secs(30));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.liveness_interval(), Duration::from_secs(2));
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.log_level_filter(), LevelFilter::Info);
        assert_eq!(config.adapter, AdapterKind::Bluest);
    }

    #[test]
    fn settings_are_bounded() {
        let mut config = InspectorConfig::default();
        assert!(config.set_scan_duration_secs(0).is_err());
        assert!(config.set_connection_timeout_secs(61).is_err());
        config.set_scan_duration_secs(60).unwrap();
        config.set_connection_timeout_secs(1).unwrap();
        assert_eq!(config.scan_duration_ms, 60_000);
        assert_eq!(config.connection_timeout_ms, 1_000);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: InspectorConfig =
            serde_json::from_str(r#"{"adapter": "simulated", "log_format": "json"}"#).unwrap();
        assert_eq!(config.adapter, AdapterKind::Simulated);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.scan_duration_ms, DEFAULT_SCAN_DURATION_MS);
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = InspectorConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert_eq!(config.log_level_filter(), LevelFilter::Info);
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let path = scratch_dir("missing").join("config.json");
        let config = InspectorConfig::load_config(&path).await.unwrap();
        assert_eq!(config, InspectorConfig::default());
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = scratch_dir("saved");
        let path = dir.join("nested").join("config.json");
        let mut config = InspectorConfig::default();
        config.set_scan_duration_secs(12).unwrap();
        config.event_format = EventFormat::Json;

        config.save_config(&path).await.unwrap();
        let loaded = InspectorConfig::load_config(&path).await.unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
