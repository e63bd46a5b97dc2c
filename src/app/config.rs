use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_DETAILS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AdbSettings {
    #[serde(default)]
    pub command_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub refresh_interval_secs: u64,
    pub auto_refresh: bool,
    pub load_detailed: bool,
    pub max_concurrent_details: usize,
    pub enable_tracker: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            auto_refresh: true,
            load_detailed: true,
            max_concurrent_details: DEFAULT_MAX_CONCURRENT_DETAILS,
            enable_tracker: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherSettings {
    pub max_threads: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { max_threads: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerSettings {
    pub not_found_backoff_ms: u64,
    pub failure_backoff_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            not_found_backoff_ms: 5_000,
            failure_backoff_ms: 2_000,
            stop_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub pending_retry_ms: u64,
    pub enumeration_retry_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            pending_retry_ms: 200,
            enumeration_retry_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
}

impl DiscoveryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.device.refresh_interval_secs)
    }

    pub fn adb_program(&self) -> String {
        resolve_adb_program(&self.adb.command_path)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LAZY_BLACKTEA_DEVICES_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lazy_blacktea_devices.json")
}

pub fn load_config() -> Result<DiscoveryConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<DiscoveryConfig, AppError> {
    if !path.exists() {
        return Ok(DiscoveryConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: DiscoveryConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(config: &DiscoveryConfig, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

pub fn validate_config(mut config: DiscoveryConfig) -> DiscoveryConfig {
    config.device.refresh_interval_secs = clamp_refresh_interval_secs(config.device.refresh_interval_secs);
    if config.device.max_concurrent_details == 0 {
        config.device.max_concurrent_details = DEFAULT_MAX_CONCURRENT_DETAILS;
    }
    if config.dispatcher.max_threads == 0 {
        config.dispatcher.max_threads = DispatcherSettings::default().max_threads;
    }
    let tracker_defaults = TrackerSettings::default();
    if config.tracker.not_found_backoff_ms == 0 {
        config.tracker.not_found_backoff_ms = tracker_defaults.not_found_backoff_ms;
    }
    if config.tracker.failure_backoff_ms == 0 {
        config.tracker.failure_backoff_ms = tracker_defaults.failure_backoff_ms;
    }
    if config.tracker.stop_timeout_ms == 0 {
        config.tracker.stop_timeout_ms = tracker_defaults.stop_timeout_ms;
    }
    let coordinator_defaults = CoordinatorSettings::default();
    if config.coordinator.pending_retry_ms == 0 {
        config.coordinator.pending_retry_ms = coordinator_defaults.pending_retry_ms;
    }
    if config.coordinator.enumeration_retry_ms == 0 {
        config.coordinator.enumeration_retry_ms = coordinator_defaults.enumeration_retry_ms;
    }
    config
}

pub fn clamp_refresh_interval_secs(secs: u64) -> u64 {
    secs.max(MIN_REFRESH_INTERVAL_SECS)
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let value = serde_json::json!({
            "device": { "refresh_interval_secs": 12 },
            "adb": { "command_path": "'/opt/platform-tools/adb'" }
        });
        let config: DiscoveryConfig = serde_json::from_value(value).expect("config");
        let config = validate_config(config);
        assert_eq!(config.device.refresh_interval_secs, 12);
        assert!(config.device.auto_refresh);
        assert_eq!(config.device.max_concurrent_details, 3);
        assert_eq!(config.tracker.not_found_backoff_ms, 5_000);
        assert_eq!(config.adb_program(), "/opt/platform-tools/adb");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = DiscoveryConfig::default();
        config.device.refresh_interval_secs = 1;
        config.device.max_concurrent_details = 0;
        config.dispatcher.max_threads = 0;
        config.tracker.stop_timeout_ms = 0;
        let validated = validate_config(config);
        assert_eq!(validated.device.refresh_interval_secs, MIN_REFRESH_INTERVAL_SECS);
        assert_eq!(validated.device.max_concurrent_details, 3);
        assert_eq!(validated.dispatcher.max_threads, 4);
        assert_eq!(validated.tracker.stop_timeout_ms, 2_000);
    }

    #[test]
    fn resolves_empty_to_default_adb() {
        assert_eq!(resolve_adb_program(""), "adb");
        assert_eq!(resolve_adb_program("  \"/usr/bin/adb\" "), "/usr/bin/adb");
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.json");
        assert_eq!(load_config_from_path(&path).expect("defaults"), DiscoveryConfig::default());

        let mut config = DiscoveryConfig::default();
        config.device.enable_tracker = false;
        save_config_to_path(&config, &path).expect("save");
        let loaded = load_config_from_path(&path).expect("load");
        assert!(!loaded.device.enable_tracker);
    }

    #[test]
    fn rejects_malformed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_config_from_path(&path).expect_err("parse error");
        assert_eq!(err.code, "ERR_VALIDATION");
    }
}
