//! Configuration module for Tracklight.
//!
//! `CaptureConfig` drives the capture engine at runtime and is replaced
//! wholesale through a validated merge patch; `ServiceConfig` is loaded
//! once from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be a positive duration")]
    NonPositiveDuration(&'static str),
    #[error("compression quality must be within (0, 1], got {0}")]
    QualityOutOfRange(f64),
    #[error("max retries must be between 1 and 10, got {0}")]
    RetriesOutOfRange(u32),
    #[error("max storage size must be positive")]
    ZeroStorageSize,
}

/// Runtime configuration for the capture engine.
///
/// Immutable once handed to services; replaced via [`CaptureConfig::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    // Timing (milliseconds)
    pub screenshot_interval: u64,
    pub max_video_duration: u64,
    pub idle_threshold: u64,
    pub cleanup_interval: u64,

    // Storage
    pub max_storage_size: u64,
    pub max_local_storage_age: u64,
    pub compression_quality: f64,
    pub max_retries: u32,

    // Capture triggers
    pub capture_on_idle: bool,
    pub capture_on_blur: bool,
    pub capture_on_focus: bool,
    pub capture_on_visibility_change: bool,
    pub capture_on_network_change: bool,

    // Monitoring toggles
    pub monitor_mouse_movement: bool,
    pub monitor_keyboard_activity: bool,
    pub monitor_scroll_activity: bool,
    pub monitor_network_activity: bool,
    pub monitor_tab_visibility: bool,

    // Notification toggles
    pub notify_on_storage_full: bool,
    pub notify_on_capture_error: bool,
    pub notify_on_upload_error: bool,
    pub notify_on_storage_error: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            screenshot_interval: 60_000,
            max_video_duration: 300_000,
            idle_threshold: 300_000,
            cleanup_interval: 3_600_000,
            max_storage_size: 500 * 1024 * 1024,
            max_local_storage_age: 7 * 24 * 60 * 60 * 1000,
            compression_quality: 0.8,
            max_retries: 3,
            capture_on_idle: true,
            capture_on_blur: true,
            capture_on_focus: true,
            capture_on_visibility_change: true,
            capture_on_network_change: true,
            monitor_mouse_movement: true,
            monitor_keyboard_activity: true,
            monitor_scroll_activity: true,
            monitor_network_activity: true,
            monitor_tab_visibility: true,
            notify_on_storage_full: true,
            notify_on_capture_error: true,
            notify_on_upload_error: true,
            notify_on_storage_error: true,
        }
    }
}

impl CaptureConfig {
    /// Apply a partial update, returning the merged configuration.
    ///
    /// Invalid values are rejected here rather than discovered later by
    /// a timer that never fires.
    pub fn merge(&self, patch: &ConfigPatch) -> Result<CaptureConfig, ConfigError> {
        let mut next = self.clone();

        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = patch.$field {
                    next.$field = v;
                }
            };
        }

        take!(screenshot_interval);
        take!(max_video_duration);
        take!(idle_threshold);
        take!(cleanup_interval);
        take!(max_storage_size);
        take!(max_local_storage_age);
        take!(compression_quality);
        take!(max_retries);
        take!(capture_on_idle);
        take!(capture_on_blur);
        take!(capture_on_focus);
        take!(capture_on_visibility_change);
        take!(capture_on_network_change);
        take!(monitor_mouse_movement);
        take!(monitor_keyboard_activity);
        take!(monitor_scroll_activity);
        take!(monitor_network_activity);
        take!(monitor_tab_visibility);
        take!(notify_on_storage_full);
        take!(notify_on_capture_error);
        take!(notify_on_upload_error);
        take!(notify_on_storage_error);

        next.validate()?;
        Ok(next)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.screenshot_interval == 0 {
            return Err(ConfigError::NonPositiveDuration("screenshot_interval"));
        }
        if self.max_video_duration == 0 {
            return Err(ConfigError::NonPositiveDuration("max_video_duration"));
        }
        if self.idle_threshold == 0 {
            return Err(ConfigError::NonPositiveDuration("idle_threshold"));
        }
        if self.cleanup_interval == 0 {
            return Err(ConfigError::NonPositiveDuration("cleanup_interval"));
        }
        if self.max_local_storage_age == 0 {
            return Err(ConfigError::NonPositiveDuration("max_local_storage_age"));
        }
        if self.compression_quality <= 0.0 || self.compression_quality > 1.0 {
            return Err(ConfigError::QualityOutOfRange(self.compression_quality));
        }
        if self.max_retries == 0 || self.max_retries > 10 {
            return Err(ConfigError::RetriesOutOfRange(self.max_retries));
        }
        if self.max_storage_size == 0 {
            return Err(ConfigError::ZeroStorageSize);
        }
        Ok(())
    }

    pub fn screenshot_interval(&self) -> Duration {
        Duration::from_millis(self.screenshot_interval)
    }

    pub fn max_video_duration(&self) -> Duration {
        Duration::from_millis(self.max_video_duration)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval)
    }
}

/// Partial capture configuration used for merge updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub screenshot_interval: Option<u64>,
    pub max_video_duration: Option<u64>,
    pub idle_threshold: Option<u64>,
    pub cleanup_interval: Option<u64>,
    pub max_storage_size: Option<u64>,
    pub max_local_storage_age: Option<u64>,
    pub compression_quality: Option<f64>,
    pub max_retries: Option<u32>,
    pub capture_on_idle: Option<bool>,
    pub capture_on_blur: Option<bool>,
    pub capture_on_focus: Option<bool>,
    pub capture_on_visibility_change: Option<bool>,
    pub capture_on_network_change: Option<bool>,
    pub monitor_mouse_movement: Option<bool>,
    pub monitor_keyboard_activity: Option<bool>,
    pub monitor_scroll_activity: Option<bool>,
    pub monitor_network_activity: Option<bool>,
    pub monitor_tab_visibility: Option<bool>,
    pub notify_on_storage_full: Option<bool>,
    pub notify_on_capture_error: Option<bool>,
    pub notify_on_upload_error: Option<bool>,
    pub notify_on_storage_error: Option<bool>,
}

/// Host-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Companion monitoring process WebSocket URL.
    pub ws_url: String,
    /// Object storage API base URL.
    pub storage_url: String,
    /// Object storage bucket for captured artifacts.
    pub storage_bucket: String,
    /// Path to the SQLite metadata database.
    pub db_path: String,
    /// Directory for locally cached artifacts awaiting upload.
    pub cache_dir: String,
    /// External screenshot command; frames come from its stdout.
    pub capture_cmd: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8765".to_string(),
            storage_url: "http://localhost:8000".to_string(),
            storage_bucket: "user-captures".to_string(),
            db_path: "tracklight.db".to_string(),
            cache_dir: ".tracklight-cache".to_string(),
            capture_cmd: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TRACKLIGHT_WS_URL`: companion process WebSocket URL
    /// - `TRACKLIGHT_STORAGE_URL`: object storage base URL
    /// - `TRACKLIGHT_STORAGE_BUCKET`: artifact bucket name
    /// - `TRACKLIGHT_DB_PATH`: metadata database path
    /// - `TRACKLIGHT_CACHE_DIR`: local artifact cache directory
    /// - `TRACKLIGHT_CAPTURE_CMD`: external frame capture command
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(url) = env::var("TRACKLIGHT_WS_URL") {
            cfg.ws_url = url;
        }
        if let Ok(url) = env::var("TRACKLIGHT_STORAGE_URL") {
            cfg.storage_url = url;
        }
        if let Ok(bucket) = env::var("TRACKLIGHT_STORAGE_BUCKET") {
            cfg.storage_bucket = bucket;
        }
        if let Ok(path) = env::var("TRACKLIGHT_DB_PATH") {
            cfg.db_path = path;
        }
        if let Ok(dir) = env::var("TRACKLIGHT_CACHE_DIR") {
            cfg.cache_dir = dir;
        }
        if let Ok(cmd) = env::var("TRACKLIGHT_CAPTURE_CMD") {
            cfg.capture_cmd = Some(cmd);
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.screenshot_interval, 60_000);
        assert_eq!(cfg.idle_threshold, 300_000);
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.capture_on_idle);
    }

    #[test]
    fn test_merge_overrides_only_given_fields() {
        let cfg = CaptureConfig::default();
        let patch = ConfigPatch {
            screenshot_interval: Some(1000),
            capture_on_idle: Some(false),
            ..Default::default()
        };
        let merged = cfg.merge(&patch).unwrap();
        assert_eq!(merged.screenshot_interval, 1000);
        assert!(!merged.capture_on_idle);
        // Untouched fields keep their values.
        assert_eq!(merged.max_video_duration, cfg.max_video_duration);
    }

    #[test]
    fn test_merge_rejects_zero_interval() {
        let cfg = CaptureConfig::default();
        let patch = ConfigPatch {
            screenshot_interval: Some(0),
            ..Default::default()
        };
        assert!(cfg.merge(&patch).is_err());
    }

    #[test]
    fn test_merge_rejects_bad_quality() {
        let cfg = CaptureConfig::default();
        for q in [0.0, -0.2, 1.5] {
            let patch = ConfigPatch {
                compression_quality: Some(q),
                ..Default::default()
            };
            assert!(cfg.merge(&patch).is_err(), "quality {} accepted", q);
        }
    }

    #[test]
    fn test_merge_rejects_zero_retries() {
        let cfg = CaptureConfig::default();
        let patch = ConfigPatch {
            max_retries: Some(0),
            ..Default::default()
        };
        assert!(cfg.merge(&patch).is_err());
    }

    #[test]
    fn test_patch_deserializes_camel_case() {
        let patch: ConfigPatch =
            serde_json::from_str(r#"{"screenshotInterval": 5000, "notifyOnUploadError": false}"#)
                .unwrap();
        assert_eq!(patch.screenshot_interval, Some(5000));
        assert_eq!(patch.notify_on_upload_error, Some(false));
    }

    #[test]
    fn test_service_config_defaults() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.ws_url, "ws://localhost:8765");
        assert_eq!(cfg.db_path, "tracklight.db");
    }
}
