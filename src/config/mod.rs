//! Configuration reading and data directory paths.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8090";
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_DOWNLOAD_TIMEOUT_MS: u64 = 60_000;

pub const BACKEND_URL_ENV: &str = "VIEWER_BACKEND_URL";
pub const USER_AGENT_ENV: &str = "VIEWER_USER_AGENT";

/// viewer_config.json shape. Every field is optional; accessors supply
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerConfig {
    #[serde(default)]
    pub backend_url: Option<String>,
    /// Client user agent, used to pick mobile fallback behavior.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub volume: Option<f32>,
    #[serde(default)]
    pub frame_interval_ms: Option<u64>,
    #[serde(default)]
    pub probe_timeout_ms: Option<u64>,
    /// Upper bound on one media download, decode and save fetches alike.
    #[serde(default)]
    pub download_timeout_ms: Option<u64>,
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl ViewerConfig {
    pub fn backend_url(&self) -> &str {
        self.backend_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(DEFAULT_BACKEND_URL)
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or_default()
    }

    pub fn volume(&self) -> f32 {
        self.volume
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(1.0)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(
            self.frame_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(
            self.probe_timeout_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
        )
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(
            self.download_timeout_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_MS),
        )
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(paths::default_download_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().filter(|d| !d.is_empty()).map(PathBuf::from)
    }

    /// Apply environment overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(BACKEND_URL_ENV).filter(|v| !v.is_empty()) {
            self.backend_url = Some(url);
        }
        if let Some(ua) = lookup(USER_AGENT_ENV) {
            self.user_agent = Some(ua);
        }
    }
}

/// Read viewer_config.json from the data directory, with environment
/// overrides applied.
pub fn read_viewer_config() -> ViewerConfig {
    let mut config: ViewerConfig = read_json_file(&get_config_path()).unwrap_or_default();
    config.apply_env(|key| std::env::var(key).ok());
    config
}

/// Path to viewer_config.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("viewer_config.json")
}

/// Path to the saved login session.
pub fn get_session_path() -> PathBuf {
    get_data_dir().join("session.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = ViewerConfig::default();
        assert_eq!(config.backend_url(), DEFAULT_BACKEND_URL);
        assert_eq!(config.user_agent(), "");
        assert_eq!(config.volume(), 1.0);
        assert_eq!(config.frame_interval(), Duration::from_millis(16));
        assert_eq!(config.probe_timeout(), Duration::from_millis(5000));
        assert_eq!(config.download_timeout(), Duration::from_secs(60));
        assert_eq!(config.log_dir(), None);
    }

    #[test]
    fn parses_camel_case_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer_config.json");
        std::fs::write(
            &path,
            r#"{"backendUrl": "https://pb.example.com", "volume": 1.7, "frameIntervalMs": 33,
                "downloadTimeoutMs": 2500, "downloadDir": "/tmp/dl", "logDir": "/tmp/logs", "unknownKey": true}"#,
        )
        .unwrap();

        let config: ViewerConfig = read_json_file(&path).unwrap();
        assert_eq!(config.backend_url(), "https://pb.example.com");
        assert_eq!(config.volume(), 1.0);
        assert_eq!(config.frame_interval(), Duration::from_millis(33));
        assert_eq!(config.download_timeout(), Duration::from_millis(2500));
        assert_eq!(config.download_dir(), PathBuf::from("/tmp/dl"));
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn malformed_or_missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer_config.json");
        assert!(read_json_file::<ViewerConfig>(&path).is_none());
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_json_file::<ViewerConfig>(&path).is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = ViewerConfig {
            backend_url: Some("http://file:8090".into()),
            ..Default::default()
        };
        config.apply_env(|key| match key {
            BACKEND_URL_ENV => Some("http://env:8090".into()),
            USER_AGENT_ENV => Some("Mozilla/5.0 (iPhone)".into()),
            _ => None,
        });
        assert_eq!(config.backend_url(), "http://env:8090");
        assert_eq!(config.user_agent(), "Mozilla/5.0 (iPhone)");

        let mut untouched = ViewerConfig::default();
        untouched.apply_env(|_| None);
        assert_eq!(untouched, ViewerConfig::default());
    }
}
