use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use upgate_core::downloader::DEFAULT_MAX_ARTIFACT_SIZE;
use upgate_platform::AppPaths;

use crate::persist::write_atomic;

pub const DEFAULT_CHECK_URL: &str =
    "https://api.github.com/repos/upgate-rs/upgate/releases/latest";
pub const DEFAULT_MEDIA_TYPE: &str = "application/vnd.android.package-archive";

/// Static updater configuration, read from `settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterSettings {
    #[serde(default = "default_check_url")]
    pub default_check_url: String,

    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_max_artifact_size")]
    pub max_artifact_size_bytes: u64,

    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,

    #[serde(default = "default_media_type")]
    pub artifact_media_type: String,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_check_url() -> String {
    DEFAULT_CHECK_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_artifact_size() -> u64 {
    DEFAULT_MAX_ARTIFACT_SIZE
}

fn default_artifact_prefix() -> String {
    "upgate-update".to_string()
}

fn default_media_type() -> String {
    DEFAULT_MEDIA_TYPE.to_string()
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            default_check_url: default_check_url(),
            connect_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
            max_artifact_size_bytes: default_max_artifact_size(),
            artifact_prefix: default_artifact_prefix(),
            artifact_media_type: default_media_type(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl UpdaterSettings {
    /// Load settings from `paths`. A missing or unreadable file yields defaults.
    #[must_use]
    pub fn load(paths: &AppPaths) -> Self {
        Self::load_from_path(&paths.settings_file())
    }

    fn load_from_path(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_else(|error| {
            warn!("Ignoring invalid settings file {}: {error}", path.display());
            Self::default()
        })
    }

    /// # Errors
    /// Returns an error if the config directory or file cannot be written.
    pub fn save(&self, paths: &AppPaths) -> std::io::Result<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(&paths.settings_file(), &content)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}
