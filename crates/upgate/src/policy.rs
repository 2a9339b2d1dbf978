//! Persisted update policy: throttle timestamp, auto-check switch, dismissed
//! version and endpoint override.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    /// Epoch millis of the last check attempt, 0 when never checked.
    #[serde(rename = "last_update_check", default)]
    pub last_check_millis: i64,

    #[serde(rename = "auto_update_check", default = "default_true")]
    pub auto_check_enabled: bool,

    #[serde(rename = "dismissed_update_version", default)]
    pub dismissed_version_code: Option<u32>,

    #[serde(
        rename = "update_check_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_check_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            last_check_millis: 0,
            auto_check_enabled: true,
            dismissed_version_code: None,
            custom_check_url: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write policy file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode policy state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable storage for [`PolicyState`].
pub trait PolicyStore: Send + Sync {
    /// # Errors
    /// Returns an error when the backing store exists but cannot be read.
    fn load(&self) -> Result<PolicyState, PolicyError>;

    /// # Errors
    /// Returns an error when the state cannot be persisted.
    fn save(&self, state: &PolicyState) -> Result<(), PolicyError>;
}

/// Policy stored as a JSON object in a single file, replaced atomically on
/// every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl PolicyStore for JsonFileStore {
    fn load(&self) -> Result<PolicyState, PolicyError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("No policy file at {}, using defaults", self.path.display());
                return Ok(PolicyState::default());
            }
            Err(source) => {
                return Err(PolicyError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        Ok(serde_json::from_str(&content).unwrap_or_else(|error| {
            warn!(
                "Ignoring corrupt policy file {}: {error}",
                self.path.display()
            );
            PolicyState::default()
        }))
    }

    fn save(&self, state: &PolicyState) -> Result<(), PolicyError> {
        let data = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &data).map_err(|source| PolicyError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-process store for hosts that persist policy elsewhere, and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<PolicyState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(state: PolicyState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PolicyState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PolicyStore for MemoryStore {
    fn load(&self) -> Result<PolicyState, PolicyError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PolicyState) -> Result<(), PolicyError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        Ok(())
    }
}
