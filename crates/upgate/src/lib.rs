//! Self-update coordinator: decides when to look for a newer build, fetches
//! and verifies it, and hands the verified artifact to the platform installer.

pub mod clock;
pub mod error;
pub mod installer;
pub mod logging;
pub mod manager;
mod persist;
pub mod policy;
pub mod settings;

pub use clock::{Clock, SystemClock};
pub use error::ManagerError;
pub use installer::{InstallError, InstallRequest, Installer, SystemInstaller};
pub use manager::{CHECK_INTERVAL_MILLIS, ManagerParts, UpdateManager};
pub use policy::{JsonFileStore, MemoryStore, PolicyError, PolicyState, PolicyStore};
pub use settings::UpdaterSettings;
pub use upgate_core::{
    Artifact, CheckOutcome, CleanupReport, DownloadProgress, FailureKind, HttpTransport,
    UpdateInfo,
};

pub use persist::write_atomic;
