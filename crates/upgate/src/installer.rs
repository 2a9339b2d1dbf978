use std::path::PathBuf;

use log::info;
use thiserror::Error;

/// A verified artifact and a hint for how the platform should open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub artifact: PathBuf,
    pub media_type: String,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to hand {} to the system installer: {source}", path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The host platform's package installer.
pub trait Installer: Send + Sync {
    /// Dispatch `request`. Returning `Ok` means the handoff happened, not that
    /// the installation finished.
    ///
    /// # Errors
    /// Returns an error when the platform refuses the handoff.
    fn install(&self, request: &InstallRequest) -> Result<(), InstallError>;
}

/// Opens the artifact with the platform's default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInstaller;

impl Installer for SystemInstaller {
    fn install(&self, request: &InstallRequest) -> Result<(), InstallError> {
        info!(
            "Opening {} ({}) with the system handler",
            request.artifact.display(),
            request.media_type
        );
        open::that_detached(&request.artifact).map_err(|source| InstallError::Launch {
            path: request.artifact.clone(),
            source,
        })
    }
}
