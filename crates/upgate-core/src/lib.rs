//! Update discovery and verified download.
//!
//! [`UpdateChecker`] turns a release metadata endpoint into a
//! [`CheckOutcome`]; [`UpdateDownloader`] streams the artifact to disk and
//! commits it only after its SHA-256 digest matches.

pub mod checker;
pub mod downloader;
pub mod integrity;
pub mod release;
pub mod transport;
pub mod worker;

pub use checker::{CheckError, CheckOutcome, UpdateChecker};
pub use downloader::{
    Artifact, ArtifactSlot, ArtifactState, CleanupReport, DownloadError, DownloadProgress,
    DownloaderConfig, UpdateDownloader,
};
pub use integrity::{compute_digest, is_secure_transport, sanitize_name, verify_digest};
pub use release::{ReleaseError, ReleaseMetadata, UpdateInfo};
pub use transport::{ByteStream, HttpTransport, ReqwestTransport, TransportError};
pub use worker::WorkerError;

/// Coarse classification of a failed operation, used by callers to decide
/// whether retrying later can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network or server trouble. A later attempt may succeed.
    Transient,
    /// Missing or mismatched checksum, insecure URL or oversize artifact.
    Integrity,
    /// The metadata document could not be understood.
    MalformedInput,
    /// Filesystem or platform failure on this machine.
    Local,
    /// The component was shut down before the work could run.
    ShutDown,
}

impl FailureKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}
