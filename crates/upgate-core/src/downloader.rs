//! Checksum-gated artifact download with atomic commit.
//!
//! An artifact moves through three states: absent, staging (`<name>.tmp`,
//! unverified) and committed (`<name>`, verified). The only promotion is a
//! single rename from staging to committed after the digest matches, so the
//! committed path never holds a partial or unverified file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::FailureKind;
use crate::integrity::{is_secure_transport, sanitize_name, verify_digest};
use crate::release::UpdateInfo;
use crate::transport::{HttpTransport, TransportError};
use crate::worker::{Worker, WorkerError};

pub const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 500 * 1024 * 1024;
pub const STAGING_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadProgress {
    Downloading {
        percent: u8,
        downloaded: u64,
        total: u64,
    },
    Verifying,
}

/// A verified artifact at its committed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub version: String,
    pub sha256: String,
    pub size: u64,
}

/// Outcome of clearing the download directory. Files that could not be
/// deleted are listed rather than counted as removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: Vec<PathBuf>,
}

impl CleanupReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("refusing insecure download URL {0}")]
    InsecureUrl(String),
    #[error("cannot derive a safe file name from version `{0}`")]
    InvalidName(String),
    #[error("update artifact is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("download failed: {0}")]
    Transfer(#[source] TransportError),
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("release {version} has no checksum; refusing to keep unverified download")]
    ChecksumMissing { version: String },
    #[error("checksum mismatch for release {version} (expected {expected}); download discarded")]
    ChecksumMismatch { version: String, expected: String },
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl DownloadError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transfer(_) => FailureKind::Transient,
            Self::InsecureUrl(_)
            | Self::TooLarge { .. }
            | Self::ChecksumMissing { .. }
            | Self::ChecksumMismatch { .. } => FailureKind::Integrity,
            Self::InvalidName(_) => FailureKind::MalformedInput,
            Self::Io { .. } => FailureKind::Local,
            Self::Worker(_) => FailureKind::ShutDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    Staging,
    Committed,
}

/// Staging and committed locations for one version inside the download
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSlot {
    staging: PathBuf,
    committed: PathBuf,
}

impl ArtifactSlot {
    /// # Errors
    /// Returns [`DownloadError::InvalidName`] when the sanitized name is not a
    /// single plain path component.
    pub fn for_version(dir: &Path, prefix: &str, version: &str) -> Result<Self, DownloadError> {
        let name = sanitize_name(&format!("{prefix}-{version}"));
        let mut components = Path::new(&name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(_)), None)
        ) {
            return Err(DownloadError::InvalidName(version.to_string()));
        }

        Ok(Self {
            staging: dir.join(format!("{name}{STAGING_SUFFIX}")),
            committed: dir.join(name),
        })
    }

    #[must_use]
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    #[must_use]
    pub fn committed_path(&self) -> &Path {
        &self.committed
    }

    #[must_use]
    pub fn state(&self) -> ArtifactState {
        if self.committed.is_file() {
            ArtifactState::Committed
        } else if self.staging.is_file() {
            ArtifactState::Staging
        } else {
            ArtifactState::Absent
        }
    }

    fn reset(&self) -> Result<(), DownloadError> {
        for path in [&self.staging, &self.committed] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed previous artifact {}", path.display()),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    return Err(DownloadError::io("failed to remove previous", path, error));
                }
            }
        }
        Ok(())
    }

    fn discard_staging(&self) {
        match std::fs::remove_file(&self.staging) {
            Ok(()) => debug!("Discarded staging file {}", self.staging.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(
                "Failed to discard staging file {}: {error}",
                self.staging.display()
            ),
        }
    }

    fn promote(&self) -> std::io::Result<()> {
        std::fs::rename(&self.staging, &self.committed)
    }
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub download_dir: PathBuf,
    pub artifact_prefix: String,
    pub max_artifact_size: u64,
}

impl DownloaderConfig {
    #[must_use]
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            artifact_prefix: "upgate-update".to_string(),
            max_artifact_size: DEFAULT_MAX_ARTIFACT_SIZE,
        }
    }

    /// # Errors
    /// Returns an error when `version` cannot be turned into a safe file name.
    pub fn slot_for(&self, version: &str) -> Result<ArtifactSlot, DownloadError> {
        ArtifactSlot::for_version(&self.download_dir, &self.artifact_prefix, version)
    }
}

/// Streams artifacts into the download directory. Downloads and cleanups run
/// on a dedicated worker, one at a time.
pub struct UpdateDownloader {
    transport: Arc<dyn HttpTransport>,
    config: Arc<DownloaderConfig>,
    worker: Worker,
}

impl UpdateDownloader {
    /// # Errors
    /// Returns an error when called outside a Tokio runtime.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: DownloaderConfig,
    ) -> Result<Self, WorkerError> {
        Ok(Self {
            transport,
            config: Arc::new(config),
            worker: Worker::spawn("update-downloader")?,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Download, verify and commit the artifact described by `info`.
    ///
    /// Progress events are sent to `progress` in order; a dropped receiver
    /// does not interrupt the download.
    ///
    /// # Errors
    /// Returns an error when the URL is insecure, the artifact is too large,
    /// the transfer or a filesystem step fails, the checksum does not match,
    /// or the downloader has shut down. No committed file exists afterwards.
    pub async fn download(
        &self,
        info: UpdateInfo,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<Artifact, DownloadError> {
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);
        self.worker
            .run(async move { fetch(transport.as_ref(), &config, &info, progress.as_ref()).await })
            .await?
    }

    /// Delete every file in the download directory. Runs behind any queued
    /// download. Files that survive deletion are reported in
    /// [`CleanupReport::failed`].
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be listed, or the
    /// downloader has shut down.
    pub async fn cleanup(&self) -> Result<CleanupReport, DownloadError> {
        let dir = self.config.download_dir.clone();
        self.worker.run(async move { remove_all_files(&dir) }).await?
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    pub async fn drained(&self) {
        self.worker.drained().await;
    }
}

async fn fetch(
    transport: &dyn HttpTransport,
    config: &DownloaderConfig,
    info: &UpdateInfo,
    progress: Option<&mpsc::Sender<DownloadProgress>>,
) -> Result<Artifact, DownloadError> {
    let url = info.download_url();
    if !is_secure_transport(url) {
        warn!("Download URL is not https, refusing: {url}");
        return Err(DownloadError::InsecureUrl(url.to_string()));
    }

    let slot = config.slot_for(info.version())?;
    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            DownloadError::io("failed to create download directory", &config.download_dir, error)
        })?;
    slot.reset()?;

    info!("Downloading update {} from {url}", info.version());
    let stream = transport
        .open_stream(url)
        .await
        .map_err(DownloadError::Transfer)?;

    if let Some(length) = stream.content_length
        && length > config.max_artifact_size
    {
        warn!("Update artifact too large: {length} bytes");
        return Err(DownloadError::TooLarge {
            size: length,
            limit: config.max_artifact_size,
        });
    }

    let total = stream
        .content_length
        .filter(|length| *length > 0)
        .unwrap_or(info.file_size());

    let size = match write_staging(&slot, stream, total, config.max_artifact_size, progress).await
    {
        Ok(size) => size,
        Err(error) => {
            slot.discard_staging();
            return Err(error);
        }
    };

    let expected = info.sha256_checksum().to_string();
    if expected.is_empty() {
        warn!("No checksum for {}; discarding download", info.version());
        slot.discard_staging();
        return Err(DownloadError::ChecksumMissing {
            version: info.version().to_string(),
        });
    }

    if let Some(progress) = progress {
        let _ = progress.send(DownloadProgress::Verifying).await;
    }
    debug!("Verifying checksum of {}", slot.staging_path().display());
    let staging = slot.staging_path().to_path_buf();
    let verify_expected = expected.clone();
    let verified = tokio::task::spawn_blocking(move || verify_digest(&staging, &verify_expected))
        .await
        .map_err(|error| {
            DownloadError::io(
                "checksum task failed for",
                slot.staging_path(),
                std::io::Error::other(error),
            )
        });
    match verified {
        Ok(true) => {}
        Ok(false) => {
            warn!("Checksum verification failed for {}", info.version());
            slot.discard_staging();
            return Err(DownloadError::ChecksumMismatch {
                version: info.version().to_string(),
                expected,
            });
        }
        Err(error) => {
            slot.discard_staging();
            return Err(error);
        }
    }

    if let Err(error) = slot.promote() {
        slot.discard_staging();
        return Err(DownloadError::io(
            "failed to commit",
            slot.committed_path(),
            error,
        ));
    }

    info!(
        "Update {} verified and committed: {}",
        info.version(),
        slot.committed_path().display()
    );
    Ok(Artifact {
        path: slot.committed_path().to_path_buf(),
        version: info.version().to_string(),
        sha256: expected,
        size,
    })
}

async fn write_staging(
    slot: &ArtifactSlot,
    mut stream: crate::transport::ByteStream,
    total: u64,
    limit: u64,
    progress: Option<&mpsc::Sender<DownloadProgress>>,
) -> Result<u64, DownloadError> {
    let path = slot.staging_path();
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|error| DownloadError::io("failed to create staging file", path, error))?;

    let mut downloaded: u64 = 0;
    let mut reported: Option<u8> = None;

    while let Some(chunk) = stream.chunks.next().await {
        let chunk = chunk.map_err(DownloadError::Transfer)?;
        downloaded += chunk.len() as u64;
        if downloaded > limit {
            warn!("Update artifact exceeded {limit} bytes while streaming");
            return Err(DownloadError::TooLarge {
                size: downloaded,
                limit,
            });
        }

        file.write_all(&chunk)
            .await
            .map_err(|error| DownloadError::io("failed to write staging file", path, error))?;

        if let (Some(progress), Some(percent)) = (progress, percent_of(downloaded, total))
            && reported.is_none_or(|last| percent > last)
        {
            reported = Some(percent);
            let _ = progress
                .send(DownloadProgress::Downloading {
                    percent,
                    downloaded,
                    total,
                })
                .await;
        }
    }

    file.flush()
        .await
        .map_err(|error| DownloadError::io("failed to flush staging file", path, error))?;
    file.sync_all()
        .await
        .map_err(|error| DownloadError::io("failed to sync staging file", path, error))?;
    drop(file);

    debug!("Staged {downloaded} bytes at {}", path.display());
    Ok(downloaded)
}

fn percent_of(downloaded: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (u128::from(downloaded) * 100 / u128::from(total)).min(100);
    u8::try_from(percent).ok()
}

fn remove_all_files(dir: &Path) -> Result<CleanupReport, DownloadError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CleanupReport::default());
        }
        Err(error) => return Err(DownloadError::io("failed to list", dir, error)),
    };

    let files = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file());
    Ok(remove_files(files))
}

fn remove_files(paths: impl IntoIterator<Item = PathBuf>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted old update file: {}", path.display());
                report.removed += 1;
            }
            // Already gone, e.g. raced with another cleanup.
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!("Failed to delete {}: {error}", path.display());
                report.failed.push(path);
            }
        }
    }
    report
}
