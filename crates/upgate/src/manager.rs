//! The single entry point hosts use: throttled checks, downloads, policy
//! state and installer handoff.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use upgate_core::downloader::STAGING_SUFFIX;
use upgate_core::{
    Artifact, CheckOutcome, CleanupReport, DownloadProgress, DownloaderConfig, HttpTransport,
    ReqwestTransport, UpdateChecker, UpdateDownloader, UpdateInfo,
};
use upgate_platform::{AppPaths, create_private_dir};

use crate::clock::{Clock, SystemClock};
use crate::error::ManagerError;
use crate::installer::{InstallRequest, Installer, SystemInstaller};
use crate::policy::{JsonFileStore, PolicyState, PolicyStore};
use crate::settings::UpdaterSettings;

/// Minimum spacing between automatic checks.
pub const CHECK_INTERVAL_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Collaborators the manager talks to. [`UpdateManager::from_paths`] wires the
/// real ones; hosts and tests may substitute their own.
pub struct ManagerParts {
    pub transport: Arc<dyn HttpTransport>,
    pub store: Arc<dyn PolicyStore>,
    pub clock: Arc<dyn Clock>,
    pub installer: Arc<dyn Installer>,
}

pub struct UpdateManager {
    current_version_code: u32,
    default_check_url: String,
    media_type: String,
    download_dir: PathBuf,
    policy: Mutex<PolicyState>,
    store: Arc<dyn PolicyStore>,
    clock: Arc<dyn Clock>,
    installer: Arc<dyn Installer>,
    checker: UpdateChecker,
    downloader: UpdateDownloader,
}

impl UpdateManager {
    /// Build a manager with the platform's directories, an HTTPS client
    /// configured from `settings`, the JSON policy file and the system
    /// installer.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built, the download
    /// directory cannot be prepared, the policy cannot be read, or no Tokio
    /// runtime is running.
    pub fn from_paths(
        paths: &AppPaths,
        settings: &UpdaterSettings,
        current_version_code: u32,
    ) -> Result<Self, ManagerError> {
        let transport =
            ReqwestTransport::new(settings.connect_timeout(), settings.read_timeout())?;
        Self::new(
            current_version_code,
            settings,
            paths.download_dir(),
            ManagerParts {
                transport: Arc::new(transport),
                store: Arc::new(JsonFileStore::new(paths.policy_file())),
                clock: Arc::new(SystemClock),
                installer: Arc::new(SystemInstaller),
            },
        )
    }

    /// # Errors
    /// Returns an error if the download directory cannot be prepared, the
    /// policy cannot be read, or no Tokio runtime is running.
    pub fn new(
        current_version_code: u32,
        settings: &UpdaterSettings,
        download_dir: PathBuf,
        parts: ManagerParts,
    ) -> Result<Self, ManagerError> {
        create_private_dir(&download_dir).map_err(|source| ManagerError::DownloadDir {
            path: download_dir.clone(),
            source,
        })?;
        let policy = parts.store.load()?;

        let downloader = UpdateDownloader::new(
            Arc::clone(&parts.transport),
            DownloaderConfig {
                download_dir: download_dir.clone(),
                artifact_prefix: settings.artifact_prefix.clone(),
                max_artifact_size: settings.max_artifact_size_bytes,
            },
        )?;
        let checker = UpdateChecker::new(parts.transport)?;

        debug!(
            "Update manager ready (version code {current_version_code}, downloads in {})",
            download_dir.display()
        );
        Ok(Self {
            current_version_code,
            default_check_url: settings.default_check_url.clone(),
            media_type: settings.artifact_media_type.clone(),
            download_dir,
            policy: Mutex::new(policy),
            store: parts.store,
            clock: parts.clock,
            installer: parts.installer,
            checker,
            downloader,
        })
    }

    fn policy_guard(&self) -> MutexGuard<'_, PolicyState> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` in memory, then persist. A failed save keeps the change
    /// for this session.
    fn update_policy(&self, change: impl FnOnce(&mut PolicyState)) -> Result<(), ManagerError> {
        let mut policy = self.policy_guard();
        change(&mut policy);
        self.store.save(&policy)?;
        Ok(())
    }

    #[must_use]
    pub fn current_version_code(&self) -> u32 {
        self.current_version_code
    }

    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    #[must_use]
    pub fn policy(&self) -> PolicyState {
        self.policy_guard().clone()
    }

    /// Whether at least [`CHECK_INTERVAL_MILLIS`] passed since the last
    /// recorded check.
    #[must_use]
    pub fn should_check_now(&self) -> bool {
        let last = self.policy_guard().last_check_millis;
        self.clock.now_millis().saturating_sub(last) >= CHECK_INTERVAL_MILLIS
    }

    /// Run a check only if auto-check is enabled and one is due. Returns
    /// `Ok(None)` when skipped.
    ///
    /// # Errors
    /// Propagates errors from [`UpdateManager::check_now`].
    pub async fn check_if_due(&self) -> Result<Option<CheckOutcome>, ManagerError> {
        if !self.is_auto_check_enabled() {
            debug!("Automatic update checks are disabled");
            return Ok(None);
        }
        if !self.should_check_now() {
            debug!("Skipping update check, last check was less than 24h ago");
            return Ok(None);
        }
        self.check_now().await.map(Some)
    }

    /// Check the effective endpoint now, ignoring the throttle. The attempt is
    /// recorded before the request so a failing endpoint is not retried until
    /// the next interval.
    ///
    /// # Errors
    /// Returns the checker's error, classified by [`ManagerError::kind`].
    pub async fn check_now(&self) -> Result<CheckOutcome, ManagerError> {
        let now = self.clock.now_millis();
        if let Err(error) = self.update_policy(|policy| policy.last_check_millis = now) {
            warn!("Failed to persist last update check time: {error}");
        }

        let url = self.effective_check_url();
        info!("Checking for updates at {url}");
        Ok(self.checker.check(&url, self.current_version_code).await?)
    }

    /// # Errors
    /// Returns the downloader's error; no committed artifact exists afterwards.
    pub async fn download(
        &self,
        info: UpdateInfo,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> Result<Artifact, ManagerError> {
        Ok(self.downloader.download(info, progress).await?)
    }

    /// Remember that the user declined `version_code`.
    ///
    /// # Errors
    /// Returns an error if the policy cannot be persisted.
    pub fn dismiss(&self, version_code: u32) -> Result<(), ManagerError> {
        info!("Dismissing update with version code {version_code}");
        self.update_policy(|policy| policy.dismissed_version_code = Some(version_code))
    }

    #[must_use]
    pub fn is_dismissed(&self, version_code: u32) -> bool {
        self.policy_guard().dismissed_version_code == Some(version_code)
    }

    /// # Errors
    /// Returns an error if the policy cannot be persisted.
    pub fn clear_dismissal(&self) -> Result<(), ManagerError> {
        self.update_policy(|policy| policy.dismissed_version_code = None)
    }

    /// # Errors
    /// Returns an error if the policy cannot be persisted.
    pub fn set_auto_check_enabled(&self, enabled: bool) -> Result<(), ManagerError> {
        info!("Automatic update checks {}", if enabled { "enabled" } else { "disabled" });
        self.update_policy(|policy| policy.auto_check_enabled = enabled)
    }

    #[must_use]
    pub fn is_auto_check_enabled(&self) -> bool {
        self.policy_guard().auto_check_enabled
    }

    /// Override the metadata endpoint. `None` or a blank string restores the
    /// default.
    ///
    /// # Errors
    /// Returns an error if the policy cannot be persisted.
    pub fn set_custom_check_url(&self, url: Option<&str>) -> Result<(), ManagerError> {
        let url = url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        match &url {
            Some(url) if !upgate_core::is_secure_transport(url) => {
                warn!("Custom update URL is not https and will be refused at check time: {url}");
            }
            Some(url) => info!("Using custom update URL {url}"),
            None => info!("Using default update URL"),
        }
        self.update_policy(|policy| policy.custom_check_url = url)
    }

    #[must_use]
    pub fn effective_check_url(&self) -> String {
        self.policy_guard()
            .custom_check_url
            .clone()
            .unwrap_or_else(|| self.default_check_url.clone())
    }

    /// Delete every file in the download directory. Queued behind any
    /// download in progress. Files that could not be deleted are listed in
    /// the report.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be listed or the downloader
    /// has shut down.
    pub async fn cleanup_stale_artifacts(&self) -> Result<CleanupReport, ManagerError> {
        let report = self.downloader.cleanup().await?;
        info!("Removed {} stale update file(s)", report.removed);
        if !report.is_complete() {
            warn!("{} stale update file(s) could not be deleted", report.failed.len());
        }
        Ok(report)
    }

    /// Hand a committed artifact to the installer. Returns whether the handoff
    /// was dispatched; staging files and paths outside the download directory
    /// are refused.
    pub fn request_install(&self, artifact: &Path) -> bool {
        let Some(artifact) = self.committed_artifact(artifact) else {
            return false;
        };

        let request = InstallRequest {
            artifact,
            media_type: self.media_type.clone(),
        };
        match self.installer.install(&request) {
            Ok(()) => {
                info!("Install handed off for {}", request.artifact.display());
                true
            }
            Err(error) => {
                warn!("Install handoff failed: {error}");
                false
            }
        }
    }

    fn committed_artifact(&self, artifact: &Path) -> Option<PathBuf> {
        if artifact
            .file_name()
            .and_then(std::ffi::OsStr::to_str)
            .is_some_and(|name| name.ends_with(STAGING_SUFFIX))
        {
            warn!("Refusing to install unverified staging file {}", artifact.display());
            return None;
        }

        let (Ok(artifact), Ok(dir)) = (artifact.canonicalize(), self.download_dir.canonicalize())
        else {
            warn!("Refusing to install missing file {}", artifact.display());
            return None;
        };
        if artifact.parent() != Some(dir.as_path()) || !artifact.is_file() {
            warn!(
                "Refusing to install {}: not a file in {}",
                artifact.display(),
                dir.display()
            );
            return None;
        }
        Some(artifact)
    }

    /// Stop both workers from accepting new work. In-flight jobs finish.
    pub fn shutdown(&self) {
        info!("Shutting down update manager");
        self.checker.shutdown();
        self.downloader.shutdown();
    }

    /// Wait for both workers to exit after [`UpdateManager::shutdown`].
    pub async fn drained(&self) {
        self.checker.drained().await;
        self.downloader.drained().await;
    }
}
