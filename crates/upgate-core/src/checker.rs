use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::FailureKind;
use crate::integrity::{is_secure_transport, is_sha256_hex, parse_checksum_file};
use crate::release::{HostedRelease, ReleaseDocument, ReleaseError, UpdateInfo};
use crate::transport::{HttpTransport, TransportError};
use crate::worker::{Worker, WorkerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NoUpdate,
    UpdateAvailable(UpdateInfo),
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("refusing insecure update endpoint {0}")]
    InsecureEndpoint(String),
    #[error("failed to fetch release metadata: {0}")]
    Fetch(#[source] TransportError),
    #[error("failed to parse release metadata: {0}")]
    Parse(#[source] ReleaseError),
    #[error("no verifiable checksum for release {version}: {reason}")]
    ChecksumMissing { version: String, reason: String },
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl CheckError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Fetch(_) => FailureKind::Transient,
            Self::InsecureEndpoint(_) | Self::ChecksumMissing { .. } => FailureKind::Integrity,
            Self::Parse(
                ReleaseError::ChecksumMissing { .. }
                | ReleaseError::ChecksumMalformed { .. }
                | ReleaseError::InsecureDownloadUrl { .. },
            ) => FailureKind::Integrity,
            Self::Parse(_) => FailureKind::MalformedInput,
            Self::Worker(_) => FailureKind::ShutDown,
        }
    }
}

/// Resolves release metadata into a [`CheckOutcome`]. Checks run on a
/// dedicated worker, so at most one request is in flight per checker.
pub struct UpdateChecker {
    transport: Arc<dyn HttpTransport>,
    worker: Worker,
}

impl UpdateChecker {
    /// # Errors
    /// Returns an error when called outside a Tokio runtime.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Result<Self, WorkerError> {
        Ok(Self {
            transport,
            worker: Worker::spawn("update-checker")?,
        })
    }

    /// Fetch metadata from `endpoint` and compare it with the running build.
    ///
    /// # Errors
    /// Returns an error when the endpoint is not https, the request or parse
    /// fails, no checksum can be resolved, or the checker has shut down.
    pub async fn check(
        &self,
        endpoint: &str,
        current_version_code: u32,
    ) -> Result<CheckOutcome, CheckError> {
        let transport = Arc::clone(&self.transport);
        let endpoint = endpoint.to_string();
        self.worker
            .run(async move { resolve(transport.as_ref(), &endpoint, current_version_code).await })
            .await?
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    pub async fn drained(&self) {
        self.worker.drained().await;
    }
}

async fn resolve(
    transport: &dyn HttpTransport,
    endpoint: &str,
    current_version_code: u32,
) -> Result<CheckOutcome, CheckError> {
    if !is_secure_transport(endpoint) {
        warn!("Update endpoint is not https, skipping request: {endpoint}");
        return Err(CheckError::InsecureEndpoint(endpoint.to_string()));
    }

    debug!("Fetching release metadata from {endpoint}");
    let body = transport.get_text(endpoint).await.map_err(CheckError::Fetch)?;

    let info = match ReleaseDocument::parse(&body).map_err(CheckError::Parse)? {
        ReleaseDocument::Native(meta) => UpdateInfo::try_from(meta).map_err(CheckError::Parse)?,
        ReleaseDocument::Hosted(release) => resolve_hosted(transport, release).await?,
    };

    if info.version_code() > current_version_code {
        info!(
            "Update available: {} (code {}, current {current_version_code})",
            info.version(),
            info.version_code()
        );
        Ok(CheckOutcome::UpdateAvailable(info))
    } else {
        info!(
            "No update available (remote code {}, current {current_version_code})",
            info.version_code()
        );
        Ok(CheckOutcome::NoUpdate)
    }
}

async fn resolve_hosted(
    transport: &dyn HttpTransport,
    release: HostedRelease,
) -> Result<UpdateInfo, CheckError> {
    let version = release.version().to_string();
    crate::release::version_code_from_version(&version).map_err(CheckError::Parse)?;

    let artifact = release
        .artifact()
        .ok_or_else(|| CheckError::Parse(ReleaseError::NoAssets(version.clone())))?;
    if !is_secure_transport(&artifact.browser_download_url) {
        warn!(
            "Artifact URL is not https, skipping update: {}",
            artifact.browser_download_url
        );
        return Err(CheckError::Parse(ReleaseError::InsecureDownloadUrl {
            version,
            url: artifact.browser_download_url.clone(),
        }));
    }
    let checksum = if let Some(asset) = release.checksum_asset(artifact) {
        let url = &asset.browser_download_url;
        fetch_detached_checksum(transport, &version, &artifact.name, url).await?
    } else if let Some(digest) = artifact.digest.as_deref().and_then(parse_asset_digest) {
        debug!("Using published asset digest for {}", artifact.name);
        digest
    } else {
        warn!("No checksum published for {}, skipping update", artifact.name);
        return Err(CheckError::ChecksumMissing {
            version,
            reason: format!("no {}.sha256 asset", artifact.name),
        });
    };

    release.into_update_info(checksum).map_err(CheckError::Parse)
}

async fn fetch_detached_checksum(
    transport: &dyn HttpTransport,
    version: &str,
    artifact_name: &str,
    checksum_url: &str,
) -> Result<String, CheckError> {
    if !is_secure_transport(checksum_url) {
        warn!("Checksum asset URL is not https: {checksum_url}");
        return Err(CheckError::ChecksumMissing {
            version: version.to_string(),
            reason: "checksum asset is not served over https".to_string(),
        });
    }

    let contents = transport
        .get_text(checksum_url)
        .await
        .map_err(CheckError::Fetch)?;
    parse_checksum_file(&contents, artifact_name).ok_or_else(|| {
        warn!("Checksum asset for {artifact_name} has no usable entry");
        CheckError::ChecksumMissing {
            version: version.to_string(),
            reason: format!("no entry for {artifact_name} in checksum asset"),
        }
    })
}

fn parse_asset_digest(digest: &str) -> Option<String> {
    let (algorithm, hash) = digest.split_once(':')?;
    if !algorithm.eq_ignore_ascii_case("sha256") || !is_sha256_hex(hash) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::transport::ByteStream;

    const CHECKSUM: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
    const ENDPOINT: &str = "https://updates.example.com/latest.json";

    #[derive(Default)]
    struct FakeTransport {
        responses: HashMap<String, Result<String, reqwest::StatusCode>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn with(mut self, url: &str, body: impl Into<String>) -> Self {
            self.responses.insert(url.to_string(), Ok(body.into()));
            self
        }

        fn with_status(mut self, url: &str, status: reqwest::StatusCode) -> Self {
            self.responses.insert(url.to_string(), Err(status));
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn get_text(&self, url: &str) -> Result<String, TransportError> {
            self.requests.lock().expect("requests lock").push(url.to_string());
            match self.responses.get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(status)) => Err(TransportError::Status {
                    url: url.to_string(),
                    status: *status,
                    body_snippet: String::new(),
                }),
                None => Err(TransportError::request(url, "connection refused")),
            }
        }

        async fn open_stream(&self, url: &str) -> Result<ByteStream, TransportError> {
            Err(TransportError::request(url, "not used by checker tests"))
        }
    }

    fn native_body(version_code: u32) -> String {
        serde_json::json!({
            "version": format!("0.{version_code}.0"),
            "versionCode": version_code,
            "downloadUrl": "https://updates.example.com/app.apk",
            "sha256Checksum": CHECKSUM,
        })
        .to_string()
    }

    fn hosted_body(assets: &serde_json::Value) -> String {
        serde_json::json!({
            "tag_name": "v0.119.0",
            "body": "Release notes",
            "published_at": "2024-03-01T12:00:00Z",
            "assets": assets,
        })
        .to_string()
    }

    async fn check_with(
        transport: FakeTransport,
        endpoint: &str,
        current: u32,
    ) -> (Result<CheckOutcome, CheckError>, Vec<String>) {
        let transport = Arc::new(transport);
        let checker = UpdateChecker::new(transport.clone()).expect("checker should start");
        let result = checker.check(endpoint, current).await;
        (result, transport.requests())
    }

    #[tokio::test]
    async fn newer_version_code_is_an_update() {
        let transport = FakeTransport::default().with(ENDPOINT, native_body(119));
        let (result, _) = check_with(transport, ENDPOINT, 118).await;

        let info = match result {
            Ok(CheckOutcome::UpdateAvailable(info)) => info,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(info.version_code(), 119);
        assert_eq!(info.sha256_checksum(), CHECKSUM);
    }

    #[tokio::test]
    async fn equal_or_older_version_code_is_not_an_update() {
        for remote in [118, 100] {
            let transport = FakeTransport::default().with(ENDPOINT, native_body(remote));
            let (result, _) = check_with(transport, ENDPOINT, 118).await;
            assert!(
                matches!(result, Ok(CheckOutcome::NoUpdate)),
                "remote {remote} should not be an update"
            );
        }
    }

    #[tokio::test]
    async fn insecure_endpoint_is_rejected_without_a_request() {
        let endpoint = "http://updates.example.com/latest.json";
        let transport = FakeTransport::default().with(endpoint, native_body(200));
        let (result, requests) = check_with(transport, endpoint, 118).await;

        assert!(matches!(result, Err(CheckError::InsecureEndpoint(_))));
        assert!(requests.is_empty());
        assert_eq!(result.expect_err("insecure").kind(), FailureKind::Integrity);
    }

    #[tokio::test]
    async fn http_status_errors_are_transient() {
        let transport =
            FakeTransport::default().with_status(ENDPOINT, reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let (result, _) = check_with(transport, ENDPOINT, 118).await;

        let error = result.expect_err("status should fail the check");
        assert_eq!(error.kind(), FailureKind::Transient);
        assert!(matches!(
            &error,
            CheckError::Fetch(inner) if inner.status() == Some(reqwest::StatusCode::SERVICE_UNAVAILABLE)
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let transport = FakeTransport::default().with(ENDPOINT, "{not json");
        let (result, _) = check_with(transport, ENDPOINT, 118).await;

        let error = result.expect_err("garbage should fail the check");
        assert_eq!(error.kind(), FailureKind::MalformedInput);
    }

    #[tokio::test]
    async fn missing_checksum_never_reports_an_update() {
        let body = serde_json::json!({
            "version": "0.500.0",
            "versionCode": 500,
            "downloadUrl": "https://updates.example.com/app.apk",
        })
        .to_string();
        let transport = FakeTransport::default().with(ENDPOINT, body);
        let (result, _) = check_with(transport, ENDPOINT, 118).await;

        let error = result.expect_err("missing checksum should fail the check");
        assert_eq!(error.kind(), FailureKind::Integrity);
    }

    #[tokio::test]
    async fn native_release_with_plain_http_download_is_refused() {
        let body = serde_json::json!({
            "version": "0.119.0",
            "versionCode": 119,
            "downloadUrl": "http://mirror.example.com/app.apk",
            "sha256Checksum": CHECKSUM,
        })
        .to_string();
        let transport = FakeTransport::default().with(ENDPOINT, body);
        let (result, _) = check_with(transport, ENDPOINT, 118).await;

        let error = result.expect_err("plain http artifact should fail the check");
        assert!(matches!(
            error,
            CheckError::Parse(ReleaseError::InsecureDownloadUrl { .. })
        ));
        assert_eq!(error.kind(), FailureKind::Integrity);
    }

    #[tokio::test]
    async fn hosted_release_with_plain_http_asset_is_refused() {
        let assets = serde_json::json!([
            {
                "name": "app.apk",
                "browser_download_url": "http://mirror.example.com/app.apk",
                "size": 2048,
                "digest": format!("sha256:{CHECKSUM}"),
            },
            { "name": "app.apk.sha256", "browser_download_url": "https://updates.example.com/app.apk.sha256", "size": 80 },
        ]);
        let transport = FakeTransport::default().with(ENDPOINT, hosted_body(&assets));
        let (result, requests) = check_with(transport, ENDPOINT, 118).await;

        let error = result.expect_err("plain http artifact should fail the check");
        assert!(matches!(
            error,
            CheckError::Parse(ReleaseError::InsecureDownloadUrl { .. })
        ));
        assert_eq!(error.kind(), FailureKind::Integrity);
        assert_eq!(requests, vec![ENDPOINT.to_string()]);
    }

    #[tokio::test]
    async fn hosted_release_fetches_detached_checksum() {
        let assets = serde_json::json!([
            { "name": "app.apk", "browser_download_url": "https://updates.example.com/app.apk", "size": 2048 },
            { "name": "app.apk.sha256", "browser_download_url": "https://updates.example.com/app.apk.sha256", "size": 80 },
        ]);
        let transport = FakeTransport::default()
            .with(ENDPOINT, hosted_body(&assets))
            .with(
                "https://updates.example.com/app.apk.sha256",
                format!("{}  app.apk\n", CHECKSUM.to_ascii_uppercase()),
            );
        let (result, requests) = check_with(transport, ENDPOINT, 118).await;

        let info = match result {
            Ok(CheckOutcome::UpdateAvailable(info)) => info,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(info.version(), "0.119.0");
        assert_eq!(info.version_code(), 119);
        assert_eq!(info.file_size(), 2048);
        assert_eq!(info.sha256_checksum(), CHECKSUM);
        assert_eq!(info.release_notes(), "Release notes");
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn hosted_release_without_checksum_asset_is_refused() {
        let assets = serde_json::json!([
            { "name": "app.apk", "browser_download_url": "https://updates.example.com/app.apk", "size": 2048 },
            { "name": "notes.txt", "browser_download_url": "https://updates.example.com/notes.txt", "size": 10 },
        ]);
        let transport = FakeTransport::default().with(ENDPOINT, hosted_body(&assets));
        let (result, _) = check_with(transport, ENDPOINT, 1).await;

        assert!(matches!(result, Err(CheckError::ChecksumMissing { .. })));
    }

    #[tokio::test]
    async fn hosted_release_with_unrelated_checksum_entry_is_refused() {
        let assets = serde_json::json!([
            { "name": "app.apk", "browser_download_url": "https://updates.example.com/app.apk", "size": 2048 },
            { "name": "app.apk.sha256", "browser_download_url": "https://updates.example.com/app.apk.sha256", "size": 80 },
        ]);
        let transport = FakeTransport::default()
            .with(ENDPOINT, hosted_body(&assets))
            .with(
                "https://updates.example.com/app.apk.sha256",
                format!("{CHECKSUM}  other.apk\n{CHECKSUM}  more.apk\n"),
            );
        let (result, _) = check_with(transport, ENDPOINT, 1).await;

        assert!(matches!(result, Err(CheckError::ChecksumMissing { .. })));
    }

    #[tokio::test]
    async fn hosted_release_falls_back_to_asset_digest() {
        let assets = serde_json::json!([
            {
                "name": "app.apk",
                "browser_download_url": "https://updates.example.com/app.apk",
                "size": 2048,
                "digest": format!("sha256:{CHECKSUM}"),
            },
        ]);
        let transport = FakeTransport::default().with(ENDPOINT, hosted_body(&assets));
        let (result, requests) = check_with(transport, ENDPOINT, 118).await;

        assert!(matches!(result, Ok(CheckOutcome::UpdateAvailable(_))));
        assert_eq!(requests, vec![ENDPOINT.to_string()]);
    }

    #[tokio::test]
    async fn hosted_release_with_unparsable_version_is_malformed() {
        let body = serde_json::json!({
            "tag_name": "nightly",
            "assets": [],
        })
        .to_string();
        let transport = FakeTransport::default().with(ENDPOINT, body);
        let (result, _) = check_with(transport, ENDPOINT, 1).await;

        assert!(matches!(
            result,
            Err(CheckError::Parse(ReleaseError::VersionCode(_)))
        ));
    }

    #[tokio::test]
    async fn shut_down_checker_rejects_checks() {
        let transport = Arc::new(FakeTransport::default().with(ENDPOINT, native_body(119)));
        let checker = UpdateChecker::new(transport.clone()).expect("checker should start");
        checker.shutdown();

        let result = checker.check(ENDPOINT, 118).await;
        assert!(matches!(result, Err(CheckError::Worker(WorkerError::ShutDown(_)))));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn asset_digest_requires_sha256_prefix_and_hex() {
        assert_eq!(
            parse_asset_digest(&format!("SHA256:{CHECKSUM}")).as_deref(),
            Some(CHECKSUM)
        );
        assert!(parse_asset_digest("sha1:abc").is_none());
        assert!(parse_asset_digest("sha256:not-hex").is_none());
        assert!(parse_asset_digest(CHECKSUM).is_none());
    }
}
