use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::integrity::{is_secure_transport, is_sha256_hex};

/// Suffix of the detached checksum asset published next to an artifact.
pub const CHECKSUM_ASSET_SUFFIX: &str = ".sha256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("release metadata is not valid JSON: {0}")]
    Json(String),
    #[error("release metadata is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("release {version} has no sha256 checksum; refusing unverifiable update")]
    ChecksumMissing { version: String },
    #[error("release {version} has a malformed sha256 checksum")]
    ChecksumMalformed { version: String },
    #[error("release {version} download URL is not https: {url}")]
    InsecureDownloadUrl { version: String, url: String },
    #[error("cannot derive a version code from `{0}`")]
    VersionCode(String),
    #[error("release {0} lists no downloadable assets")]
    NoAssets(String),
}

/// A release that passed the checksum gate. The only ways to obtain one are
/// [`UpdateInfo::try_from`] on [`ReleaseMetadata`] and deserialization, which
/// goes through the same validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ReleaseMetadata", into = "ReleaseMetadata")]
pub struct UpdateInfo {
    version: String,
    version_code: u32,
    download_url: String,
    release_notes: String,
    file_size: u64,
    sha256_checksum: String,
    signature_url: Option<String>,
    release_date: i64,
}

impl UpdateInfo {
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn version_code(&self) -> u32 {
        self.version_code
    }

    #[must_use]
    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    #[must_use]
    pub fn release_notes(&self) -> &str {
        &self.release_notes
    }

    /// Advisory size in bytes; 0 when the server did not say.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn sha256_checksum(&self) -> &str {
        &self.sha256_checksum
    }

    #[must_use]
    pub fn signature_url(&self) -> Option<&str> {
        self.signature_url.as_deref()
    }

    /// Release timestamp in epoch milliseconds.
    #[must_use]
    pub fn release_date(&self) -> i64 {
        self.release_date
    }
}

/// Native release-metadata document, as served by a dedicated update endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    pub version: String,
    pub version_code: u32,
    pub download_url: String,
    pub sha256_checksum: String,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<i64>,
}

impl TryFrom<ReleaseMetadata> for UpdateInfo {
    type Error = ReleaseError;

    fn try_from(meta: ReleaseMetadata) -> Result<Self, Self::Error> {
        let checksum = meta.sha256_checksum.trim();
        if checksum.is_empty() {
            return Err(ReleaseError::ChecksumMissing {
                version: meta.version,
            });
        }
        if !is_sha256_hex(checksum) {
            return Err(ReleaseError::ChecksumMalformed {
                version: meta.version,
            });
        }
        if meta.version.trim().is_empty() {
            return Err(ReleaseError::MissingField("version"));
        }
        if meta.download_url.trim().is_empty() {
            return Err(ReleaseError::MissingField("downloadUrl"));
        }
        if !is_secure_transport(&meta.download_url) {
            return Err(ReleaseError::InsecureDownloadUrl {
                version: meta.version,
                url: meta.download_url,
            });
        }

        Ok(Self {
            sha256_checksum: checksum.to_ascii_lowercase(),
            version: meta.version,
            version_code: meta.version_code,
            download_url: meta.download_url,
            release_notes: meta.release_notes,
            file_size: meta.file_size,
            signature_url: meta.signature_url.filter(|url| !url.is_empty()),
            release_date: meta
                .release_date
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        })
    }
}

impl From<UpdateInfo> for ReleaseMetadata {
    fn from(info: UpdateInfo) -> Self {
        Self {
            version: info.version,
            version_code: info.version_code,
            download_url: info.download_url,
            sha256_checksum: info.sha256_checksum,
            release_notes: info.release_notes,
            file_size: info.file_size,
            signature_url: info.signature_url,
            release_date: Some(info.release_date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostedAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: Option<String>,
}

/// Release entry in the shape returned by GitHub's releases API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostedRelease {
    pub tag_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<HostedAsset>,
}

impl HostedRelease {
    /// Version string with an optional leading `v` removed.
    #[must_use]
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }

    /// The first asset is the artifact candidate.
    #[must_use]
    pub fn artifact(&self) -> Option<&HostedAsset> {
        self.assets.first()
    }

    /// The `<artifact>.sha256` asset, if published.
    #[must_use]
    pub fn checksum_asset(&self, artifact: &HostedAsset) -> Option<&HostedAsset> {
        let wanted = format!("{}{CHECKSUM_ASSET_SUFFIX}", artifact.name);
        self.assets.iter().skip(1).find(|asset| asset.name == wanted)
    }

    /// `published_at` as epoch milliseconds when it parses as RFC 3339.
    #[must_use]
    pub fn published_at_millis(&self) -> Option<i64> {
        let raw = self.published_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|date| date.with_timezone(&Utc).timestamp_millis())
    }

    /// Build the canonical record once a checksum has been resolved.
    ///
    /// # Errors
    /// Returns an error when the release has no assets, the version code
    /// cannot be derived, or the checksum is empty or malformed.
    pub fn into_update_info(self, sha256_checksum: String) -> Result<UpdateInfo, ReleaseError> {
        let version = self.version().to_string();
        let version_code = version_code_from_version(&version)?;
        let release_date = self.published_at_millis();
        let artifact = self
            .assets
            .first()
            .ok_or_else(|| ReleaseError::NoAssets(version.clone()))?;

        UpdateInfo::try_from(ReleaseMetadata {
            version_code,
            download_url: artifact.browser_download_url.clone(),
            file_size: artifact.size,
            sha256_checksum,
            release_notes: self.body.unwrap_or_default(),
            signature_url: None,
            release_date,
            version,
        })
    }
}

/// The two accepted metadata shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseDocument {
    Native(ReleaseMetadata),
    Hosted(HostedRelease),
}

impl ReleaseDocument {
    /// Parse a metadata response body. Objects carrying `tag_name` are read as
    /// hosted releases, everything else as the native shape.
    ///
    /// # Errors
    /// Returns an error when the body is not a JSON object of either shape.
    pub fn parse(body: &str) -> Result<Self, ReleaseError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|error| ReleaseError::Json(error.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(ReleaseError::Json("expected a JSON object".to_string()));
        };

        if object.contains_key("tag_name") {
            serde_json::from_value(value)
                .map(Self::Hosted)
                .map_err(|error| ReleaseError::Json(error.to_string()))
        } else {
            for field in ["version", "versionCode", "downloadUrl"] {
                if !object.contains_key(field) {
                    return Err(ReleaseError::MissingField(field));
                }
            }
            if object
                .get("sha256Checksum")
                .is_none_or(serde_json::Value::is_null)
            {
                let version = object
                    .get("version")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Err(ReleaseError::ChecksumMissing { version });
            }
            serde_json::from_value(value)
                .map(Self::Native)
                .map_err(|error| ReleaseError::Json(error.to_string()))
        }
    }
}

/// Derive the ordering key from a dotted version string by taking its second
/// segment, so `0.119.0` becomes 119.
///
/// This mirrors how published tags have always been numbered; `1.2.3` yields 2
/// and ignores the other segments.
///
/// # Errors
/// Returns an error when the version has fewer than two segments or the
/// second one is not an unsigned integer.
pub fn version_code_from_version(version: &str) -> Result<u32, ReleaseError> {
    version
        .split('.')
        .nth(1)
        .and_then(|segment| segment.parse::<u32>().ok())
        .ok_or_else(|| ReleaseError::VersionCode(version.to_string()))
}
