//! Stateless integrity helpers shared by the checker and the downloader.

use std::io::Read;
use std::path::{Path, PathBuf};

use log::warn;
use sha2::{Digest, Sha256};
use thiserror::Error;

const DIGEST_CHUNK_SIZE: usize = 8192;
const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("failed to {action} {} for checksum: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IntegrityError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Compute the lowercase hex SHA-256 digest of a file, reading it in bounded
/// chunks.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn compute_digest(path: &Path) -> Result<String, IntegrityError> {
    let mut file =
        std::fs::File::open(path).map_err(|error| IntegrityError::io("open", path, error))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; DIGEST_CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| IntegrityError::io("read", path, error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether the file's SHA-256 digest equals `expected_hex`, ignoring case.
/// Unreadable files never verify.
#[must_use]
pub fn verify_digest(path: &Path, expected_hex: &str) -> bool {
    match compute_digest(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected_hex.trim()),
        Err(error) => {
            warn!("Checksum verification could not read file: {error}");
            false
        }
    }
}

/// Allow-list check for the encrypted HTTP scheme. Certificate validation is
/// left to the HTTP client.
#[must_use]
pub fn is_secure_transport(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    scheme.eq_ignore_ascii_case("https") && !rest.is_empty()
}

/// Reduce `raw` to a single path component: separators are dropped along with
/// everything before the last non-empty segment, and every `..` is removed.
/// The result can be joined onto a fixed directory without escaping it.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    raw.rsplit(['/', '\\'])
        .map(|segment| segment.replace("..", "").trim().to_string())
        .find(|segment| !segment.is_empty())
        .unwrap_or_default()
}

#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.chars().all(|ch| ch.is_ascii_hexdigit())
}

/// Extract the digest for `artifact_name` from a detached checksum document.
///
/// Accepts `sha256sum` output (`<hex>  <name>`, `<hex> *<name>`) or a document
/// consisting of a single bare digest.
#[must_use]
pub fn parse_checksum_file(contents: &str, artifact_name: &str) -> Option<String> {
    let mut tokens = contents.split_whitespace();
    if let (Some(only), None) = (tokens.next(), tokens.next())
        && is_sha256_hex(only)
    {
        return Some(only.to_ascii_lowercase());
    }

    contents.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts
            .next()?
            .trim_start_matches('*')
            .trim_start_matches("./");
        (name == artifact_name && is_sha256_hex(hash)).then(|| hash.to_ascii_lowercase())
    })
}
