//! HTTP access used by the checker and downloader.
//!
//! The pipeline only talks to the network through [`HttpTransport`], so hosts
//! can route requests through their own client and tests can serve canned
//! responses.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const BODY_SNIPPET_CHARS: usize = 160;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
    #[error("request to {url} failed: {details}")]
    Request { url: String, details: String },
    #[error("{url} responded with HTTP {status}{body_snippet}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body_snippet: String,
    },
    #[error("failed to read response body from {url}: {details}")]
    Body { url: String, details: String },
}

impl TransportError {
    pub fn request(url: &str, details: impl std::fmt::Display) -> Self {
        Self::Request {
            url: url.to_string(),
            details: details.to_string(),
        }
    }

    pub fn body(url: &str, details: impl std::fmt::Display) -> Self {
        Self::Body {
            url: url.to_string(),
            details: details.to_string(),
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// An open response body together with its advertised length.
pub struct ByteStream {
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET `url` and return the body as text. Non-success statuses are errors.
    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// GET `url` and return the body as a stream. Non-success statuses are
    /// errors.
    async fn open_stream(&self, url: &str) -> Result<ByteStream, TransportError>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with connect and read deadlines and no overall timeout,
    /// so large downloads are limited only by stalls.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(format!("upgate/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| TransportError::ClientBuild(error.to_string()))?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, url: &str, accept: &str) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await
            .map_err(|error| TransportError::request(url, error))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_snippet = response
                .text()
                .await
                .ok()
                .map(|body| response_snippet(&body, BODY_SNIPPET_CHARS))
                .unwrap_or_default();
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
                body_snippet,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        self.send(url, "application/json")
            .await?
            .text()
            .await
            .map_err(|error| TransportError::body(url, error))
    }

    async fn open_stream(&self, url: &str) -> Result<ByteStream, TransportError> {
        let response = self.send(url, "application/octet-stream").await?;
        let content_length = response.content_length();
        let owned_url = url.to_string();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|error| TransportError::body(&owned_url, error))
            })
            .boxed();

        Ok(ByteStream {
            content_length,
            chunks,
        })
    }
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}
