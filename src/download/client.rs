//! HTTP client wrapper shared by discovery, extraction and downloads.
//!
//! All requests carry a connect timeout and an overall request timeout; a
//! timed-out request surfaces as [`DownloadError::Timeout`] so the retry
//! layer treats it like any other transient failure.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS};
use super::error::DownloadError;

/// User-Agent sent with every request.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("agri-harvester/{version} (bibliographic research harvester)")
}

/// Timeouts and identification for the shared client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            user_agent: default_user_agent(),
        }
    }
}

/// HTTP client with connection pooling. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if reqwest rejects the configuration.
    pub fn new(settings: &ClientSettings) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .gzip(true)
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Issues a GET and fails on any non-success status.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`], [`DownloadError::Timeout`],
    /// [`DownloadError::Network`] or [`DownloadError::HttpStatus`].
    #[instrument(level = "debug", skip(self, query))]
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, DownloadError> {
        let mut parsed = url::Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }
        if !query.is_empty() {
            parsed.query_pairs_mut().extend_pairs(query);
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "non-success response");
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }

    /// GETs `url` and returns the decoded body text.
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::get`], plus body read failures.
    pub async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, DownloadError> {
        let response = self.get(url, query).await?;
        response.text().await.map_err(|e| map_reqwest_error(url, e))
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// Bytes written and their MD5, computed in the same pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedFile {
    pub size_bytes: u64,
    /// Lowercase hex.
    pub md5: String,
}

/// Streams the response body to `file_path`, hashing as it writes.
///
/// The caller owns cleanup of `file_path` on error.
pub(crate) async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<StreamedFile, DownloadError> {
    let file = File::create(file_path)
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut hasher = Md5::new();
    let mut size_bytes: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, e))?;
        hasher.update(&chunk);
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        size_bytes += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(StreamedFile {
        size_bytes,
        md5: hex::encode(hasher.finalize()),
    })
}

/// MD5 of the file at `path`, lowercase hex.
///
/// # Errors
///
/// Returns the underlying IO error if the file cannot be read.
pub async fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MD5 of an in-memory buffer, lowercase hex.
#[must_use]
pub fn bytes_md5(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}
