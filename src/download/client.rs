//! HTTP client wrapper for fetching one resource to disk.
//!
//! [`HttpClient::fetch_to_file`] performs a single GET. It never writes to the
//! destination directly: the body is streamed into a `.part` file next to it,
//! size-checked, synced, and renamed into place. Each fetch gets its own
//! `.part` name, so two fetches aimed at one destination never share a temp
//! file. Any early return, including the future being dropped by an abort,
//! removes the `.part` file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::DownloadError;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout never exceeds this, even for long total timeouts.
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Suffix of the temp file the body streams into.
pub const PARTIAL_SUFFIX: &str = ".part";

static PARTIAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Default User-Agent; an auth provider header overrides it per request.
pub const DEFAULT_USER_AGENT: &str = concat!("galleryfetch/", env!("CARGO_PKG_VERSION"));

/// HTTP client for fetching files with streaming support.
///
/// Create once and clone into workers; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the given total per-request timeout.
    ///
    /// The connect timeout is the smaller of `timeout` and 30 seconds.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot be initialized.
    #[instrument(level = "debug", fields(timeout_ms = timeout.as_millis()))]
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
            .timeout(timeout)
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Fetches `url` into `destination`, returning the number of bytes written.
    ///
    /// The parent directory is created if needed. An existing file at
    /// `destination` is replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The URL is invalid or not http(s)
    /// - The destination has no file name or is a directory
    /// - The request fails (network error, timeout)
    /// - The server returns a non-success status
    /// - The body is empty or shorter than the advertised Content-Length
    /// - Writing or renaming the file fails
    #[instrument(skip(self, headers), fields(url = %url, dest = %destination.display()))]
    pub async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        headers: HeaderMap,
    ) -> Result<u64, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let partial_path = partial_path_for(destination)?;
        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
        if tokio::fs::metadata(destination)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Err(DownloadError::invalid_destination(
                destination,
                "destination is a directory",
            ));
        }

        let response = self.send_request(parsed, headers, url).await?;
        let content_length = response.content_length();

        let mut guard = PartialFileGuard::new(partial_path.clone());
        let file = File::create(&partial_path)
            .await
            .map_err(|e| DownloadError::io(&partial_path, e))?;
        let bytes_written = stream_to_file(file, response, url, &partial_path).await?;

        if bytes_written == 0 {
            return Err(DownloadError::empty_body(url));
        }
        if let Some(expected) = content_length
            && expected != bytes_written
        {
            return Err(DownloadError::integrity(url, expected, bytes_written));
        }

        tokio::fs::rename(&partial_path, destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;
        guard.disarm();

        info!(bytes = bytes_written, "download complete");
        Ok(bytes_written)
    }

    async fn send_request(
        &self,
        url: Url,
        headers: HeaderMap,
        raw_url: &str,
    ) -> Result<reqwest::Response, DownloadError> {
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| map_reqwest_error(raw_url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            debug!(status = status.as_u16(), ?retry_after, "non-success status");
            return Err(DownloadError::http_status_with_retry_after(
                raw_url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// Returns `<destination>.<pid>-<seq>.part` in the same directory.
fn partial_path_for(destination: &Path) -> Result<PathBuf, DownloadError> {
    let file_name = destination.file_name().ok_or_else(|| {
        DownloadError::invalid_destination(destination, "destination has no file name")
    })?;
    let sequence = PARTIAL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let mut partial = file_name.to_os_string();
    partial.push(format!(".{}-{sequence}{PARTIAL_SUFFIX}", std::process::id()));
    Ok(destination.with_file_name(partial))
}

/// Streams the response body to `file`, returning bytes written.
///
/// Data is flushed and fsynced before returning so the rename that follows
/// publishes a complete file.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
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

    Ok(bytes_written)
}

/// Removes the partial file on drop unless disarmed.
///
/// Drop runs on error returns and when the owning future is aborted, so a
/// cancelled fetch never leaves a `.part` file behind.
#[derive(Debug)]
struct PartialFileGuard {
    path: Option<PathBuf>,
}

impl PartialFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            debug!(path = %path.display(), "cleaning up partial file");
            if let Err(error) = std::fs::remove_file(&path)
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %error, "failed to remove partial file");
            }
        }
    }
}
