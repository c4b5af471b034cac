//! Full-payload downloads into the byte cache.
//!
//! Two callers asking for the same track at once share one download: each
//! id has an async gate, and the second caller finds the file already cached
//! when it gets through.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::byte_cache::{ByteCache, PendingWrite};
use crate::error::{CacheError, DownloadError, Error, Result};
use crate::format::{AudioFormat, ResolvedStream};
use crate::identifier::TrackId;
use crate::prefetch::TrackWarmer;
use crate::resolver::Resolver;

/// Default whole-request timeout for a download request.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default ranged-request size (4 MiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Default `User-Agent` for HTTP requests.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// HTTP download options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Timeout for a single request, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Connect timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Size of each ranged request. `0` downloads in one request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,

    /// `User-Agent` header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

const fn default_timeout() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

const fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

const fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE_BYTES
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadConfig {
    /// Set the ranged-request size.
    #[must_use]
    pub const fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    /// Clamp timeouts to at least one second.
    pub fn validate(&mut self) {
        self.timeout_secs = self.timeout_secs.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build the shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the client cannot be built.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))
    }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Downloads resolved streams into the byte cache.
#[derive(Debug)]
pub struct StreamFetcher {
    resolver: Arc<Resolver>,
    byte_cache: Arc<ByteCache>,
    http: reqwest::Client,
    config: DownloadConfig,
    in_flight: Mutex<HashMap<TrackId, Gate>>,
}

impl StreamFetcher {
    /// Create a fetcher.
    #[must_use]
    pub fn new(
        resolver: Arc<Resolver>,
        byte_cache: Arc<ByteCache>,
        http: reqwest::Client,
        config: DownloadConfig,
    ) -> Self {
        Self {
            resolver,
            byte_cache,
            http,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of ids with a download in progress or waiting.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map_or(0, |map| map.len())
    }

    /// Make sure `id` is in the byte cache and return its path.
    ///
    /// # Errors
    ///
    /// Returns a resolution error, or [`DownloadError::NoDownloadableFormat`]
    /// when every ranked format failed.
    pub async fn fetch(&self, id: &TrackId) -> Result<PathBuf> {
        if let Some(path) = self.byte_cache.path(id) {
            return Ok(path);
        }

        let gate = self.gate(id)?;
        let result = {
            let _guard = gate.lock().await;
            self.fetch_locked(id).await
        };
        self.release(id, &gate);
        result
    }

    fn gate(&self, id: &TrackId) -> Result<Gate> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| Error::from(CacheError::LockPoisoned))?;
        Ok(Arc::clone(map.entry(id.clone()).or_default()))
    }

    fn release(&self, id: &TrackId, gate: &Gate) {
        let Ok(mut map) = self.in_flight.lock() else {
            return;
        };
        // One reference in the map, one held by the caller.
        if Arc::strong_count(gate) <= 2 {
            map.remove(id);
        }
    }

    async fn fetch_locked(&self, id: &TrackId) -> Result<PathBuf> {
        if let Some(path) = self.byte_cache.path(id) {
            debug!("{} was cached while waiting", id);
            return Ok(path);
        }

        let stream = self.resolver.resolve(id).await?;
        match self.download_stream(id, &stream).await {
            Err(e) if is_url_rejection(&e) => {
                info!("Stream URLs for {} were rejected, re-resolving", id);
                self.resolver.invalidate(id)?;
                let stream = self.resolver.resolve(id).await?;
                self.download_stream(id, &stream).await
            }
            other => other,
        }
    }

    async fn download_stream(&self, id: &TrackId, stream: &ResolvedStream) -> Result<PathBuf> {
        let mut last_error = None;
        let mut all_rejected = true;

        for format in stream.formats.iter().filter(|f| f.is_playable()) {
            match self.download_format(id, format).await {
                Ok(path) => {
                    info!(
                        "Downloaded {} ({} @ {} bps) to {}",
                        id,
                        format.codec,
                        format.bitrate_bps,
                        path.display()
                    );
                    return Ok(path);
                }
                Err(e) => {
                    warn!("Download of {} ({}) failed: {}", id, format.codec, e);
                    all_rejected &= is_url_rejection(&e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if all_rejected => Err(e),
            Some(e) => Err(DownloadError::NoDownloadableFormat {
                video_id: id.to_string(),
                reason: e.to_string(),
            }
            .into()),
            None => Err(DownloadError::NoDownloadableFormat {
                video_id: id.to_string(),
                reason: "no playable format".to_string(),
            }
            .into()),
        }
    }

    async fn download_format(&self, id: &TrackId, format: &AudioFormat) -> Result<PathBuf> {
        let url = format
            .url
            .as_deref()
            .ok_or_else(|| DownloadError::NoDownloadableFormat {
                video_id: id.to_string(),
                reason: "format has no URL".to_string(),
            })?;

        let mut pending = self.byte_cache.begin_write(id, format.extension())?;
        match format.size_bytes {
            Some(total) if self.config.chunk_size_bytes > 0 => {
                self.download_ranged(id, url, total, &mut pending).await?;
            }
            _ => {
                let response = self.send(id, self.http.get(url)).await?;
                check_status(id, response.status())?;
                stream_body(id, response, &mut pending).await?;
            }
        }
        pending.commit()
    }

    async fn download_ranged(
        &self,
        id: &TrackId,
        url: &str,
        total: u64,
        pending: &mut PendingWrite,
    ) -> Result<()> {
        let chunk = self.config.chunk_size_bytes;
        let mut offset = 0u64;

        while offset < total {
            let end = offset.saturating_add(chunk - 1).min(total - 1);
            let request = self
                .http
                .get(url)
                .header(RANGE, format!("bytes={offset}-{end}"));
            let response = self.send(id, request).await?;

            match response.status() {
                StatusCode::PARTIAL_CONTENT => {}
                // Range ignored: the body is the whole payload.
                StatusCode::OK if offset == 0 => {
                    return stream_body(id, response, pending).await;
                }
                status => {
                    check_status(id, status)?;
                    return Err(DownloadError::Network {
                        video_id: id.to_string(),
                        reason: format!("unexpected {status} for range at {offset}"),
                    }
                    .into());
                }
            }

            let before = pending.written();
            stream_body(id, response, pending).await?;
            let received = pending.written() - before;
            if received == 0 {
                return Err(DownloadError::Network {
                    video_id: id.to_string(),
                    reason: format!("empty range response at {offset}"),
                }
                .into());
            }
            offset += received;
        }
        Ok(())
    }

    async fn send(
        &self,
        id: &TrackId,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        request
            .timeout(self.config.timeout())
            .send()
            .await
            .map_err(|e| network_error(id, &e))
    }
}

fn check_status(id: &TrackId, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(DownloadError::HttpStatus {
            video_id: id.to_string(),
            status: status.as_u16(),
        }
        .into())
    }
}

async fn stream_body(
    id: &TrackId,
    mut response: reqwest::Response,
    pending: &mut PendingWrite,
) -> Result<()> {
    while let Some(chunk) = response.chunk().await.map_err(|e| network_error(id, &e))? {
        pending.append(&chunk)?;
    }
    Ok(())
}

fn network_error(id: &TrackId, err: &reqwest::Error) -> Error {
    DownloadError::Network {
        video_id: id.to_string(),
        reason: err.to_string(),
    }
    .into()
}

/// Signed URL refused: expired or revoked.
fn is_url_rejection(err: &Error) -> bool {
    matches!(
        err,
        Error::Download(DownloadError::HttpStatus {
            status: 403 | 410,
            ..
        })
    )
}

#[async_trait]
impl TrackWarmer for StreamFetcher {
    fn is_cached(&self, id: &TrackId) -> bool {
        self.byte_cache.has(id)
    }

    async fn warm(&self, id: &TrackId) -> Result<PathBuf> {
        self.fetch(id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_url_rejection_classification() {
        let forbidden: Error = DownloadError::HttpStatus {
            video_id: "abc12345678".to_string(),
            status: 403,
        }
        .into();
        let gone: Error = DownloadError::HttpStatus {
            video_id: "abc12345678".to_string(),
            status: 410,
        }
        .into();
        let server: Error = DownloadError::HttpStatus {
            video_id: "abc12345678".to_string(),
            status: 500,
        }
        .into();

        assert!(is_url_rejection(&forbidden));
        assert!(is_url_rejection(&gone));
        assert!(!is_url_rejection(&server));
    }

    #[test]
    fn test_download_config_defaults() {
        let mut config = DownloadConfig {
            timeout_secs: 0,
            ..DownloadConfig::default()
        };
        config.validate();
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert!(config.http_client().is_ok());
    }
}
