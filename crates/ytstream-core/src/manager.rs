//! The collaborator-facing cache manager.
//!
//! [`StreamCacheManager`] is constructed once per process and owns every
//! component plus the process-wide state shared between them: the sticky
//! provider, the per-id download gates, and the protected set. Nothing in
//! the crate reaches for globals; collaborators talk to this type only.
//!
//! Lifecycle: construct with [`new`](StreamCacheManager::new), call
//! [`start`](StreamCacheManager::start) inside a Tokio runtime to launch the
//! janitor loop and prefetch workers, and [`shutdown`](StreamCacheManager::shutdown)
//! before dropping.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::byte_cache::ByteCache;
use crate::config::CoreConfig;
use crate::error::{DownloadError, Error, Result};
use crate::fetch::StreamFetcher;
use crate::format::ResolvedStream;
use crate::identifier::TrackId;
use crate::ingest::{IngestRequest, LibraryIngest};
use crate::janitor::{CacheJanitor, JanitorHandle, SweepStats};
use crate::metadata_cache::MetadataCache;
use crate::prefetch::{PrefetchScheduler, PrefetchStatus};
use crate::protected::ProtectedSet;
use crate::provider::ProviderChain;
use crate::resolver::{Resolver, StickyProvider};

/// Where the playback consumer should read a track from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamReference {
    /// A complete payload in the byte cache.
    LocalFile {
        /// Absolute path of the cached file.
        path: PathBuf,
    },
    /// A signed upstream URL.
    Remote {
        /// URL of the best format.
        url: String,
        /// Unix time after which the URL should not be used.
        expires_at: u64,
    },
}

impl StreamReference {
    /// Whether the reference points into the byte cache.
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::LocalFile { .. })
    }

    /// The reference as a single string (a path or a URL).
    pub fn location(&self) -> String {
        match self {
            Self::LocalFile { path } => path.display().to_string(),
            Self::Remote { url, .. } => url.clone(),
        }
    }
}

/// A request to download a track into the library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Raw track id.
    pub id: String,
    /// Track title.
    pub title: Option<String>,
    /// Artist name.
    pub artist: Option<String>,
    /// Album name.
    pub album: Option<String>,
    /// Cover art URL.
    pub artwork_url: Option<String>,
}

impl DownloadRequest {
    /// Request with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Result of [`StreamCacheManager::download`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    /// Whether the track ended up on disk.
    pub success: bool,
    /// Final location when successful.
    pub path: Option<PathBuf>,
    /// Error message when not.
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn ok(path: PathBuf) -> Self {
        Self {
            success: true,
            path: Some(path),
            error: None,
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            success: false,
            path: None,
            error: Some(error.to_string()),
        }
    }
}

/// Cache occupancy snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    /// Payload files in the byte cache.
    pub files: usize,
    /// Total bytes of those files.
    pub bytes: u64,
    /// Metadata rows, expired ones included until the next sweep.
    pub metadata_entries: usize,
    /// Size of the protected set.
    pub protected: usize,
    /// Current sticky provider.
    pub sticky_provider: Option<String>,
}

/// Owner of the resolution and cache subsystem.
pub struct StreamCacheManager {
    config: CoreConfig,
    metadata: Arc<MetadataCache>,
    byte_cache: Arc<ByteCache>,
    protected: Arc<ProtectedSet>,
    sticky: Arc<StickyProvider>,
    resolver: Arc<Resolver>,
    fetcher: Arc<StreamFetcher>,
    prefetch: PrefetchScheduler,
    janitor: Arc<CacheJanitor>,
    janitor_handle: Mutex<Option<JanitorHandle>>,
    ingest: Option<Arc<dyn LibraryIngest>>,
}

impl StreamCacheManager {
    /// Build the manager with the default provider chain.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let mut config = config;
        config.validate();
        let http = config.download.http_client()?;
        let chain = ProviderChain::from_config(&config.resolver, &http);
        Self::assemble(config, chain, http)
    }

    /// Build the manager over an explicit provider chain.
    pub fn with_chain(config: CoreConfig, chain: ProviderChain) -> Result<Self> {
        let mut config = config;
        config.validate();
        let http = config.download.http_client()?;
        Self::assemble(config, chain, http)
    }

    fn assemble(config: CoreConfig, chain: ProviderChain, http: reqwest::Client) -> Result<Self> {
        let metadata = Arc::new(MetadataCache::open(&config.metadata_db_path())?);
        let byte_cache = Arc::new(ByteCache::new(&config.cache_dir, config.byte_cache.clone())?);
        let protected = Arc::new(ProtectedSet::new());
        let sticky = Arc::new(StickyProvider::new());

        let resolver = Arc::new(Resolver::new(
            chain,
            Arc::clone(&metadata),
            Arc::clone(&sticky),
            config.resolver.clone(),
        ));
        let fetcher = Arc::new(StreamFetcher::new(
            Arc::clone(&resolver),
            Arc::clone(&byte_cache),
            http,
            config.download.clone(),
        ));
        let prefetch = PrefetchScheduler::new(fetcher.clone(), config.prefetch.clone());
        let janitor = Arc::new(CacheJanitor::new(
            Arc::clone(&byte_cache),
            Arc::clone(&metadata),
            Arc::clone(&protected),
            config.janitor.clone(),
        ));

        info!(
            "Stream cache manager ready at {} ({} providers in {} tiers)",
            config.cache_dir.display(),
            resolver.chain().len(),
            resolver.chain().tiers().len()
        );

        Ok(Self {
            config,
            metadata,
            byte_cache,
            protected,
            sticky,
            resolver,
            fetcher,
            prefetch,
            janitor,
            janitor_handle: Mutex::new(None),
            ingest: None,
        })
    }

    /// Attach the library-ingest collaborator used by [`download`](Self::download).
    #[must_use]
    pub fn with_ingest(mut self, ingest: Arc<dyn LibraryIngest>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    /// Active configuration.
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The resolver.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// The byte cache.
    pub fn byte_cache(&self) -> &ByteCache {
        &self.byte_cache
    }

    /// The metadata cache.
    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Launch the janitor loop (if enabled) and the prefetch workers.
    ///
    /// Must be called inside a Tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.config.janitor.enabled {
            match self.janitor_handle.lock() {
                Ok(mut slot) if slot.is_none() => {
                    *slot = Some(Arc::clone(&self.janitor).start());
                }
                Ok(_) => {}
                Err(_) => warn!("Janitor handle lock poisoned, janitor not started"),
            }
        } else {
            debug!("Cache janitor disabled");
        }
        self.prefetch.start();
    }

    /// Stop background work and wait for it to finish.
    pub async fn shutdown(&self) {
        self.prefetch.shutdown().await;

        let handle = match self.janitor_handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
        info!("Stream cache manager stopped");
    }

    /// Resolve a raw id to a ranked stream.
    pub async fn resolve(&self, raw: &str) -> Result<ResolvedStream> {
        self.resolver.resolve_raw(raw).await
    }

    /// Playable reference for `raw`, or `None` when it cannot be played.
    ///
    /// A cached payload wins and has its access time bumped. Otherwise the
    /// best remote URL is returned and, with `cache_on_play`, a background
    /// cache fill is queued.
    pub async fn get_stream_url(&self, raw: &str) -> Option<StreamReference> {
        let id = match TrackId::parse(raw) {
            Ok(id) => id,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        match self.byte_cache.touch(&id) {
            Ok(Some(path)) => {
                debug!("Serving {} from byte cache", id);
                return Some(StreamReference::LocalFile { path });
            }
            Ok(None) => {}
            Err(e) => warn!("Byte cache lookup for {} failed: {}", id, e),
        }

        let reference = match self.remote_reference(&id).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!("No playable stream for {}: {}", id, e);
                return None;
            }
        };

        if self.config.prefetch.cache_on_play {
            self.prefetch.enqueue([&id]).await;
        }
        Some(reference)
    }

    /// Best remote URL for `raw`, bypassing the byte cache.
    pub async fn direct_url(&self, raw: &str) -> Result<String> {
        let id = TrackId::parse(raw)?;
        match self.remote_reference(&id).await? {
            StreamReference::Remote { url, .. } => Ok(url),
            StreamReference::LocalFile { path } => Ok(path.display().to_string()),
        }
    }

    async fn remote_reference(&self, id: &TrackId) -> Result<StreamReference> {
        let stream = self.resolver.resolve(id).await?;
        stream
            .best()
            .and_then(|f| f.url.clone())
            .map(|url| StreamReference::Remote {
                url,
                expires_at: stream.expires_at,
            })
            .ok_or_else(|| {
                DownloadError::NoDownloadableFormat {
                    video_id: id.to_string(),
                    reason: "resolved stream has no playable format".to_string(),
                }
                .into()
            })
    }

    /// Download a track and hand it to the library collaborator.
    ///
    /// Without a collaborator the cached file itself is the result.
    pub async fn download(&self, request: DownloadRequest) -> DownloadOutcome {
        match self.try_download(request).await {
            Ok(path) => DownloadOutcome::ok(path),
            Err(e) => {
                warn!("Download failed: {}", e);
                DownloadOutcome::failed(&e)
            }
        }
    }

    async fn try_download(&self, request: DownloadRequest) -> Result<PathBuf> {
        let id = TrackId::parse(&request.id)?;
        let cached = self.fetcher.fetch(&id).await?;
        if let Err(e) = self.byte_cache.touch(&id) {
            debug!("Could not touch {}: {}", id, e);
        }

        let Some(ingest) = &self.ingest else {
            info!("Downloaded {} to {}", id, cached.display());
            return Ok(cached);
        };

        let title = request.title.or_else(|| {
            self.metadata
                .get(&id)
                .ok()
                .flatten()
                .and_then(|stream| stream.title)
        });
        ingest
            .ingest(IngestRequest {
                id,
                source_path: cached,
                title,
                artist: request.artist,
                album: request.album,
                artwork_url: request.artwork_url,
            })
            .await
    }

    /// Queue one id for background caching.
    pub async fn prefetch_song(&self, raw: &str) -> usize {
        self.prefetch.enqueue([raw]).await
    }

    /// Queue several ids for background caching.
    pub async fn prefetch_videos<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefetch.enqueue(ids).await
    }

    /// Wait for the prefetch queue to drain.
    pub async fn wait_for_prefetch(&self) {
        self.prefetch.wait_idle().await;
    }

    /// Replace the protected set wholesale. Returns its new size.
    pub fn update_protected_song_ids<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.protected.replace(ids)
    }

    /// Prefetch queue snapshot.
    pub async fn get_prefetch_status(&self) -> PrefetchStatus {
        self.prefetch.status().await
    }

    /// Forget everything cached for `raw`. Returns whether anything was
    /// removed.
    pub fn invalidate(&self, raw: &str) -> Result<bool> {
        let id = TrackId::parse(raw)?;
        let metadata_removed = self.resolver.invalidate(&id)?;
        let files_removed = self.byte_cache.remove(&id)?;
        if metadata_removed || files_removed > 0 {
            info!(
                "Invalidated {} (metadata: {}, files: {})",
                id, metadata_removed, files_removed
            );
        }
        Ok(metadata_removed || files_removed > 0)
    }

    /// Run a janitor sweep right away on the blocking pool.
    pub async fn sweep_now(&self) -> SweepStats {
        let janitor = Arc::clone(&self.janitor);
        match tokio::task::spawn_blocking(move || janitor.sweep()).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Cache sweep task panicked: {}", e);
                SweepStats::default()
            }
        }
    }

    /// Cache occupancy.
    pub fn cache_summary(&self) -> CacheSummary {
        let entries = self.byte_cache.entries();
        CacheSummary {
            files: entries.len(),
            bytes: entries.iter().map(|e| e.size_bytes).sum(),
            metadata_entries: self.metadata.len().unwrap_or_default(),
            protected: self.protected.len(),
            sticky_provider: self.sticky.get(),
        }
    }
}

impl std::fmt::Debug for StreamCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCacheManager")
            .field("cache_dir", &self.config.cache_dir)
            .field("has_ingest", &self.ingest.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use crate::janitor::JanitorConfig;
    use crate::provider::{MockProvider, ProviderTier, TierStrategy};
    use std::time::Duration;
    use tempfile::TempDir;

    fn stream() -> ResolvedStream {
        let format = AudioFormat::from_mime(
            "audio/webm; codecs=\"opus\"",
            None,
            160_000,
            Some("https://media.example/a?expire=4102444800".to_string()),
        );
        ResolvedStream {
            formats: vec![format],
            expires_at: 4_102_444_500,
            title: Some("Title".to_string()),
            duration_sec: Some(200.0),
        }
    }

    fn manager(temp: &TempDir, calls: usize) -> StreamCacheManager {
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("mock".to_string());
        provider
            .expect_resolve()
            .times(calls)
            .returning(|_, _| Ok(stream()));
        let chain = ProviderChain::new(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(1))
                .with_provider(Arc::new(provider)),
        ]);
        let config = CoreConfig::default()
            .with_cache_dir(temp.path())
            .with_janitor(JanitorConfig {
                enabled: false,
                ..JanitorConfig::default()
            });
        StreamCacheManager::with_chain(config, chain).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_id_yields_none() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 0);
        assert!(manager.get_stream_url("not an id!").await.is_none());
    }

    #[tokio::test]
    async fn test_remote_reference_and_cache_on_play() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 1);

        let reference = manager.get_stream_url("abc12345678").await.unwrap();
        assert!(!reference.is_local());
        assert_eq!(
            reference.location(),
            "https://media.example/a?expire=4102444800"
        );
        assert_eq!(manager.get_prefetch_status().await.queued, 1);

        // Served from metadata, no second provider call.
        let url = manager.direct_url("abc12345678").await.unwrap();
        assert!(url.starts_with("https://media.example/"));
    }

    #[tokio::test]
    async fn test_local_file_wins() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 0);
        let id = TrackId::parse("abc12345678").unwrap();
        manager
            .byte_cache()
            .write(&id, &vec![0u8; 128 * 1024], "webm")
            .unwrap();

        let reference = manager.get_stream_url("abc12345678").await.unwrap();
        assert!(reference.is_local());
    }

    #[tokio::test]
    async fn test_invalidate_removes_metadata_and_files() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 1);
        manager.resolve("abc12345678").await.unwrap();
        let id = TrackId::parse("abc12345678").unwrap();
        manager
            .byte_cache()
            .write(&id, &vec![0u8; 128 * 1024], "webm")
            .unwrap();

        assert!(manager.invalidate("abc12345678").unwrap());
        assert!(!manager.byte_cache().has(&id));
        assert!(manager.metadata().get(&id).unwrap().is_none());
        assert!(!manager.invalidate("abc12345678").unwrap());
    }

    #[tokio::test]
    async fn test_download_invalid_id_reports_failure() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 0);
        let outcome = manager.download(DownloadRequest::new("??")).await;
        assert!(!outcome.success);
        assert!(outcome.path.is_none());
        assert!(outcome.error.unwrap().contains("Invalid track identifier"));
    }

    #[tokio::test]
    async fn test_protected_ids_are_replaced() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 0);
        assert_eq!(
            manager.update_protected_song_ids(["abc12345678", "bbbbbbbbbbb"]),
            2
        );
        assert_eq!(manager.update_protected_song_ids(["ccccccccccc"]), 1);
        assert_eq!(manager.cache_summary().protected, 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 0);
        manager.start();
        manager.start();
        manager.shutdown().await;
        let stats = manager.sweep_now().await;
        assert_eq!(stats.files_removed(), 0);
    }
}
