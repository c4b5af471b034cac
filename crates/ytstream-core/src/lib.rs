//! `ytstream` Core Library
//!
//! This crate turns opaque YouTube track ids into playable audio:
//! - Resolution across heterogeneous upstream providers (Piped, Invidious,
//!   InnerTube client flavors, and a local extractor), raced or cascaded
//!   in tiers with per-attempt timeouts
//! - A persistent, expiry-aware metadata cache (SQLite)
//! - A disk byte cache with atomic writes and access-time tracking
//! - A janitor that enforces age and size budgets while never touching
//!   protected tracks
//! - A bounded-concurrency prefetch scheduler that warms the byte cache
//!
//! Collaborators use [`StreamCacheManager`], which owns every component.
//!
//! ```rust,ignore
//! use ytstream_core::{CoreConfig, StreamCacheManager};
//!
//! async fn play(id: &str) -> ytstream_core::Result<()> {
//!     let manager = StreamCacheManager::new(CoreConfig::default())?;
//!     manager.start();
//!     if let Some(reference) = manager.get_stream_url(id).await {
//!         println!("{}", reference.location());
//!     }
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod byte_cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod format;
pub mod identifier;
pub mod ingest;
pub mod janitor;
pub mod manager;
pub mod metadata_cache;
pub mod prefetch;
pub mod protected;
pub mod provider;
pub mod resolver;

pub use byte_cache::{
    AUDIO_DIR, ByteCache, ByteCacheConfig, ByteCacheFile, DEFAULT_FRESHNESS_SECS,
    DEFAULT_MIN_VALID_BYTES, PARTIAL_DIR, PendingWrite,
};
pub use config::{
    ConfigManager, CoreConfig, METADATA_DB_FILE, default_cache_directory,
    default_config_file_path,
};
pub use error::{AttemptFailure, CacheError, DownloadError, Error, Result};
pub use fetch::{DownloadConfig, StreamFetcher};
pub use format::{AudioFormat, ResolvedStream, StreamPolicy, parse_url_expiry};
pub use identifier::TrackId;
pub use ingest::{FolderIngest, IngestRequest, LibraryIngest, sanitize_filename};
pub use janitor::{CacheJanitor, JanitorConfig, JanitorHandle, SweepStats};
pub use manager::{
    CacheSummary, DownloadOutcome, DownloadRequest, StreamCacheManager, StreamReference,
};
pub use metadata_cache::{MetadataCache, MetadataCacheEntry};
pub use prefetch::{
    DEFAULT_MAX_CONCURRENT_PREFETCHES, MAX_CONCURRENT_PREFETCHES, MIN_CONCURRENT_PREFETCHES,
    PrefetchConfig, PrefetchScheduler, PrefetchStatus, TrackWarmer,
};
pub use protected::ProtectedSet;
pub use provider::{
    InnerTubeClient, Provider, ProviderChain, ProviderError, ProviderTier, TierStrategy,
};
pub use resolver::{Resolver, ResolverConfig, StickyProvider};
