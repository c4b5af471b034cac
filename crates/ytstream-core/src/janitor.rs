//! Periodic eviction sweep over the byte cache.
//!
//! A sweep runs four passes:
//!
//! 0. purge expired metadata rows;
//! 1. delete unprotected payloads unused for longer than `max_age`;
//! 2. while unprotected bytes exceed the budget, delete unprotected payloads
//!    least-recently-accessed first;
//! 3. delete orphaned staging files.
//!
//! Protected payloads are never candidates in either eviction pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::byte_cache::{ByteCache, ByteCacheFile};
use crate::format::unix_now;
use crate::identifier::TrackId;
use crate::metadata_cache::MetadataCache;
use crate::protected::ProtectedSet;

/// Default maximum age of an unused payload (30 days).
pub const DEFAULT_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

/// Default byte budget for unprotected payloads (2 GiB).
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default interval between sweeps (1 hour).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Default age after which a staging file counts as orphaned (1 hour).
pub const DEFAULT_PARTIAL_MAX_AGE_SECS: u64 = 60 * 60;

/// Janitor options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Whether the periodic loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unprotected payloads unused for longer than this are deleted.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Byte budget for unprotected payloads.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Seconds between sweeps.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Staging files older than this are removed.
    #[serde(default = "default_partial_max_age")]
    pub partial_max_age_secs: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_max_age() -> u64 {
    DEFAULT_MAX_AGE_SECS
}

const fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

const fn default_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

const fn default_partial_max_age() -> u64 {
    DEFAULT_PARTIAL_MAX_AGE_SECS
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            max_bytes: DEFAULT_MAX_BYTES,
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            partial_max_age_secs: DEFAULT_PARTIAL_MAX_AGE_SECS,
        }
    }
}

impl JanitorConfig {
    /// Set the maximum unused age.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    /// Set the byte budget.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs();
        self
    }

    /// Clamp values that would make the loop spin.
    pub fn validate(&mut self) {
        self.interval_secs = self.interval_secs.max(1);
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    /// Expired metadata rows purged.
    pub expired_metadata: usize,
    /// Payloads deleted for age.
    pub aged_files: usize,
    /// Bytes freed by the age pass.
    pub aged_bytes: u64,
    /// Payloads deleted to meet the budget.
    pub budget_files: usize,
    /// Bytes freed by the budget pass.
    pub budget_bytes: u64,
    /// Orphaned staging files removed.
    pub partial_files: usize,
    /// Bytes freed from staging.
    pub partial_bytes: u64,
    /// Protected payloads seen and left alone.
    pub protected_skipped: usize,
    /// Unprotected bytes left after the sweep.
    pub remaining_unprotected_bytes: u64,
    /// Wall time of the sweep.
    pub duration_ms: u64,
}

impl SweepStats {
    /// Total payloads deleted.
    #[must_use]
    pub const fn files_removed(&self) -> usize {
        self.aged_files + self.budget_files
    }

    /// Total payload bytes freed.
    #[must_use]
    pub const fn bytes_freed(&self) -> u64 {
        self.aged_bytes + self.budget_bytes
    }
}

/// Handle to a running janitor loop.
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop the loop and wait for an in-progress sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!("Janitor task ended abnormally: {}", e);
        }
    }
}

/// Byte cache janitor.
#[derive(Debug)]
pub struct CacheJanitor {
    byte_cache: Arc<ByteCache>,
    metadata: Arc<MetadataCache>,
    protected: Arc<ProtectedSet>,
    config: JanitorConfig,
}

impl CacheJanitor {
    /// Create a janitor over the given caches.
    #[must_use]
    pub const fn new(
        byte_cache: Arc<ByteCache>,
        metadata: Arc<MetadataCache>,
        protected: Arc<ProtectedSet>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            byte_cache,
            metadata,
            protected,
            config,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &JanitorConfig {
        &self.config
    }

    /// Run one full sweep.
    ///
    /// Individual deletion failures are logged and skipped.
    pub fn sweep(&self) -> SweepStats {
        let started = Instant::now();
        let now = unix_now();
        let protected = self.protected.snapshot();
        let mut stats = SweepStats::default();

        match self.metadata.purge_expired_at(now) {
            Ok(n) => stats.expired_metadata = n,
            Err(e) => warn!("Metadata purge failed: {}", e),
        }

        let (mut candidates, protected_files) = partition(self.byte_cache.entries(), &protected);
        stats.protected_skipped = protected_files;

        // Age pass.
        let max_age = self.config.max_age_secs;
        candidates.retain(|file| {
            if now.saturating_sub(file.last_used()) <= max_age {
                return true;
            }
            if remove_file(file) {
                stats.aged_files += 1;
                stats.aged_bytes += file.size_bytes;
                false
            } else {
                true
            }
        });

        // Budget pass, least recently accessed first.
        let mut unprotected_bytes: u64 = candidates.iter().map(|f| f.size_bytes).sum();
        if unprotected_bytes > self.config.max_bytes {
            candidates.sort_by_key(|f| (f.last_access, f.last_modified));
            for file in &candidates {
                if unprotected_bytes <= self.config.max_bytes {
                    break;
                }
                if remove_file(file) {
                    stats.budget_files += 1;
                    stats.budget_bytes += file.size_bytes;
                    unprotected_bytes -= file.size_bytes;
                }
            }
        }
        stats.remaining_unprotected_bytes = unprotected_bytes;

        let (partial_files, partial_bytes) = self
            .byte_cache
            .clear_partials(Duration::from_secs(self.config.partial_max_age_secs));
        stats.partial_files = partial_files;
        stats.partial_bytes = partial_bytes;

        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if stats.files_removed() > 0 || stats.partial_files > 0 {
            info!(
                "Cache sweep removed {} files ({} bytes), {} protected kept, {} bytes unprotected remain",
                stats.files_removed(),
                stats.bytes_freed(),
                stats.protected_skipped,
                stats.remaining_unprotected_bytes
            );
        } else {
            debug!(
                "Cache sweep found nothing to remove ({} protected, {} ms)",
                stats.protected_skipped, stats.duration_ms
            );
        }

        stats
    }

    /// Spawn the periodic loop: one sweep now, then one per interval.
    ///
    /// Sweeps run on the blocking pool. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(self: Arc<Self>) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let period = self.config.interval().max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Cache janitor shutting down");
                        break;
                    }
                    _ = timer.tick() => {
                        let janitor = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || janitor.sweep()).await {
                            Ok(_) => {}
                            Err(e) => warn!("Cache sweep task panicked: {}", e),
                        }
                    }
                }
            }
        });

        info!("Cache janitor started (interval {:?})", period);
        JanitorHandle { shutdown_tx, task }
    }
}

fn partition(
    files: Vec<ByteCacheFile>,
    protected: &HashSet<TrackId>,
) -> (Vec<ByteCacheFile>, usize) {
    let mut protected_count = 0;
    let candidates = files
        .into_iter()
        .filter(|f| {
            let keep = protected.contains(&f.id);
            if keep {
                protected_count += 1;
            }
            !keep
        })
        .collect();
    (candidates, protected_count)
}

fn remove_file(file: &ByteCacheFile) -> bool {
    match std::fs::remove_file(&file.path) {
        Ok(()) => {
            debug!("Evicted {}", file.path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("Failed to evict {}: {}", file.path.display(), e);
            false
        }
    }
}
