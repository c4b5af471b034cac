//! Background warming of the byte cache.
//!
//! A FIFO of track ids drained by a fixed pool of K workers. Ids already
//! cached, queued, or being warmed are dropped at enqueue time. Failures are
//! logged and forgotten: there is no retry and no back-pressure on callers.
//!
//! The pool size bounds concurrency by construction: each worker warms at
//! most one id at a time, and a worker that finishes claims the next queued
//! id before it goes back to sleep.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identifier::TrackId;

/// Default number of prefetch workers.
pub const DEFAULT_MAX_CONCURRENT_PREFETCHES: usize = 2;

/// Minimum number of prefetch workers.
pub const MIN_CONCURRENT_PREFETCHES: usize = 1;

/// Maximum number of prefetch workers.
pub const MAX_CONCURRENT_PREFETCHES: usize = 8;

/// Something that can put a track into the byte cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackWarmer: Send + Sync {
    /// Whether `id` is already cached.
    fn is_cached(&self, id: &TrackId) -> bool;

    /// Download `id` into the cache.
    async fn warm(&self, id: &TrackId) -> Result<PathBuf>;
}

/// Prefetch options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Worker pool size.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Queue a background cache fill when a track is played uncached.
    #[serde(default = "default_true")]
    pub cache_on_play: bool,
}

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_PREFETCHES
}

const fn default_true() -> bool {
    true
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_PREFETCHES,
            cache_on_play: true,
        }
    }
}

impl PrefetchConfig {
    /// Validate and clamp the `max_concurrent` value.
    pub fn validate(&mut self) {
        self.max_concurrent = self
            .max_concurrent
            .clamp(MIN_CONCURRENT_PREFETCHES, MAX_CONCURRENT_PREFETCHES);
    }

    /// Set the worker pool size.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Snapshot of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchStatus {
    /// Ids waiting for a worker.
    pub queued: usize,
    /// Ids being warmed right now.
    pub active: usize,
    /// Ids warmed during this session, oldest first.
    pub cached_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct PrefetchState {
    pending: VecDeque<TrackId>,
    queued: HashSet<TrackId>,
    in_flight: HashSet<TrackId>,
    completed: Vec<TrackId>,
    completed_set: HashSet<TrackId>,
}

impl PrefetchState {
    fn claim(&mut self) -> Option<TrackId> {
        let id = self.pending.pop_front()?;
        self.queued.remove(&id);
        self.in_flight.insert(id.clone());
        Some(id)
    }

    fn finish(&mut self, id: &TrackId, ok: bool) {
        self.in_flight.remove(id);
        if ok && self.completed_set.insert(id.clone()) {
            self.completed.push(id.clone());
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

/// Bounded-concurrency prefetch queue.
pub struct PrefetchScheduler {
    state: Arc<RwLock<PrefetchState>>,
    warmer: Arc<dyn TrackWarmer>,
    work: Arc<Notify>,
    idle: Arc<Notify>,
    config: PrefetchConfig,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PrefetchScheduler {
    /// Create a scheduler. Workers do not run until [`start`](Self::start).
    #[must_use]
    pub fn new(warmer: Arc<dyn TrackWarmer>, mut config: PrefetchConfig) -> Self {
        config.validate();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(PrefetchState::default())),
            warmer,
            work: Arc::new(Notify::new()),
            idle: Arc::new(Notify::new()),
            config,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Queue ids for warming. Returns how many were accepted.
    ///
    /// Malformed ids and ids that are cached, queued, or being warmed are
    /// dropped silently.
    pub async fn enqueue<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let candidates: Vec<TrackId> = ids
            .into_iter()
            .filter_map(|raw| match TrackId::parse(raw.as_ref()) {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!("Skipping prefetch: {}", e);
                    None
                }
            })
            // Disk checks happen before the lock so workers are not held up.
            .filter(|id| !self.warmer.is_cached(id))
            .collect();

        let mut accepted = 0;
        {
            let mut state = self.state.write().await;
            for id in candidates {
                if state.queued.contains(&id) || state.in_flight.contains(&id) {
                    continue;
                }
                state.queued.insert(id.clone());
                state.pending.push_back(id);
                accepted += 1;
            }
        }

        if accepted > 0 {
            debug!("Queued {} ids for prefetch", accepted);
            self.work.notify_one();
        }
        accepted
    }

    /// Drop every queued id. In-flight warms continue. Returns how many
    /// ids were dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.write().await;
        let removed = state.pending.len();
        state.pending.clear();
        state.queued.clear();
        if removed > 0 {
            info!("Cleared {} queued prefetches", removed);
        }
        drop(state);
        self.idle.notify_waiters();
        removed
    }

    /// Current queue snapshot.
    pub async fn status(&self) -> PrefetchStatus {
        let state = self.state.read().await;
        PrefetchStatus {
            queued: state.pending.len(),
            active: state.in_flight.len(),
            cached_ids: state.completed.iter().map(ToString::to_string).collect(),
        }
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let Ok(mut workers) = self.workers.lock() else {
            warn!("Prefetch worker list lock poisoned, not starting");
            return;
        };
        if !workers.is_empty() {
            return;
        }

        for index in 0..self.config.max_concurrent {
            let worker = Worker {
                index,
                state: Arc::clone(&self.state),
                warmer: Arc::clone(&self.warmer),
                work: Arc::clone(&self.work),
                idle: Arc::clone(&self.idle),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(
            "Prefetch scheduler started with {} workers",
            self.config.max_concurrent
        );
    }

    /// Wait until nothing is queued or in flight.
    ///
    /// Only meaningful once the workers are running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.read().await.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the workers after their current warm and wait for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.work.notify_waiters();

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Prefetch worker ended abnormally: {}", e);
            }
        }
        debug!("Prefetch scheduler stopped");
    }
}

impl std::fmt::Debug for PrefetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Worker {
    index: usize,
    state: Arc<RwLock<PrefetchState>>,
    warmer: Arc<dyn TrackWarmer>,
    work: Arc<Notify>,
    idle: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let (next, more) = {
                let mut state = self.state.write().await;
                let next = state.claim();
                (next, !state.pending.is_empty())
            };

            let Some(id) = next else {
                tokio::select! {
                    () = self.work.notified() => continue,
                    _ = self.shutdown_rx.changed() => break,
                }
            };

            // Hand the rest of the queue to a sleeping worker.
            if more {
                self.work.notify_one();
            }

            debug!("Prefetch worker {} warming {}", self.index, id);
            let ok = match self.warmer.warm(&id).await {
                Ok(path) => {
                    debug!("Prefetched {} to {}", id, path.display());
                    true
                }
                Err(e) => {
                    warn!("Prefetch of {} failed: {}", id, e);
                    false
                }
            };

            let idle = {
                let mut state = self.state.write().await;
                state.finish(&id, ok);
                state.is_idle()
            };
            if idle {
                self.idle.notify_waiters();
            }
        }
        debug!("Prefetch worker {} exiting", self.index);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{DownloadError, Error};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingWarmer {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TrackWarmer for CountingWarmer {
        fn is_cached(&self, _id: &TrackId) -> bool {
            false
        }

        async fn warm(&self, id: &TrackId) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(DownloadError::Network {
                    video_id: id.to_string(),
                    reason: "boom".to_string(),
                }
                .into());
            }
            Ok(PathBuf::from(format!("/cache/{id}.webm")))
        }
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let warmer = Arc::new(CountingWarmer::default());
        let scheduler = PrefetchScheduler::new(
            warmer.clone(),
            PrefetchConfig::default().with_max_concurrent(2),
        );

        let accepted = scheduler
            .enqueue(["aaaaaaaaaaa", "bbbbbbbbbbb", "aaaaaaaaaaa"])
            .await;
        assert_eq!(accepted, 2);

        scheduler.start();
        scheduler.wait_idle().await;
        scheduler.shutdown().await;

        assert_eq!(warmer.calls.load(Ordering::SeqCst), 2);
        let status = scheduler.status().await;
        assert_eq!(status.cached_ids, vec!["aaaaaaaaaaa", "bbbbbbbbbbb"]);
        assert_eq!(status.queued, 0);
        assert_eq!(status.active, 0);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_pool_size() {
        let warmer = Arc::new(CountingWarmer::default());
        let scheduler = PrefetchScheduler::new(
            warmer.clone(),
            PrefetchConfig::default().with_max_concurrent(2),
        );
        scheduler.start();
        scheduler
            .enqueue([
                "aaaaaaaaaaa",
                "bbbbbbbbbbb",
                "ccccccccccc",
                "ddddddddddd",
                "eeeeeeeeeee",
                "fffffffffff",
            ])
            .await;
        scheduler.wait_idle().await;
        scheduler.shutdown().await;

        assert_eq!(warmer.calls.load(Ordering::SeqCst), 6);
        assert!(warmer.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(warmer.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_only_drops_pending() {
        let warmer = Arc::new(CountingWarmer::default());
        let scheduler = PrefetchScheduler::new(warmer.clone(), PrefetchConfig::default());
        scheduler.enqueue(["aaaaaaaaaaa", "bbbbbbbbbbb"]).await;

        assert_eq!(scheduler.clear().await, 2);
        scheduler.start();
        scheduler.wait_idle().await;
        scheduler.shutdown().await;

        assert_eq!(warmer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_retried() {
        let warmer = Arc::new(CountingWarmer {
            fail: true,
            ..CountingWarmer::default()
        });
        let scheduler = PrefetchScheduler::new(warmer.clone(), PrefetchConfig::default());
        scheduler.start();
        scheduler.enqueue(["aaaaaaaaaaa"]).await;
        scheduler.wait_idle().await;
        scheduler.shutdown().await;

        assert_eq!(warmer.calls.load(Ordering::SeqCst), 1);
        let status = scheduler.status().await;
        assert!(status.cached_ids.is_empty());
        assert_eq!((status.queued, status.active), (0, 0));

        // A failed id may be queued again.
        assert_eq!(scheduler.enqueue(["aaaaaaaaaaa"]).await, 1);
    }

    /// Records whether the scheduler state was free while checking the disk.
    #[derive(Default)]
    struct LockAwareWarmer {
        state: std::sync::OnceLock<Arc<RwLock<PrefetchState>>>,
        unlocked_checks: AtomicUsize,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl TrackWarmer for LockAwareWarmer {
        fn is_cached(&self, _id: &TrackId) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.state.get().unwrap().try_write().is_ok() {
                self.unlocked_checks.fetch_add(1, Ordering::SeqCst);
            }
            false
        }

        async fn warm(&self, id: &TrackId) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("/cache/{id}.webm")))
        }
    }

    #[tokio::test]
    async fn test_cache_checks_run_outside_the_state_lock() {
        let warmer = Arc::new(LockAwareWarmer::default());
        let scheduler = PrefetchScheduler::new(warmer.clone(), PrefetchConfig::default());
        warmer.state.set(Arc::clone(&scheduler.state)).unwrap();

        let accepted = scheduler.enqueue(["aaaaaaaaaaa", "bbbbbbbbbbb"]).await;

        assert_eq!(accepted, 2);
        assert_eq!(warmer.checks.load(Ordering::SeqCst), 2);
        assert_eq!(warmer.unlocked_checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_and_invalid_ids_are_skipped() {
        let mut warmer = MockTrackWarmer::new();
        warmer
            .expect_is_cached()
            .returning(|id| id.as_str() == "aaaaaaaaaaa");
        warmer.expect_warm().times(0).returning(|id| {
            Err(Error::invalid_identifier(id))
        });
        let scheduler = PrefetchScheduler::new(Arc::new(warmer), PrefetchConfig::default());

        let accepted = scheduler.enqueue(["aaaaaaaaaaa", "bad", "bbbbbbbbbbb"]).await;
        assert_eq!(accepted, 1);
        assert_eq!(scheduler.status().await.queued, 1);
    }

    #[test]
    fn test_config_validate_clamps() {
        let mut config = PrefetchConfig::default().with_max_concurrent(0);
        config.validate();
        assert_eq!(config.max_concurrent, MIN_CONCURRENT_PREFETCHES);

        let mut config = PrefetchConfig::default().with_max_concurrent(100);
        config.validate();
        assert_eq!(config.max_concurrent, MAX_CONCURRENT_PREFETCHES);
    }
}
