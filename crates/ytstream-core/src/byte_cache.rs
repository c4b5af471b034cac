//! Disk-resident store of downloaded audio payloads.
//!
//! Payloads live at `<cache_dir>/audio/<id>.<ext>`. Writes are staged in
//! `<cache_dir>/audio/.partial/` and moved into place with an atomic rename,
//! so a reader never observes a truncated file. Several codec variants of
//! the same track may coexist.
//!
//! A file is *valid* when it exists, is at least `min_valid_bytes` long, and
//! was modified or accessed within the freshness window. Validity is
//! independent of the metadata cache: raw bytes outlive signed URLs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::format::unix_now;
use crate::identifier::TrackId;

/// Subdirectory of the cache root holding audio payloads.
pub const AUDIO_DIR: &str = "audio";

/// Staging subdirectory inside [`AUDIO_DIR`].
pub const PARTIAL_DIR: &str = ".partial";

/// Default minimum size for a payload to count as complete (64 KiB).
pub const DEFAULT_MIN_VALID_BYTES: u64 = 64 * 1024;

/// Default freshness window (30 days).
pub const DEFAULT_FRESHNESS_SECS: u64 = 30 * 24 * 60 * 60;

/// Byte cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCacheConfig {
    /// Payloads smaller than this are treated as partial and discarded.
    #[serde(default = "default_min_valid_bytes")]
    pub min_valid_bytes: u64,

    /// A file unused for longer than this is no longer served.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

const fn default_min_valid_bytes() -> u64 {
    DEFAULT_MIN_VALID_BYTES
}

const fn default_freshness_secs() -> u64 {
    DEFAULT_FRESHNESS_SECS
}

impl Default for ByteCacheConfig {
    fn default() -> Self {
        Self {
            min_valid_bytes: DEFAULT_MIN_VALID_BYTES,
            freshness_secs: DEFAULT_FRESHNESS_SECS,
        }
    }
}

impl ByteCacheConfig {
    /// Set the minimum valid payload size.
    #[must_use]
    pub const fn with_min_valid_bytes(mut self, bytes: u64) -> Self {
        self.min_valid_bytes = bytes;
        self
    }

    /// Set the freshness window.
    #[must_use]
    pub const fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness_secs = freshness.as_secs();
        self
    }
}

/// A payload file as seen on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteCacheFile {
    /// Track the file belongs to.
    pub id: TrackId,
    /// File extension (codec container).
    pub extension: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Last access, unix seconds.
    pub last_access: u64,
    /// Last modification, unix seconds.
    pub last_modified: u64,
}

impl ByteCacheFile {
    /// The later of access and modification time.
    #[must_use]
    pub fn last_used(&self) -> u64 {
        self.last_access.max(self.last_modified)
    }

    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (stem, extension) = name.split_once('.')?;
        let id = TrackId::parse(stem).ok()?;
        // Anything not in canonical form was not written by us.
        if id.as_str() != stem {
            return None;
        }
        let meta = fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(Self {
            id,
            extension: extension.to_string(),
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            last_access: unix_secs(FileTime::from_last_access_time(&meta)),
            last_modified: unix_secs(FileTime::from_last_modification_time(&meta)),
        })
    }
}

fn unix_secs(time: FileTime) -> u64 {
    u64::try_from(time.unix_seconds()).unwrap_or(0)
}

/// Disk byte cache.
#[derive(Debug)]
pub struct ByteCache {
    audio_dir: PathBuf,
    partial_dir: PathBuf,
    config: ByteCacheConfig,
}

impl ByteCache {
    /// Open the cache rooted at `cache_dir`, creating directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(cache_dir: &Path, config: ByteCacheConfig) -> Result<Self> {
        let audio_dir = cache_dir.join(AUDIO_DIR);
        let partial_dir = audio_dir.join(PARTIAL_DIR);
        fs::create_dir_all(&partial_dir).map_err(|e| CacheError::InitializationFailed {
            reason: format!("cannot create {}: {e}", partial_dir.display()),
        })?;

        debug!("Byte cache directory: {}", audio_dir.display());
        Ok(Self {
            audio_dir,
            partial_dir,
            config,
        })
    }

    /// Directory holding payloads.
    #[must_use]
    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ByteCacheConfig {
        &self.config
    }

    /// Whether `file` is currently valid.
    #[must_use]
    pub fn is_valid(&self, file: &ByteCacheFile, now: u64) -> bool {
        file.size_bytes >= self.config.min_valid_bytes
            && now.saturating_sub(file.last_used()) <= self.config.freshness_secs
    }

    /// All variants on disk for `id`, valid or not.
    #[must_use]
    pub fn variants(&self, id: &TrackId) -> Vec<ByteCacheFile> {
        let prefix = format!("{id}.");
        // Match on the name first so only this id's files are stat'ed.
        self.files()
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .filter_map(|e| ByteCacheFile::from_path(e.path()))
            .collect()
    }

    /// Whether a valid payload exists for `id`.
    #[must_use]
    pub fn has(&self, id: &TrackId) -> bool {
        self.path(id).is_some()
    }

    /// Path of the freshest valid variant for `id`.
    #[must_use]
    pub fn path(&self, id: &TrackId) -> Option<PathBuf> {
        let now = unix_now();
        self.variants(id)
            .into_iter()
            .filter(|f| self.is_valid(f, now))
            .max_by_key(|f| (f.last_used(), f.size_bytes))
            .map(|f| f.path)
    }

    /// Mark the valid payload for `id` as just accessed.
    ///
    /// Returns the touched path, or `None` if nothing valid is cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the access time cannot be updated.
    pub fn touch(&self, id: &TrackId) -> Result<Option<PathBuf>> {
        let Some(path) = self.path(id) else {
            return Ok(None);
        };
        filetime::set_file_atime(&path, FileTime::now())?;
        Ok(Some(path))
    }

    /// Start a streaming write for `id` with extension `ext`.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging file cannot be created.
    pub fn begin_write(&self, id: &TrackId, ext: &str) -> Result<PendingWrite> {
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{id}."))
            .suffix(".part")
            .tempfile_in(&self.partial_dir)
            .map_err(|e| CacheError::WriteFailed {
                path: self.partial_dir.clone(),
                reason: e.to_string(),
            })?;

        Ok(PendingWrite {
            id: id.clone(),
            target: self.audio_dir.join(format!("{id}.{ext}")),
            tmp,
            written: 0,
            min_valid_bytes: self.config.min_valid_bytes,
        })
    }

    /// Store `bytes` for `id` in one call.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::PartialDownload`] if `bytes` is below the size
    /// threshold, or a write error.
    pub fn write(&self, id: &TrackId, bytes: &[u8], ext: &str) -> Result<PathBuf> {
        let mut pending = self.begin_write(id, ext)?;
        pending.append(bytes)?;
        pending.commit()
    }

    /// Delete every variant for `id`. Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn remove(&self, id: &TrackId) -> Result<usize> {
        let mut removed = 0;
        for file in self.variants(id) {
            fs::remove_file(&file.path)?;
            removed += 1;
        }
        if removed > 0 {
            info!("Removed {} cached payload(s) for {}", removed, id);
        }
        Ok(removed)
    }

    /// Every payload file on disk.
    #[must_use]
    pub fn entries(&self) -> Vec<ByteCacheFile> {
        self.files()
            .filter_map(|e| ByteCacheFile::from_path(e.path()))
            .collect()
    }

    fn files(&self) -> impl Iterator<Item = walkdir::DirEntry> {
        WalkDir::new(&self.audio_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
    }

    /// Total bytes held by payload files.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries().iter().map(|f| f.size_bytes).sum()
    }

    /// Delete staging files older than `max_age`. Returns `(files, bytes)`.
    #[must_use]
    pub fn clear_partials(&self, max_age: Duration) -> (usize, u64) {
        let now = unix_now();
        let mut files = 0;
        let mut bytes = 0;

        for entry in WalkDir::new(&self.partial_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = unix_secs(FileTime::from_last_modification_time(&meta));
            if now.saturating_sub(modified) < max_age.as_secs() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    files += 1;
                    bytes += meta.len();
                }
                Err(e) => warn!(
                    "Failed to remove staging file {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }

        if files > 0 {
            debug!("Removed {} orphaned staging files ({} bytes)", files, bytes);
        }
        (files, bytes)
    }
}

/// A payload being streamed into the cache.
///
/// Nothing is visible under the final name until [`commit`](Self::commit)
/// succeeds. Dropping the value discards the staged bytes.
#[derive(Debug)]
pub struct PendingWrite {
    id: TrackId,
    target: PathBuf,
    tmp: NamedTempFile,
    written: u64,
    min_valid_bytes: u64,
}

impl PendingWrite {
    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging file cannot be written.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.tmp
            .write_all(chunk)
            .map_err(|e| CacheError::WriteFailed {
                path: self.tmp.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes appended so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Final path the payload will be moved to.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flush and move the payload into place.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::PartialDownload`] when fewer than the minimum
    /// bytes were written (the staged file is discarded), or a write error.
    pub fn commit(mut self) -> Result<PathBuf> {
        if self.written < self.min_valid_bytes {
            return Err(CacheError::PartialDownload {
                video_id: self.id.to_string(),
                bytes: self.written,
                minimum: self.min_valid_bytes,
            }
            .into());
        }

        self.tmp
            .as_file_mut()
            .sync_all()
            .map_err(|e| CacheError::WriteFailed {
                path: self.tmp.path().to_path_buf(),
                reason: e.to_string(),
            })?;

        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| CacheError::WriteFailed {
                path: target.clone(),
                reason: e.error.to_string(),
            })?;

        debug!("Stored {} bytes at {}", self.written, target.display());
        Ok(target)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    const DAY: i64 = 86_400;

    fn id(raw: &str) -> TrackId {
        TrackId::parse(raw).unwrap()
    }

    fn create_cache(temp_dir: &TempDir) -> ByteCache {
        let config = ByteCacheConfig::default().with_min_valid_bytes(16);
        ByteCache::new(temp_dir.path(), config).unwrap()
    }

    fn age(path: &Path, days: i64) {
        let when = FileTime::from_unix_time(FileTime::now().unix_seconds() - days * DAY, 0);
        filetime::set_file_times(path, when, when).unwrap();
    }

    #[test]
    fn test_write_and_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        assert!(!cache.has(&key));
        let path = cache.write(&key, &[7u8; 64], "webm").unwrap();

        assert!(cache.has(&key));
        assert_eq!(cache.path(&key).unwrap(), path);
        assert_eq!(path.file_name().unwrap(), "abc12345678.webm");
        assert_eq!(cache.total_size(), 64);
    }

    #[test]
    fn test_partial_write_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        let err = cache.write(&key, &[1u8; 4], "webm").unwrap_err();
        assert!(matches!(
            err,
            Error::Cache(CacheError::PartialDownload {
                bytes: 4,
                minimum: 16,
                ..
            })
        ));
        assert!(!cache.has(&key));
        assert!(cache.entries().is_empty());
        assert_eq!(fs::read_dir(temp_dir.path().join("audio/.partial")).unwrap().count(), 0);
    }

    #[test]
    fn test_pending_write_invisible_until_commit() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        let mut pending = cache.begin_write(&key, "m4a").unwrap();
        pending.append(&[0u8; 10]).unwrap();
        pending.append(&[0u8; 10]).unwrap();
        assert_eq!(pending.written(), 20);
        assert!(!pending.target().exists());

        let path = pending.commit().unwrap();
        assert!(path.exists());
        assert!(cache.has(&key));
    }

    #[test]
    fn test_dropped_pending_write_discards() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        {
            let mut pending = cache.begin_write(&key, "webm").unwrap();
            pending.append(&[0u8; 32]).unwrap();
        }
        assert!(!cache.has(&key));
        assert_eq!(fs::read_dir(temp_dir.path().join("audio/.partial")).unwrap().count(), 0);
    }

    #[test]
    fn test_stale_file_is_not_valid() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        let path = cache.write(&key, &[0u8; 32], "webm").unwrap();
        age(&path, 31);
        assert!(!cache.has(&key));
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn test_touch_refreshes_access_time() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        let path = cache.write(&key, &[0u8; 32], "webm").unwrap();
        age(&path, 10);
        let before = cache.entries()[0].last_access;

        assert_eq!(cache.touch(&key).unwrap(), Some(path));
        let after = cache.entries()[0].last_access;
        assert!(after > before);
    }

    #[test]
    fn test_touch_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        assert!(cache.touch(&id("abc12345678")).unwrap().is_none());
    }

    #[test]
    fn test_variants_coexist_and_freshest_wins() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");

        let old = cache.write(&key, &[0u8; 32], "m4a").unwrap();
        age(&old, 5);
        let new = cache.write(&key, &[0u8; 32], "webm").unwrap();

        assert_eq!(cache.variants(&key).len(), 2);
        assert_eq!(cache.path(&key).unwrap(), new);

        assert_eq!(cache.remove(&key).unwrap(), 2);
        assert!(!cache.has(&key));
    }

    #[test]
    fn test_variants_only_return_files_of_that_id() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let key = id("abc12345678");
        cache.write(&key, &[1u8; 32], "webm").unwrap();
        for n in 0..40 {
            let other = id(&format!("zz{n:09}"));
            cache.write(&other, &[2u8; 32], "webm").unwrap();
        }
        fs::write(cache.audio_dir().join("abc12345678x.webm"), [3u8; 32]).unwrap();

        let variants = cache.variants(&key);
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].id, key);
        assert_eq!(variants[0].extension, "webm");
        assert_eq!(cache.entries().len(), 41);
    }

    #[test]
    fn test_entries_ignore_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        fs::write(cache.audio_dir().join("notes.txt"), b"hello").unwrap();
        fs::write(cache.audio_dir().join("yt:abc12345678.webm"), b"hello").unwrap();
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_clear_partials_respects_age() {
        let temp_dir = TempDir::new().unwrap();
        let cache = create_cache(&temp_dir);
        let partial_dir = temp_dir.path().join("audio/.partial");

        let old = partial_dir.join("aaaaaaaaaaa.x.part");
        let fresh = partial_dir.join("bbbbbbbbbbb.y.part");
        fs::write(&old, [0u8; 8]).unwrap();
        fs::write(&fresh, [0u8; 8]).unwrap();
        age(&old, 1);

        let (files, bytes) = cache.clear_partials(Duration::from_secs(3600));
        assert_eq!((files, bytes), (1, 8));
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
