//! Persistent, expiry-aware store of resolved format lists.
//!
//! Backed by a single `SQLite` table with one row per track. A lookup that
//! observes an expired row deletes it in the same transaction, so an expired
//! entry is never returned and never lingers after being seen.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::format::{AudioFormat, ResolvedStream, unix_now};
use crate::identifier::TrackId;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stream_metadata (
    video_id TEXT PRIMARY KEY,
    formats_json TEXT NOT NULL,
    cached_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    title TEXT,
    duration_sec REAL
);
CREATE INDEX IF NOT EXISTS idx_stream_metadata_expires
    ON stream_metadata (expires_at);
CREATE INDEX IF NOT EXISTS idx_stream_metadata_cached
    ON stream_metadata (cached_at DESC);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCacheEntry {
    /// Track the row belongs to.
    pub id: TrackId,
    /// Ranked formats, best first.
    pub formats: Vec<AudioFormat>,
    /// Unix time the row was written.
    pub cached_at: u64,
    /// Unix time from which the row is no longer served.
    pub expires_at: u64,
    /// Track title.
    pub title: Option<String>,
    /// Track duration in seconds.
    pub duration_sec: Option<f64>,
}

impl MetadataCacheEntry {
    /// Convert into the resolver's stream type.
    #[must_use]
    pub fn into_stream(self) -> ResolvedStream {
        ResolvedStream {
            formats: self.formats,
            expires_at: self.expires_at,
            title: self.title,
            duration_sec: self.duration_sec,
        }
    }
}

struct RawRow {
    formats_json: String,
    cached_at: i64,
    expires_at: i64,
    title: Option<String>,
    duration_sec: Option<f64>,
}

/// `SQLite`-backed metadata cache.
#[derive(Debug)]
pub struct MetadataCache {
    conn: Mutex<Connection>,
}

impl MetadataCache {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::InitializationFailed {
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }

        let conn = Connection::open(path)?;
        // `journal_mode` returns the resulting mode as a row.
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Metadata cache journal mode: {}", mode);

        let cache = Self::init(conn)?;
        info!("Opened metadata cache at {}", path.display());
        Ok(cache)
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::LockPoisoned.into())
    }

    /// Fresh stream for `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get(&self, id: &TrackId) -> Result<Option<ResolvedStream>> {
        Ok(self.entry(id)?.map(MetadataCacheEntry::into_stream))
    }

    /// Fresh row for `id`, if any.
    ///
    /// Expired and undecodable rows are deleted as part of the lookup.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn entry(&self, id: &TrackId) -> Result<Option<MetadataCacheEntry>> {
        self.entry_at(id, unix_now())
    }

    pub(crate) fn entry_at(&self, id: &TrackId, now: u64) -> Result<Option<MetadataCacheEntry>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw = tx
            .query_row(
                "SELECT formats_json, cached_at, expires_at, title, duration_sec
                 FROM stream_metadata WHERE video_id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(RawRow {
                        formats_json: row.get(0)?,
                        cached_at: row.get(1)?,
                        expires_at: row.get(2)?,
                        title: row.get(3)?,
                        duration_sec: row.get(4)?,
                    })
                },
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let expires_at = to_unix(raw.expires_at);
        if now >= expires_at {
            tx.execute(
                "DELETE FROM stream_metadata WHERE video_id = ?1",
                params![id.as_str()],
            )?;
            tx.commit()?;
            debug!("Metadata for {} expired, deleted", id);
            return Ok(None);
        }

        let formats: Vec<AudioFormat> = match serde_json::from_str(&raw.formats_json) {
            Ok(formats) => formats,
            Err(e) => {
                warn!("Discarding undecodable metadata for {}: {}", id, e);
                tx.execute(
                    "DELETE FROM stream_metadata WHERE video_id = ?1",
                    params![id.as_str()],
                )?;
                tx.commit()?;
                return Ok(None);
            }
        };
        tx.commit()?;

        Ok(Some(MetadataCacheEntry {
            id: id.clone(),
            formats,
            cached_at: to_unix(raw.cached_at),
            expires_at,
            title: raw.title,
            duration_sec: raw.duration_sec,
        }))
    }

    /// Upsert the stream for `id`.
    ///
    /// The stored expiry is the earlier of the stream's own expiry and
    /// `now + max_ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error on database or serialization failure.
    pub fn put(&self, id: &TrackId, stream: &ResolvedStream, max_ttl: Duration) -> Result<()> {
        self.put_at(id, stream, max_ttl, unix_now())
    }

    pub(crate) fn put_at(
        &self,
        id: &TrackId,
        stream: &ResolvedStream,
        max_ttl: Duration,
        now: u64,
    ) -> Result<()> {
        let formats_json = serde_json::to_string(&stream.formats)?;
        let expires_at = stream
            .expires_at
            .min(now.saturating_add(max_ttl.as_secs()));

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO stream_metadata
                (video_id, formats_json, cached_at, expires_at, title, duration_sec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(video_id) DO UPDATE SET
                formats_json = excluded.formats_json,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at,
                title = excluded.title,
                duration_sec = excluded.duration_sec",
            params![
                id.as_str(),
                formats_json,
                to_sql(now),
                to_sql(expires_at),
                stream.title,
                stream.duration_sec,
            ],
        )?;
        tx.commit()?;

        debug!("Cached metadata for {} until {}", id, expires_at);
        Ok(())
    }

    /// Delete the row for `id`. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn delete(&self, id: &TrackId) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM stream_metadata WHERE video_id = ?1",
            params![id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Delete every expired row. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(unix_now())
    }

    pub(crate) fn purge_expired_at(&self, now: u64) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM stream_metadata WHERE expires_at <= ?1",
            params![to_sql(now)],
        )?;
        if n > 0 {
            debug!("Purged {} expired metadata rows", n);
        }
        Ok(n)
    }

    /// Most recently cached rows, newest first. Expired rows are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn recent(&self, limit: usize) -> Result<Vec<MetadataCacheEntry>> {
        let now = unix_now();
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT video_id, formats_json, cached_at, expires_at, title, duration_sec
             FROM stream_metadata
             WHERE expires_at > ?1
             ORDER BY cached_at DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![to_sql(now), limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RawRow {
                    formats_json: row.get(1)?,
                    cached_at: row.get(2)?,
                    expires_at: row.get(3)?,
                    title: row.get(4)?,
                    duration_sec: row.get(5)?,
                },
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (video_id, raw) = row?;
            let (Ok(id), Ok(formats)) = (
                TrackId::parse(&video_id),
                serde_json::from_str::<Vec<AudioFormat>>(&raw.formats_json),
            ) else {
                continue;
            };
            entries.push(MetadataCacheEntry {
                id,
                formats,
                cached_at: to_unix(raw.cached_at),
                expires_at: to_unix(raw.expires_at),
                title: raw.title,
                duration_sec: raw.duration_sec,
            });
        }
        Ok(entries)
    }

    /// Number of stored rows, expired ones included.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM stream_metadata", [], |row| {
            row.get(0)
        })?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Whether the store holds no rows.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM stream_metadata", [])?;
        info!("Cleared {} metadata rows", n);
        Ok(n)
    }
}

fn to_sql(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn to_unix(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(raw: &str) -> TrackId {
        TrackId::parse(raw).unwrap()
    }

    fn stream(expires_at: u64) -> ResolvedStream {
        ResolvedStream {
            formats: vec![AudioFormat::from_mime(
                "audio/webm; codecs=\"opus\"",
                None,
                160_000,
                Some("https://cdn.example/a".to_string()),
            )],
            expires_at,
            title: Some("Song".to_string()),
            duration_sec: Some(212.5),
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn test_put_then_get() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let key = id("abc12345678");
        cache.put_at(&key, &stream(5_000), DAY, 1_000).unwrap();

        let entry = cache.entry_at(&key, 1_500).unwrap().unwrap();
        assert_eq!(entry.expires_at, 5_000);
        assert_eq!(entry.cached_at, 1_000);
        assert_eq!(entry.title.as_deref(), Some("Song"));
        assert_eq!(entry.duration_sec, Some(212.5));
        assert_eq!(entry.formats.len(), 1);
    }

    #[test]
    fn test_expired_row_is_deleted_on_read() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let key = id("abc12345678");
        cache.put_at(&key, &stream(5_000), DAY, 1_000).unwrap();

        assert!(cache.entry_at(&key, 5_000).unwrap().is_none());
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_get_never_returns_expired() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let key = id("abc12345678");
        for now in [1_000, 4_999, 5_000, 9_000] {
            cache.put_at(&key, &stream(5_000), DAY, 0).unwrap();
            if let Some(entry) = cache.entry_at(&key, now).unwrap() {
                assert!(now < entry.expires_at);
            }
        }
    }

    #[test]
    fn test_max_ttl_caps_expiry() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let key = id("abc12345678");
        cache
            .put_at(&key, &stream(1_000_000), HOUR, 1_000)
            .unwrap();
        let entry = cache.entry_at(&key, 1_001).unwrap().unwrap();
        assert_eq!(entry.expires_at, 1_000 + 3600);
    }

    #[test]
    fn test_upsert_replaces_row() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let key = id("abc12345678");
        cache.put_at(&key, &stream(5_000), DAY, 1_000).unwrap();

        let mut newer = stream(9_000);
        newer.title = Some("Renamed".to_string());
        cache.put_at(&key, &newer, DAY, 2_000).unwrap();

        assert_eq!(cache.len().unwrap(), 1);
        let entry = cache.entry_at(&key, 2_001).unwrap().unwrap();
        assert_eq!(entry.title.as_deref(), Some("Renamed"));
        assert_eq!(entry.expires_at, 9_000);
    }

    #[test]
    fn test_delete() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let key = id("abc12345678");
        cache.put_at(&key, &stream(5_000), DAY, 1_000).unwrap();
        assert!(cache.delete(&key).unwrap());
        assert!(!cache.delete(&key).unwrap());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_purge_expired() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache
            .put_at(&id("aaaaaaaaaaa"), &stream(2_000), DAY, 1_000)
            .unwrap();
        cache
            .put_at(&id("bbbbbbbbbbb"), &stream(9_000), DAY, 1_000)
            .unwrap();

        assert_eq!(cache.purge_expired_at(3_000).unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_undecodable_row_is_a_miss() {
        let cache = MetadataCache::open_in_memory().unwrap();
        {
            let conn = cache.lock().unwrap();
            conn.execute(
                "INSERT INTO stream_metadata (video_id, formats_json, cached_at, expires_at)
                 VALUES ('abc12345678', 'not json', 1, 99999999999)",
                [],
            )
            .unwrap();
        }
        assert!(cache.get(&id("abc12345678")).unwrap().is_none());
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_recent_orders_newest_first() {
        let cache = MetadataCache::open_in_memory().unwrap();
        let far = unix_now() + 86_400;
        let now = unix_now();
        cache
            .put_at(&id("aaaaaaaaaaa"), &stream(far), DAY, now - 20)
            .unwrap();
        cache
            .put_at(&id("bbbbbbbbbbb"), &stream(far), DAY, now - 10)
            .unwrap();

        let recent = cache.recent(10).unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["bbbbbbbbbbb", "aaaaaaaaaaa"]);
        assert_eq!(cache.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("meta").join("streams.db");
        let key = id("abc12345678");
        let far = unix_now() + 86_400;
        {
            let cache = MetadataCache::open(&path).unwrap();
            cache.put(&key, &stream(far), DAY).unwrap();
        }
        let cache = MetadataCache::open(&path).unwrap();
        assert!(cache.get(&key).unwrap().is_some());
        assert_eq!(cache.clear().unwrap(), 1);
    }
}
