//! Metadata cache, byte cache and janitor working against a real directory.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use tempfile::TempDir;
use ytstream_core::{
    AudioFormat, ByteCache, ByteCacheConfig, CoreConfig, JanitorConfig, MetadataCache,
    ProviderChain, ResolvedStream, StreamCacheManager, TrackId,
};

const DAY: i64 = 86_400;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn id(raw: &str) -> TrackId {
    TrackId::parse(raw).unwrap()
}

fn stream(url: &str, expires_at: u64) -> ResolvedStream {
    ResolvedStream {
        formats: vec![AudioFormat::from_mime(
            "audio/mp4; codecs=\"mp4a.40.2\"",
            None,
            128_000,
            Some(url.to_string()),
        )],
        expires_at,
        title: Some("Title".to_string()),
        duration_sec: Some(180.5),
    }
}

fn age(path: &std::path::Path, days: i64) {
    let when = FileTime::from_unix_time(FileTime::now().unix_seconds() - days * DAY, 0);
    filetime::set_file_times(path, when, when).unwrap();
}

#[test]
fn test_metadata_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("metadata.db");
    let track = id("abc12345678");

    {
        let cache = MetadataCache::open(&db).unwrap();
        cache
            .put(
                &track,
                &stream("https://cdn.example/a", now() + 3600),
                Duration::from_secs(6 * 3600),
            )
            .unwrap();
    }

    let cache = MetadataCache::open(&db).unwrap();
    let restored = cache.get(&track).unwrap().unwrap();
    assert_eq!(restored.title.as_deref(), Some("Title"));
    assert_eq!(restored.duration_sec, Some(180.5));
    assert_eq!(restored.formats[0].codec, "mp4a");
}

#[test]
fn test_expired_rows_are_never_returned_and_are_deleted() {
    let temp = TempDir::new().unwrap();
    let cache = MetadataCache::open(&temp.path().join("metadata.db")).unwrap();
    let track = id("abc12345678");

    cache
        .put(
            &track,
            &stream("https://cdn.example/a", now().saturating_sub(1)),
            Duration::from_secs(3600),
        )
        .unwrap();
    assert_eq!(cache.len().unwrap(), 1);

    assert!(cache.get(&track).unwrap().is_none());
    assert_eq!(cache.len().unwrap(), 0);
}

#[test]
fn test_ttl_cap_bounds_expiry() {
    let temp = TempDir::new().unwrap();
    let cache = MetadataCache::open(&temp.path().join("metadata.db")).unwrap();
    let track = id("abc12345678");

    let before = now();
    cache
        .put(
            &track,
            &stream("https://cdn.example/a", before + 100_000),
            Duration::from_secs(60),
        )
        .unwrap();
    let entry = cache.entry(&track).unwrap().unwrap();
    assert!(entry.expires_at <= now() + 60);
    assert!(entry.expires_at >= before + 60);
}

#[test]
fn test_concurrent_upserts_keep_one_row() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(MetadataCache::open(&temp.path().join("metadata.db")).unwrap());
    let track = id("abc12345678");
    let expires = now() + 3600;

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let cache = Arc::clone(&cache);
            let track = track.clone();
            std::thread::spawn(move || {
                let url = format!("https://cdn.example/{n}");
                cache
                    .put(&track, &stream(&url, expires), Duration::from_secs(3600))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len().unwrap(), 1);
    let url = cache.get(&track).unwrap().unwrap().formats[0]
        .url
        .clone()
        .unwrap();
    assert!(url.starts_with("https://cdn.example/"));
}

#[test]
fn test_pending_write_is_invisible_until_commit() {
    let temp = TempDir::new().unwrap();
    let cache = ByteCache::new(
        temp.path(),
        ByteCacheConfig::default().with_min_valid_bytes(8),
    )
    .unwrap();
    let track = id("abc12345678");

    let mut pending = cache.begin_write(&track, "webm").unwrap();
    pending.append(b"0123").unwrap();
    assert!(!cache.has(&track));
    assert!(!pending.target().exists());

    pending.append(b"4567").unwrap();
    let path = pending.commit().unwrap();
    assert!(cache.has(&track));
    assert_eq!(std::fs::read(path).unwrap(), b"01234567");
}

#[test]
fn test_short_payload_is_a_cache_miss() {
    let temp = TempDir::new().unwrap();
    let cache = ByteCache::new(temp.path(), ByteCacheConfig::default()).unwrap();
    let track = id("abc12345678");

    let err = cache.write(&track, &[1, 2, 3], "webm").unwrap_err();
    assert!(err.is_partial_download());
    assert!(!cache.has(&track));
    assert!(cache.entries().is_empty());
}

#[test]
fn test_codec_variants_coexist() {
    let temp = TempDir::new().unwrap();
    let cache = ByteCache::new(
        temp.path(),
        ByteCacheConfig::default().with_min_valid_bytes(1),
    )
    .unwrap();
    let track = id("abc12345678");

    let old = cache.write(&track, b"m4a-bytes", "m4a").unwrap();
    age(&old, 2);
    let new = cache.write(&track, b"webm-bytes", "webm").unwrap();

    assert_eq!(cache.variants(&track).len(), 2);
    assert_eq!(cache.path(&track), Some(new));
    assert_eq!(cache.remove(&track).unwrap(), 2);
    assert!(!cache.has(&track));
}

#[test]
fn test_stale_payload_is_not_served() {
    let temp = TempDir::new().unwrap();
    let cache = ByteCache::new(
        temp.path(),
        ByteCacheConfig::default()
            .with_min_valid_bytes(1)
            .with_freshness(Duration::from_secs(7 * 86_400)),
    )
    .unwrap();
    let track = id("abc12345678");
    let path = cache.write(&track, b"bytes", "webm").unwrap();
    age(&path, 10);

    assert!(path.exists());
    assert!(!cache.has(&track));
    assert_eq!(cache.touch(&track).unwrap(), None);
}

#[tokio::test]
async fn test_sweep_honors_latest_protected_set() {
    let temp = TempDir::new().unwrap();
    let config = CoreConfig::default()
        .with_cache_dir(temp.path())
        .with_byte_cache(ByteCacheConfig::default().with_min_valid_bytes(1))
        .with_janitor(JanitorConfig::default().with_max_age(Duration::from_secs(20 * 86_400)));
    let manager = StreamCacheManager::with_chain(config, ProviderChain::default()).unwrap();

    let x = manager
        .byte_cache()
        .write(&id("xxxxxxxxxxx"), b"protected", "webm")
        .unwrap();
    let y = manager
        .byte_cache()
        .write(&id("yyyyyyyyyyy"), b"unprotected", "webm")
        .unwrap();
    age(&x, 40);
    age(&y, 25);

    // An earlier set is replaced wholesale, not merged.
    manager.update_protected_song_ids(["yyyyyyyyyyy"]);
    manager.update_protected_song_ids(["xxxxxxxxxxx"]);

    let stats = manager.sweep_now().await;
    assert!(x.exists());
    assert!(!y.exists());
    assert_eq!(stats.aged_files, 1);

    for _ in 0..3 {
        manager.sweep_now().await;
    }
    assert!(x.exists());
}

#[tokio::test]
async fn test_sweep_stays_within_budget() {
    let temp = TempDir::new().unwrap();
    let config = CoreConfig::default()
        .with_cache_dir(temp.path())
        .with_byte_cache(ByteCacheConfig::default().with_min_valid_bytes(1))
        .with_janitor(JanitorConfig::default().with_max_bytes(1_000));
    let manager = StreamCacheManager::with_chain(config, ProviderChain::default()).unwrap();

    for (n, raw) in ["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc", "ddddddddddd"]
        .iter()
        .enumerate()
    {
        let path = manager
            .byte_cache()
            .write(&id(raw), &vec![7u8; 400], "webm")
            .unwrap();
        age(&path, 4 - n as i64);
    }
    manager.update_protected_song_ids(["aaaaaaaaaaa"]);

    let stats = manager.sweep_now().await;
    assert!(stats.remaining_unprotected_bytes <= 1_000);
    assert!(manager.byte_cache().has(&id("aaaaaaaaaaa")));
    // Oldest unprotected goes first.
    assert!(!manager.byte_cache().has(&id("bbbbbbbbbbb")));
    assert!(manager.byte_cache().has(&id("ddddddddddd")));
}
