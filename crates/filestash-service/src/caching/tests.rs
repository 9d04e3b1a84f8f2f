use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use filestash_test as test;

use crate::config::FileCacheConfig;

use super::*;

const HOUR: Duration = Duration::from_secs(3600);

fn t0() -> DateTime<Utc> {
    "2024-03-01T12:00:00Z".parse().unwrap()
}

fn file_cache(directory: &Path) -> FileCache<JsonCodec> {
    let config = FileCacheConfig {
        directory: directory.to_path_buf(),
        extension: ".json".into(),
    };
    FileCache::new(&config, JsonCodec)
}

fn entry<T>(value: T, cached_at: DateTime<Utc>, time_to_live: Duration) -> CacheEntry<T> {
    CacheEntry {
        value,
        cached_at,
        time_to_live,
    }
}

#[tokio::test]
async fn test_set_get() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("a", &entry(42u32, t0(), HOUR)).await.unwrap();

    let cached = cache.get::<u32>("a").await.unwrap();
    assert_eq!(cached, Some(entry(42, t0(), HOUR)));

    let path = cache.file_path("a");
    assert_eq!(
        path,
        cache_dir.path().join("0cc175b9c0f1b6a831c399e269772661.json")
    );
    assert_eq!(fs::read_to_string(path).unwrap(), "42");

    assert_eq!(
        test::dir_entries(cache_dir.path()),
        [
            "0cc175b9c0f1b6a831c399e269772661.json",
            "manifest.json",
            "tmp"
        ]
    );
    assert!(test::dir_entries(cache_dir.path().join("tmp")).is_empty());
}

#[tokio::test]
async fn test_get_missing() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    assert_eq!(cache.get::<u32>("missing").await.unwrap(), None);
    assert!(cache.is_available().await);
}

#[tokio::test]
async fn test_set_overwrites() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("a", &entry("old", t0(), HOUR)).await.unwrap();
    let later = t0() + TimeDelta::minutes(10);
    cache.set("a", &entry("new", later, 2 * HOUR)).await.unwrap();

    let cached = cache.get::<String>("a").await.unwrap().unwrap();
    assert_eq!(cached, entry("new".to_owned(), later, 2 * HOUR));

    let entries = cache.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].1.file_name,
        "0cc175b9c0f1b6a831c399e269772661.json"
    );
}

#[tokio::test]
async fn test_evict() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("a", &entry(1u8, t0(), HOUR)).await.unwrap();
    let path = cache.file_path("a");
    assert!(path.exists());

    assert!(cache.evict("a").await.unwrap());
    assert_eq!(cache.get::<u8>("a").await.unwrap(), None);
    assert!(!path.exists());

    assert!(!cache.evict("a").await.unwrap());
}

#[tokio::test]
async fn test_evict_missing_file() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("a", &entry(1u8, t0(), HOUR)).await.unwrap();
    fs::remove_file(cache.file_path("a")).unwrap();

    assert!(cache.evict("a").await.unwrap());
    assert!(cache.manifest().is_empty());
}

/// Walks through the lifetime of a single entry, from being cached to being cleaned up.
#[tokio::test]
async fn test_cleanup_scenario() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("a", &entry(42u32, t0(), HOUR)).await.unwrap();
    assert_eq!(
        cache.get::<u32>("a").await.unwrap(),
        Some(entry(42, t0(), HOUR))
    );

    let stats = cache.cleanup_at(t0() + TimeDelta::minutes(30)).await.unwrap();
    assert_eq!((stats.removed, stats.retained), (0, 1));
    assert!(cache.get::<u32>("a").await.unwrap().is_some());

    let stats = cache.cleanup_at(t0() + TimeDelta::hours(2)).await.unwrap();
    assert_eq!((stats.removed, stats.retained), (1, 0));
    assert!(stats.is_success());
    assert_eq!(cache.get::<u32>("a").await.unwrap(), None);
    assert!(!cache.file_path("a").exists());
}

#[tokio::test]
async fn test_cleanup_only_removes_expired() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("expired", &entry(1u8, t0(), HOUR)).await.unwrap();
    cache.set("exactly", &entry(2u8, t0(), 2 * HOUR)).await.unwrap();
    cache.set("fresh", &entry(3u8, t0(), 3 * HOUR)).await.unwrap();
    cache.set("forever", &entry(4u8, t0(), Duration::MAX)).await.unwrap();

    let now = t0() + TimeDelta::hours(2);
    assert_eq!(cache.expired_keys_at(now).await.unwrap(), vec!["expired"]);

    let stats = cache.cleanup_at(now).await.unwrap();
    assert_eq!((stats.removed, stats.retained), (1, 3));

    let keys: Vec<_> = cache
        .entries()
        .await
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, vec!["exactly", "forever", "fresh"]);
    assert!(!cache.file_path("expired").exists());
    assert!(cache.file_path("fresh").exists());
}

#[tokio::test]
async fn test_cleanup_continues_after_failure() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("broken", &entry(1u8, t0(), HOUR)).await.unwrap();
    cache.set("expired", &entry(2u8, t0(), HOUR)).await.unwrap();

    // a directory in place of the data file can not be removed with `remove_file`
    let broken = cache.file_path("broken");
    fs::remove_file(&broken).unwrap();
    fs::create_dir(&broken).unwrap();

    let stats = cache.cleanup_at(t0() + TimeDelta::hours(2)).await.unwrap();
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.failures[0].0, "broken");
    assert!(matches!(stats.failures[0].1, CacheError::Io { .. }));

    assert!(cache.manifest().is_empty());
    assert!(!cache.file_path("expired").exists());
}

#[tokio::test]
async fn test_persistence() {
    test::setup();
    let cache_dir = test::tempdir();

    {
        let cache = file_cache(cache_dir.path());
        cache.set("kept", &entry(1u8, t0(), HOUR)).await.unwrap();
        cache.shutdown().await.unwrap();

        // changes after shutdown are only kept in memory
        cache.set("lost", &entry(2u8, t0(), HOUR)).await.unwrap();
        cache.shutdown().await.unwrap();
    }

    let cache = file_cache(cache_dir.path());
    assert_eq!(
        cache.get::<u8>("kept").await.unwrap(),
        Some(entry(1, t0(), HOUR))
    );
    assert_eq!(cache.get::<u8>("lost").await.unwrap(), None);
}

#[tokio::test]
async fn test_shutdown_without_load() {
    test::setup();
    let basedir = test::tempdir();
    let directory = basedir.path().join("never-used");

    let cache = file_cache(&directory);
    cache.shutdown().await.unwrap();

    assert!(!directory.exists());
}

#[tokio::test]
async fn test_unavailable_manifest() {
    test::setup();
    let cache_dir = test::tempdir();
    fs::write(cache_dir.path().join("manifest.json"), "[]").unwrap();

    let cache = file_cache(cache_dir.path());
    assert!(!cache.is_available().await);

    let error = cache.get::<u8>("a").await.unwrap_err();
    assert!(matches!(error, CacheError::ManifestUnavailable(_)));
    let error = cache.set("a", &entry(1u8, t0(), HOUR)).await.unwrap_err();
    assert!(matches!(error, CacheError::ManifestUnavailable(_)));
    assert!(cache.evict("a").await.is_err());
    assert!(cache.cleanup().await.is_err());

    // nothing to persist
    cache.shutdown().await.unwrap();
    assert_eq!(
        fs::read_to_string(cache_dir.path().join("manifest.json")).unwrap(),
        "[]"
    );
}

#[tokio::test]
async fn test_decode_failure_keeps_entry() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    cache.set("a", &entry("not a number", t0(), HOUR)).await.unwrap();

    let error = cache.get::<u32>("a").await.unwrap_err();
    assert!(matches!(error, CacheError::Serialization(_)));
    assert!(cache.manifest().contains_key("a"));
    assert_eq!(
        cache.get::<String>("a").await.unwrap().unwrap().value,
        "not a number"
    );
}

#[tokio::test]
async fn test_encode_failure_leaves_manifest() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = file_cache(cache_dir.path());

    // JSON objects need string keys
    let mut value = std::collections::HashMap::new();
    value.insert((1, 2), "tuple key");

    let error = cache.set("a", &entry(value, t0(), HOUR)).await.unwrap_err();
    assert!(matches!(error, CacheError::Serialization(_)));
    assert!(!cache.manifest().contains_key("a"));
    assert!(!cache.file_path("a").exists());
}

#[tokio::test]
async fn test_yaml_codec() {
    test::setup();
    let cache_dir = test::tempdir();
    let config = FileCacheConfig {
        directory: cache_dir.path().to_path_buf(),
        extension: ".yaml".into(),
    };
    let cache = FileCache::new(&config, YamlCodec);

    cache
        .set("a", &entry(vec!["x".to_owned(), "y".to_owned()], t0(), HOUR))
        .await
        .unwrap();
    cache.shutdown().await.unwrap();

    let cache = FileCache::new(&config, YamlCodec);
    let cached = cache.get::<Vec<String>>("a").await.unwrap().unwrap();
    assert_eq!(cached.value, ["x", "y"]);
    assert!(cache_dir.path().join("manifest.yaml").is_file());
}

/// Readers must always see a complete file, either the old or the new contents.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_and_writers() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = Arc::new(file_cache(cache_dir.path()));

    cache.set("hot", &entry(vec![0u32; 4096], t0(), HOUR)).await.unwrap();

    let mut tasks = Vec::new();
    for i in 1..=8u32 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                cache.set("hot", &entry(vec![i; 4096], t0(), HOUR)).await.unwrap();
            }
        }));
    }
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let cached = cache.get::<Vec<u32>>("hot").await.unwrap().unwrap();
                assert_eq!(cached.value.len(), 4096);
                assert!(cached.value.iter().all(|v| *v == cached.value[0]));
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_evict_and_get() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = Arc::new(file_cache(cache_dir.path()));

    for round in 0..20u32 {
        cache.set("flaky", &entry(round, t0(), HOUR)).await.unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get::<u32>("flaky").await })
        };
        let evicter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.evict("flaky").await })
        };

        // the reader either sees the value or nothing at all, but never an error
        let read = reader.await.unwrap().unwrap();
        assert!(read.is_none_or(|cached| cached.value == round));
        assert!(evicter.await.unwrap().unwrap());
    }
}

/// A "compute if missing" flow on top of [`FileCache`] and [`KeyLocks`].
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_population() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = Arc::new(file_cache(cache_dir.path()));
    let locks = KeyLocks::<CacheEntry<String>>::new();
    let computations = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let locks = locks.clone();
            let computations = Arc::clone(&computations);
            tokio::spawn(async move {
                if let Some(cached) = cache.get::<String>("report").await? {
                    return Ok(cached);
                }
                if !locks.acquire("report") {
                    return locks.wait("report").await;
                }
                // another producer might have finished in the meantime
                if let Some(cached) = cache.get::<String>("report").await? {
                    locks.release("report", Ok(cached.clone()));
                    return Ok(cached);
                }

                computations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                let fresh = entry("expensive".to_owned(), t0(), HOUR);
                let result = cache.set("report", &fresh).await.map(|_| fresh);
                locks.release("report", result.clone());
                result
            })
        })
        .collect();

    for task in tasks {
        let cached = task.await.unwrap().unwrap();
        assert_eq!(cached.value, "expensive");
    }
    assert_eq!(computations.load(std::sync::atomic::Ordering::SeqCst), 1);
}
