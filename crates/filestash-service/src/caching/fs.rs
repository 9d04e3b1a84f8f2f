use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tokio::fs;

use crate::config::FileCacheConfig;

use super::{CacheEntry, CacheError, Codec, FileLocks, Manifest, ManifestEntry, NameMapper};

/// A persistent cache that stores every value in its own file.
///
/// The cache directory has the following layout:
///
/// - `manifest<ext>`: The index of all cached keys, see [`Manifest`].
/// - `<md5(key)><ext>`: One data file per cached key, see [`NameMapper`].
/// - `tmp/`: Scratch space for files that are being written. Files are fully written here and
///   then atomically moved into place. Stale leftovers are removed whenever the manifest is loaded.
///
/// A cache directory should only be owned by a single `FileCache` at a time. Every instance keeps
/// its own copy of the manifest, and the last one to [`save`](Self::save) wins.
///
/// The manifest is loaded lazily by the first operation. Changes to the manifest are only kept
/// in memory until [`save`](Self::save) or [`shutdown`](Self::shutdown) is called.
///
/// Every data file is only ever accessed while holding its lock from the [`FileLocks`] table,
/// so readers never see a partially written file.
#[derive(Debug)]
pub struct FileCache<C> {
    directory: PathBuf,
    tmp_dir: PathBuf,
    names: NameMapper,
    pub(super) manifest: Manifest,
    locks: FileLocks,
    pub(super) codec: C,
    is_shut_down: AtomicBool,
}

impl<C: Codec> FileCache<C> {
    pub fn new(config: &FileCacheConfig, codec: C) -> Self {
        let directory = config.directory.clone();
        Self {
            tmp_dir: tmp_dir(&directory),
            names: NameMapper::new(&config.extension),
            manifest: Manifest::new(&directory, &config.extension),
            locks: FileLocks::default(),
            codec,
            is_shut_down: AtomicBool::new(false),
            directory,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Returns the path of the data file that stores `key`.
    ///
    /// This is a pure function of the key and does not mean that the file exists.
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.directory.join(self.names.file_name(key))
    }

    /// Whether the manifest of this cache could be loaded.
    ///
    /// The outcome of the first load attempt is memoized and never re-checked.
    pub async fn is_available(&self) -> bool {
        self.manifest.ensure_loaded(&self.codec).await.is_ok()
    }

    /// Looks up `key` and reads its value from disk.
    ///
    /// Returns `Ok(None)` without touching the file system if the key is not in the manifest.
    pub async fn get<T>(&self, key: &str) -> Result<Option<CacheEntry<T>>, CacheError>
    where
        T: DeserializeOwned,
    {
        self.manifest.ensure_loaded(&self.codec).await?;
        metric!(counter("caches.access") += 1);

        let Some(entry) = self.manifest.get(key) else {
            metric!(counter("caches.file.miss") += 1);
            return Ok(None);
        };

        let path = self.directory.join(&entry.file_name);
        let lock = self.locks.get(&entry.file_name);
        let _guard = lock.read().await;

        // The key might have been evicted while we were waiting for the lock.
        let Some(entry) = self.manifest.get(key) else {
            tracing::trace!(key, "Cache entry evicted while waiting for read lock");
            metric!(counter("caches.file.miss") += 1);
            return Ok(None);
        };

        tracing::trace!("Loading cache file at path {}", path.display());
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            // The entry is registered before its first write completes.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::trace!("Cache file {} not written yet", path.display());
                metric!(counter("caches.file.miss") += 1);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let value = self
            .codec
            .decode(&bytes[..])
            .map_err(CacheError::serialization)?;

        metric!(counter("caches.file.hit") += 1);
        metric!(time_raw("caches.file.size") = bytes.len() as u64, "hit" => "true");

        Ok(Some(CacheEntry {
            value,
            cached_at: entry.cached_at,
            time_to_live: entry.time_to_live,
        }))
    }

    /// Stores `entry` under `key`, replacing any previous value.
    ///
    /// The file name of a key is fixed when it is first inserted into the manifest, subsequent
    /// calls only update `cached_at` and `time_to_live`. A value that fails to encode leaves the
    /// manifest untouched.
    pub async fn set<T>(&self, key: &str, entry: &CacheEntry<T>) -> Result<(), CacheError>
    where
        T: Serialize,
    {
        self.manifest.ensure_loaded(&self.codec).await?;

        let contents = encode(&self.codec, &entry.value)?;
        let size = contents.len() as u64;

        let ManifestEntry { file_name, .. } =
            self.manifest
                .upsert(key, entry.cached_at, entry.time_to_live, || {
                    self.names.file_name(key)
                });

        let path = self.directory.join(&file_name);
        let lock = self.locks.get(&file_name);
        let _guard = lock.write().await;

        tracing::trace!("Writing cache file at path {}", path.display());
        write_atomic(&self.tmp_dir, &path, contents).await?;

        metric!(counter("caches.file.write") += 1);
        metric!(time_raw("caches.file.size") = size, "hit" => "false");

        Ok(())
    }

    /// Removes `key` from the cache and deletes its data file.
    ///
    /// Returns `false` if the key was not cached.
    pub async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        self.manifest.ensure_loaded(&self.codec).await?;

        let Some(entry) = self.manifest.remove(key) else {
            return Ok(false);
        };

        metric!(counter("caches.file.evict") += 1);
        self.remove_data_file(&entry).await?;
        Ok(true)
    }

    /// Returns a snapshot of all the entries in the manifest, sorted by key.
    pub async fn entries(&self) -> Result<Vec<(String, ManifestEntry)>, CacheError> {
        self.manifest.ensure_loaded(&self.codec).await?;
        Ok(self.manifest.snapshot())
    }

    /// Persists the current manifest to disk.
    pub async fn save(&self) -> Result<(), CacheError> {
        self.manifest.save(&self.codec).await
    }

    /// Persists the manifest one last time.
    ///
    /// Only the first call does any work, later calls return `Ok(())` right away. Nothing is
    /// written if the manifest was never loaded.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.manifest.is_loaded() {
            return Ok(());
        }

        tracing::info!("Persisting cache manifest at {}", self.manifest.path().display());
        self.save().await.inspect_err(|e| {
            tracing::error!(
                error = e as &dyn std::error::Error,
                path = %self.manifest.path().display(),
                "Failed to persist cache manifest on shutdown",
            );
        })
    }

    /// Deletes the data file of a removed manifest entry under its write lock, and retires
    /// the lock afterwards.
    pub(super) async fn remove_data_file(&self, entry: &ManifestEntry) -> Result<(), CacheError> {
        let path = self.directory.join(&entry.file_name);
        let lock = self.locks.get(&entry.file_name);

        let result = {
            let _guard = lock.write().await;
            tracing::trace!("Removing cache file at path {}", path.display());
            match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(CacheError::io(&path, e)),
            }
        };

        self.locks.retire(&entry.file_name, &lock);
        result
    }
}

/// The scratch directory used for writing files inside of `directory`.
pub(super) fn tmp_dir(directory: &Path) -> PathBuf {
    directory.join("tmp")
}

/// Encodes `value` into a freshly allocated buffer.
pub(super) fn encode<C, T>(codec: &C, value: &T) -> Result<Vec<u8>, CacheError>
where
    C: Codec,
    T: Serialize + ?Sized,
{
    let mut contents = Vec::new();
    codec
        .encode(&mut contents, value)
        .map_err(CacheError::serialization)?;
    Ok(contents)
}

/// Replaces the file at `path` with `contents`.
///
/// The contents are written into a temporary file in `tmp_dir` first, which is then moved over
/// `path`. Other processes will either see the old or the new file, but never a partial one.
pub(super) async fn write_atomic(
    tmp_dir: &Path,
    path: &Path,
    contents: Vec<u8>,
) -> Result<(), CacheError> {
    let tmp_dir = tmp_dir.to_owned();
    let target = path.to_owned();
    tokio::task::spawn_blocking(move || persist_contents(&tmp_dir, &target, &contents))
        .await
        .map_err(|e| CacheError::io(path, io::Error::other(e)))?
}

fn persist_contents(tmp_dir: &Path, path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let mut temp_file = tempfile(tmp_dir).map_err(|e| CacheError::io(tmp_dir, e))?;
    temp_file
        .write_all(contents)
        .and_then(|_| temp_file.as_file().sync_data())
        .map_err(|e| CacheError::io(temp_file.path(), e))?;
    persist_tempfile(temp_file, path).map_err(|e| CacheError::io(path, e))
}

/// Create a new temporary file in `tmp_dir`.
fn tempfile(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    // Cleanup of a concurrently loading cache could remove the directory we are operating
    // in, so retry the fs operations a couple of times.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(tmp_dir) {
            tracing::error!("Failed to create cache tmp directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                tracing::error!("Failed to create temporary cache file: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                tracing::error!("Failed to persist cache file: {:?}", e.error);
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}

/// Files in the scratch directory that have not been touched for this long are leftovers of
/// a crashed writer.
pub(super) const STALE_TMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Removes leftovers of crashed writers from the scratch directory, creating it if needed.
///
/// Only entries last modified at least `max_age` ago are removed. Temporary files that another
/// instance is currently writing into the same directory are left alone.
pub(super) async fn clear_stale_tmp(tmp_dir: &Path, max_age: Duration) -> Result<(), CacheError> {
    fs::create_dir_all(tmp_dir)
        .await
        .map_err(|e| CacheError::io(tmp_dir, e))?;

    let mut entries = fs::read_dir(tmp_dir)
        .await
        .map_err(|e| CacheError::io(tmp_dir, e))?;
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io(tmp_dir, e))?
    {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // renamed into place in the meantime
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        // a modification time in the future counts as fresh
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&path, e)),
        }
    }

    if removed > 0 {
        tracing::debug!(
            "Removed {} stale files from cache tmp directory {}",
            removed,
            tmp_dir.display()
        );
    }
    Ok(())
}
