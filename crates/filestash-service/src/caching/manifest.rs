use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};

use super::entry::{expires_at, is_expired_at};
use super::fs::{STALE_TMP_AGE, clear_stale_tmp, encode, tmp_dir, write_atomic};
use super::{CacheError, Codec};

/// The metadata the manifest keeps for every cached key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The name of the data file inside the cache directory. Fixed for the lifetime of the entry.
    pub file_name: String,
    pub cached_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub time_to_live: Duration,
}

impl ManifestEntry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(self.cached_at, self.time_to_live)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired_at(self.cached_at, self.time_to_live, now)
    }
}

type Entries = HashMap<String, ManifestEntry>;

/// The durable index from cache keys to [`ManifestEntry`]s.
///
/// The manifest is held fully in memory and persisted as a single snapshot. It is loaded lazily
/// by [`ensure_loaded`](Self::ensure_loaded): concurrent callers share one load, and its outcome
/// (including a failure) is remembered forever. Once loaded, entry reads and writes only take a
/// short-lived lock on the in-memory map and never wait for manifest I/O.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    directory: PathBuf,
    tmp_dir: PathBuf,
    entries: RwLock<Entries>,
    state: OnceCell<Result<(), CacheError>>,
    save_lock: Mutex<()>,
}

impl Manifest {
    /// Creates an unloaded manifest stored at `<directory>/manifest<extension>`.
    pub fn new(directory: &Path, extension: &str) -> Self {
        Self {
            path: directory.join(format!("manifest{extension}")),
            directory: directory.to_owned(),
            tmp_dir: tmp_dir(directory),
            entries: Default::default(),
            state: OnceCell::new(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the manifest has been loaded successfully.
    pub fn is_loaded(&self) -> bool {
        matches!(self.state.get(), Some(Ok(())))
    }

    /// Loads the manifest from disk unless that already happened.
    ///
    /// If no manifest file exists, the cache directory is created and an empty manifest is
    /// written. Any failure is returned as [`CacheError::ManifestUnavailable`], both to this
    /// caller and to every later one.
    pub async fn ensure_loaded<C: Codec>(&self, codec: &C) -> Result<(), CacheError> {
        if let Some(state) = self.state.get() {
            return state.clone();
        }

        self.state.get_or_init(|| self.load(codec)).await.clone()
    }

    async fn load<C: Codec>(&self, codec: &C) -> Result<(), CacheError> {
        let result = self.load_or_create(codec).await;

        let status = if result.is_ok() { "ok" } else { "failed" };
        metric!(counter("caches.manifest.load") += 1, "status" => status);

        result.map_err(|error| {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                path = %self.path.display(),
                "Failed to load cache manifest",
            );
            CacheError::ManifestUnavailable(Arc::new(error))
        })
    }

    async fn load_or_create<C: Codec>(&self, codec: &C) -> Result<(), CacheError> {
        let existing: Option<Entries> = match fs::read(&self.path).await {
            Ok(bytes) => Some(
                codec
                    .decode(&bytes[..])
                    .map_err(CacheError::serialization)?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(CacheError::io(&self.path, e)),
        };

        if existing.is_none() {
            fs::create_dir_all(&self.directory)
                .await
                .map_err(|e| CacheError::io(&self.directory, e))?;
        }

        // Leftovers of a crashed writer are never referenced from a manifest.
        clear_stale_tmp(&self.tmp_dir, STALE_TMP_AGE).await?;

        match existing {
            Some(entries) => {
                tracing::info!(
                    entries = entries.len(),
                    "Loaded cache manifest from {}",
                    self.path.display()
                );
                *self.entries.write() = entries;
            }
            None => {
                tracing::info!("Creating empty cache manifest at {}", self.path.display());
                let contents = encode(codec, &Entries::new())?;
                write_atomic(&self.tmp_dir, &self.path, contents).await?;
            }
        }

        Ok(())
    }

    /// Writes a snapshot of all entries to disk, replacing the previous manifest file.
    ///
    /// Loads the manifest first if needed, so that saving never clobbers a manifest that was
    /// not read yet.
    pub async fn save<C: Codec>(&self, codec: &C) -> Result<(), CacheError> {
        self.ensure_loaded(codec).await?;

        // Concurrent saves are serialized so that a newer snapshot is never overwritten by an
        // older one.
        let _guard = self.save_lock.lock().await;
        let contents = {
            let entries = self.entries.read();
            encode(codec, &*entries)?
        };
        write_atomic(&self.tmp_dir, &self.path, contents).await?;

        tracing::debug!("Saved cache manifest to {}", self.path.display());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<ManifestEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Inserts or updates the entry for `key`.
    ///
    /// `file_name` is only invoked when the key is new. Existing entries keep their file name and
    /// only get `cached_at` and `time_to_live` updated.
    pub fn upsert<F>(
        &self,
        key: &str,
        cached_at: DateTime<Utc>,
        time_to_live: Duration,
        file_name: F,
    ) -> ManifestEntry
    where
        F: FnOnce() -> String,
    {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| ManifestEntry {
                file_name: file_name(),
                cached_at,
                time_to_live,
            });
        entry.cached_at = cached_at;
        entry.time_to_live = time_to_live;
        entry.clone()
    }

    pub fn remove(&self, key: &str) -> Option<ManifestEntry> {
        self.entries.write().remove(key)
    }

    /// Removes the entry for `key` only if it matches `predicate`.
    pub fn remove_if<F>(&self, key: &str, predicate: F) -> Option<ManifestEntry>
    where
        F: FnOnce(&ManifestEntry) -> bool,
    {
        let mut entries = self.entries.write();
        if !entries.get(key).is_some_and(predicate) {
            return None;
        }
        entries.remove(key)
    }

    /// Returns a copy of all entries, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, ManifestEntry)> {
        let mut snapshot: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
