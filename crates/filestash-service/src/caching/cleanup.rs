use std::time::Instant;

use chrono::{DateTime, Utc};

use super::{CacheError, Codec, FileCache};

/// The outcome of a [`FileCache::cleanup`] run.
#[derive(Debug, Default)]
pub struct CleanupStats {
    /// Number of expired entries that were removed.
    pub removed: usize,
    /// Number of entries that were kept.
    pub retained: usize,
    /// Entries that were removed from the manifest, but whose data file could not be deleted.
    pub failures: Vec<(String, CacheError)>,
}

impl CleanupStats {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<C: Codec> FileCache<C> {
    /// Removes all the entries that are expired right now.
    ///
    /// See [`cleanup_at`](Self::cleanup_at).
    pub async fn cleanup(&self) -> Result<CleanupStats, CacheError> {
        self.cleanup_at(Utc::now()).await
    }

    /// Removes all the entries whose `cached_at + time_to_live` is strictly earlier than `now`.
    ///
    /// This is a best-effort sweep over a snapshot of the manifest. Entries inserted while the
    /// sweep is running may or may not be considered, and an entry that was refreshed in the
    /// meantime is kept. A failure to delete one data file does not stop the sweep; it is logged
    /// and reported in [`CleanupStats::failures`].
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupStats, CacheError> {
        self.manifest.ensure_loaded(&self.codec).await?;
        tracing::info!("Cleaning up file cache at {}", self.directory().display());
        let started = Instant::now();

        let mut stats = CleanupStats::default();
        for (key, entry) in self.manifest.snapshot() {
            if !entry.is_expired_at(now) {
                stats.retained += 1;
                continue;
            }

            let Some(entry) = self.manifest.remove_if(&key, |e| e.is_expired_at(now)) else {
                tracing::debug!(key = %key, "Cache entry changed during cleanup");
                stats.retained += 1;
                continue;
            };

            tracing::debug!(key = %key, "Removing expired cache entry");
            match self.remove_data_file(&entry).await {
                Ok(()) => stats.removed += 1,
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        key = %key,
                        "Failed to clean cache file",
                    );
                    stats.failures.push((key, error));
                }
            }
        }

        tracing::info!(
            "Cleaning up complete: removed {} entries, retained {}, failed {}",
            stats.removed,
            stats.retained,
            stats.failures.len(),
        );
        metric!(counter("caches.cleanup.removed") += stats.removed as i64);
        metric!(counter("caches.cleanup.failed") += stats.failures.len() as i64);
        metric!(gauge("caches.size.entries") = stats.retained as u64);
        metric!(timer("caches.cleanup.duration") = started.elapsed());

        Ok(stats)
    }

    /// Returns the keys that [`cleanup_at`](Self::cleanup_at) would remove at `now`, without
    /// removing anything.
    pub async fn expired_keys_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, CacheError> {
        self.manifest.ensure_loaded(&self.codec).await?;
        Ok(self
            .manifest
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key)
            .collect())
    }
}
