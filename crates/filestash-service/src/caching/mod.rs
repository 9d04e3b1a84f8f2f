//! # Filestash Caching infrastructure
//!
//! This module contains the persistent, file-backed cache layer and the single-flight
//! coordinator that prevents concurrent recomputation of the same cache key.
//!
//! ## [`FileCache`]
//!
//! The file cache stores every cached value in its own file inside a cache directory. It is
//! composed of the following parts:
//!
//! - The [`Manifest`] maps cache keys to their [`ManifestEntry`], which holds the name of the data
//!   file as well as the time the value was cached at and its time-to-live. The manifest is loaded
//!   lazily on first use and is only persisted explicitly, via [`FileCache::save`] or
//!   [`FileCache::shutdown`]. Changes made in between are lost when the process dies.
//! - The [`NameMapper`] derives a stable, file system safe name for each key by hashing it.
//!   Hash collisions between distinct keys are not detected; two colliding keys share one file.
//! - The [`FileLocks`] table hands out one reader/writer lock per data file. Reads of a file run
//!   in parallel, writes and deletions are exclusive. There is no ordering across files.
//! - A [`Codec`] turns values into bytes and back. The cache does not care about the format and
//!   uses the same codec for the manifest itself.
//!
//! ## Expiration
//!
//! The file cache itself never refuses to return an expired entry. Callers compare
//! [`CacheEntry::cached_at`] and [`CacheEntry::time_to_live`] against the current time, and
//! [`FileCache::cleanup`] removes every entry whose expiration time lies strictly in the past.
//! All of this uses wall clock time, so moving the system clock backwards or forwards delays or
//! advances expiry accordingly.
//!
//! ## [`KeyLocks`]
//!
//! The key locks are independent of the file cache. They are meant for a "compute if missing"
//! layer sitting on top of one or more caches: the first caller to [`acquire`](KeyLocks::acquire)
//! a key computes the value, every other caller [`wait`](KeyLocks::wait)s for it. The producer
//! hands its result, or its error, to all the waiters via [`release`](KeyLocks::release).
//!
//! Neither the file cache nor the key locks implement timeouts or cancellation. A caller that
//! stops awaiting an operation does not release anything that was acquired on its behalf.
//!
//! ## [`CacheError`]
//!
//! - [`CacheError::ManifestUnavailable`] is returned by every operation after the manifest failed
//!   to load. [`FileCache::is_available`] reports this status.
//! - [`CacheError::Io`] is scoped to the file of a single key and does not affect other keys.
//! - [`CacheError::Serialization`] forwards codec failures. The affected entry is not evicted.
//! - [`CacheError::Computation`] carries a producer failure through [`KeyLocks`].
//!
//! There are no automatic retries anywhere in here.

mod cache_error;
mod cleanup;
mod codec;
mod entry;
mod fs;
mod key_locks;
mod locks;
mod manifest;
mod name;
#[cfg(test)]
mod tests;

pub use cache_error::{CacheError, SharedError};
pub use cleanup::CleanupStats;
pub use codec::{Codec, JsonCodec, YamlCodec};
pub use entry::CacheEntry;
pub use fs::FileCache;
pub use key_locks::KeyLocks;
pub use locks::{FileLock, FileLocks};
pub use manifest::{Manifest, ManifestEntry};
pub use name::NameMapper;
