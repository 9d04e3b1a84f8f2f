use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// A type-erased error that can be shared between every party interested in a failure.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// An error that happens while operating on the file cache.
///
/// The error is cheaply [`Clone`]able, as the failure of a single producer is handed out to
/// every caller waiting on the same key via [`KeyLocks`](super::KeyLocks).
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The manifest could not be loaded or created.
    ///
    /// This status is sticky: once the first load attempt failed, every subsequent operation
    /// returns this error without touching the file system again.
    #[error("cache manifest unavailable")]
    ManifestUnavailable(#[source] Arc<CacheError>),
    /// Reading, writing or deleting a single file failed.
    #[error("i/o error on `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    /// The serialization collaborator failed to encode or decode a value.
    #[error("failed to (de)serialize cache contents")]
    Serialization(#[source] SharedError),
    /// The producer holding a key lock reported a failure.
    #[error("cache computation failed")]
    Computation(#[source] SharedError),
    /// A key lock slot went away without being released.
    #[error("key lock was dropped without a result")]
    Cancelled,
}

impl CacheError {
    /// Creates an [`Io`](Self::Io) error for an operation on `path`.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_owned(),
            source: Arc::new(source),
        }
    }

    /// Wraps an error raised by a [`Codec`](super::Codec).
    pub fn serialization<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Serialization(Arc::new(error))
    }

    /// Wraps the failure of a value producer, to be passed to [`KeyLocks::release`](super::KeyLocks::release).
    pub fn computation<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::Computation(Arc::from(error.into()))
    }
}
