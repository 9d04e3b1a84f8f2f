//! Helpers for testing the file cache.
//!
//! Add this crate as a dev-dependency and call [`setup`] at the beginning of each test.

use std::fs;
use std::path::Path;

use tracing_subscriber::EnvFilter;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the filestash crates and mutes all
///    other logs.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("filestash=trace,filestash_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Lists the names of all the entries directly inside of `dir`, sorted.
///
/// # Panics
///
/// Panics if `dir` can not be read.
pub fn dir_entries(dir: impl AsRef<Path>) -> Vec<String> {
    let dir = dir.as_ref();
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("failed to read '{}': {e}", dir.display()))
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
