use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;

/// A reader/writer lock guarding a single cache file.
pub type FileLock = Arc<RwLock<()>>;

/// A registry of per-file reader/writer locks, created on demand.
///
/// Readers of a file take the lock in shared mode and may proceed in parallel, whereas writers
/// and deletions take it exclusively. Locks of different files are completely independent.
///
/// Retiring a lock only drops it from the table. Callers that already hold a clone of the lock
/// keep operating on that object, and the next [`get`](Self::get) creates a fresh one.
#[derive(Debug, Default)]
pub struct FileLocks {
    locks: Mutex<HashMap<String, FileLock>>,
}

impl FileLocks {
    /// Returns the lock for `file_name`, creating it if it does not exist yet.
    pub fn get(&self, file_name: &str) -> FileLock {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(file_name) {
            return Arc::clone(lock);
        }

        let lock = FileLock::default();
        locks.insert(file_name.to_owned(), Arc::clone(&lock));
        lock
    }

    /// Removes the lock for `file_name` from the table, but only if it is still `lock`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn retire(&self, file_name: &str, lock: &FileLock) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(file_name) {
            Some(current) if Arc::ptr_eq(current, lock) => {
                locks.remove(file_name);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
