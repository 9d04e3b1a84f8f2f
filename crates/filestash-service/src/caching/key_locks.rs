use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::CacheError;

type SlotResult<V> = Result<V, CacheError>;

// `Shared` needs a `Clone` output, which is why errors are `Clone` as well.
type SlotChannel<V> = Shared<oneshot::Receiver<SlotResult<V>>>;

/// The pending result of the producer that holds a key.
struct Slot<V> {
    sender: oneshot::Sender<SlotResult<V>>,
    channel: SlotChannel<V>,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender,
            channel: receiver.shared(),
        }
    }
}

/// Single-flight coordination over an arbitrary key space.
///
/// This ensures that only one producer computes a fresh value for a key, while every other
/// caller interested in the same key awaits the outcome of that producer:
///
/// ```ignore
/// if key_locks.acquire(key) {
///     let result = compute(key).await;
///     key_locks.release(key, result.clone());
///     result
/// } else {
///     key_locks.wait(key).await
/// }
/// ```
///
/// A slot exists for a key from the moment it is acquired (or first waited on) until it is
/// released. Releasing hands the value, or error, to all the waiters at once and clears the slot,
/// so that the next [`acquire`](Self::acquire) succeeds again.
///
/// The coordinator does not hold on to any values beyond that. It is cheap to clone, and clones
/// share their slots, so any number of cache backends can coordinate on one instance.
pub struct KeyLocks<V> {
    slots: Arc<Mutex<BTreeMap<String, Slot<V>>>>,
}

impl<V> Clone for KeyLocks<V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<V> Default for KeyLocks<V> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
        }
    }
}

impl<V> fmt::Debug for KeyLocks<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.try_lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("KeyLocks")
            .field("held slots", &slots)
            .finish()
    }
}

impl<V> KeyLocks<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to become the producer for `key`.
    ///
    /// Returns `true` if no slot existed for `key`; the caller is then responsible for calling
    /// [`release`](Self::release) eventually. Returns `false` if the key is already held, in
    /// which case the caller should [`wait`](Self::wait) for the result instead.
    pub fn acquire(&self, key: &str) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(key) {
            metric!(counter("keylocks.contended") += 1);
            return false;
        }

        slots.insert(key.to_owned(), Slot::new());
        metric!(counter("keylocks.acquired") += 1);
        true
    }

    /// Returns a future resolving to whatever is passed to the next [`release`](Self::release)
    /// of `key`.
    ///
    /// If no slot exists for `key` yet, this creates one, so a later [`acquire`](Self::acquire)
    /// will see the key as held.
    ///
    /// NOTE: This function itself is *not* `async`: the slot is registered when it is called,
    /// not when the returned future is first polled.
    pub fn wait(&self, key: &str) -> BoxFuture<'static, SlotResult<V>> {
        let channel = self
            .slots
            .lock()
            .entry(key.to_owned())
            .or_insert_with(Slot::new)
            .channel
            .clone();
        metric!(counter("keylocks.waiters") += 1);

        channel
            .map(|result| result.unwrap_or(Err(CacheError::Cancelled)))
            .boxed()
    }

    /// Resolves all the current waiters of `key` with `result` and clears the slot.
    ///
    /// Releasing a key that nobody holds or waits for does nothing.
    pub fn release(&self, key: &str, result: SlotResult<V>) {
        let Some(slot) = self.slots.lock().remove(key) else {
            return;
        };

        if slot.sender.send(result).is_err() {
            tracing::trace!(key, "Key lock released without any waiters");
        }
    }

    /// Whether a slot currently exists for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// The number of keys that are currently held.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
