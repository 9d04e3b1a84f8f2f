use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// A cached value together with its freshness information.
///
/// This is the unit exchanged with callers of [`FileCache::get`](super::FileCache::get) and
/// [`FileCache::set`](super::FileCache::set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    pub time_to_live: Duration,
}

impl<T> CacheEntry<T> {
    /// Creates an entry that was cached just now.
    pub fn new(value: T, time_to_live: Duration) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
            time_to_live,
        }
    }

    /// The point in time after which this entry is expired, or `None` if it never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(self.cached_at, self.time_to_live)
    }

    /// Whether this entry is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired_at(self.cached_at, self.time_to_live, now)
    }
}

/// `cached_at + time_to_live`, saturating to "never" for TTLs that do not fit the calendar.
pub(super) fn expires_at(cached_at: DateTime<Utc>, time_to_live: Duration) -> Option<DateTime<Utc>> {
    let ttl = TimeDelta::from_std(time_to_live).ok()?;
    cached_at.checked_add_signed(ttl)
}

/// An entry is expired once its expiration time is strictly earlier than `now`.
pub(super) fn is_expired_at(
    cached_at: DateTime<Utc>,
    time_to_live: Duration,
    now: DateTime<Utc>,
) -> bool {
    expires_at(cached_at, time_to_live).is_some_and(|expires_at| expires_at < now)
}
