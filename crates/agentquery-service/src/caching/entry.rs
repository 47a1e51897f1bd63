use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{FetchResult, QueryKey, TransportError};

/// Type-erased query data as stored in the [`CacheStore`](super::CacheStore).
///
/// Every query kind stores its own data type; typed accessors downcast on read.
pub type CachedData = Arc<dyn Any + Send + Sync>;

/// Downcasts cached data to the type a query stores.
pub fn downcast<T: Any + Send + Sync>(data: CachedData) -> FetchResult<Arc<T>> {
    data.downcast::<T>().map_err(|_| {
        tracing::error!(
            expected = std::any::type_name::<T>(),
            "Cached data has an unexpected type"
        );
        TransportError::InternalError
    })
}

/// The fetch state of a [`CacheEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// How long fetched data stays fresh, and how long the entry is retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifetimes {
    pub stale_time: Duration,
    pub gc_time: Duration,
}

/// Adds `duration` to `now`, saturating far in the future instead of overflowing.
pub(crate) fn deadline(now: Instant, duration: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// An entry of the [`CacheStore`](super::CacheStore).
///
/// The timestamps uphold `fetched_at <= stale_at <= gc_at`.
#[derive(Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<CachedData>,
    pub error: Option<TransportError>,
    pub fetched_at: Instant,
    pub stale_at: Instant,
    pub gc_at: Instant,
    pub status: EntryStatus,
    /// Retention of the last write, restarted when the last observer goes away.
    pub(crate) gc_time: Duration,
    /// Sequence number of the newest fetch attempt whose result was written.
    pub(crate) applied_seq: u64,
    /// Sequence numbers of all fetch attempts that have not settled yet.
    pub(crate) in_flight: BTreeSet<u64>,
}

impl CacheEntry {
    pub(crate) fn new(key: QueryKey, now: Instant) -> Self {
        Self {
            key,
            data: None,
            error: None,
            fetched_at: now,
            stale_at: now,
            gc_at: now,
            status: EntryStatus::Idle,
            gc_time: Duration::ZERO,
            applied_seq: 0,
            in_flight: BTreeSet::new(),
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.stale_at
    }

    /// Whether the entry holds data that can be served without fetching.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.data.is_some() && !self.is_stale(now)
    }

    pub fn is_fetching(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// The outcome that waiting callers should observe for this entry.
    pub fn result(&self) -> FetchResult<CachedData> {
        match (&self.error, &self.data) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(data)) => Ok(data.clone()),
            (None, None) => Err(TransportError::Canceled),
        }
    }

    /// Returns the data downcast to `T`, if any.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data.clone()?.downcast::<T>().ok()
    }

    pub(crate) fn settled_status(&self) -> EntryStatus {
        if self.is_fetching() {
            EntryStatus::Fetching
        } else if self.error.is_some() {
            EntryStatus::Error
        } else if self.data.is_some() {
            EntryStatus::Success
        } else {
            EntryStatus::Idle
        }
    }

    pub(crate) fn write_data(&mut self, data: CachedData, lifetimes: Lifetimes, now: Instant) {
        self.data = Some(data);
        self.error = None;
        self.fetched_at = now;
        self.stale_at = deadline(now, lifetimes.stale_time);
        self.gc_at = self.stale_at.max(deadline(now, lifetimes.gc_time));
        self.gc_time = lifetimes.gc_time;
    }

    pub(crate) fn write_error(
        &mut self,
        error: TransportError,
        lifetimes: Lifetimes,
        now: Instant,
    ) {
        self.error = Some(error);
        self.gc_at = self.gc_at.max(deadline(now, lifetimes.gc_time));
        self.gc_time = lifetimes.gc_time;
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("status", &self.status)
            .field("fetched_at", &self.fetched_at)
            .field("stale_at", &self.stale_at)
            .field("gc_at", &self.gc_at)
            .field("applied_seq", &self.applied_seq)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// The status of a query as observed by callers.
///
/// `Idle` means the query never ran, usually because it is disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl From<EntryStatus> for QueryStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Idle => Self::Idle,
            EntryStatus::Fetching => Self::Loading,
            EntryStatus::Success => Self::Success,
            EntryStatus::Error => Self::Error,
        }
    }
}

/// A typed snapshot of a query, as handed out to callers.
#[derive(Debug)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<TransportError>,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T: Any + Send + Sync> QueryState<T> {
    /// Snapshots an optional cache entry, downcasting its data.
    pub fn from_entry(entry: Option<&CacheEntry>) -> Self {
        let Some(entry) = entry else {
            return Self::idle();
        };
        let data = match entry.data.clone().map(downcast::<T>).transpose() {
            Ok(data) => data,
            Err(err) => {
                return Self {
                    status: QueryStatus::Error,
                    data: None,
                    error: Some(err),
                };
            }
        };
        Self {
            status: entry.status.into(),
            data,
            error: entry.error.clone(),
        }
    }
}

impl<T> QueryState<T> {
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}
