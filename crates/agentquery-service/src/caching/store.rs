use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::entry::deadline;
use super::{CacheEntry, CachedData, EntryStatus, FetchResult, KeyFilter, Lifetimes, QueryKey};
use crate::utils::futures::CallOnDrop;

/// A partial update that [`CacheStore::set`] merges into an entry.
#[derive(Clone)]
pub enum EntryUpdate {
    /// A fetch attempt with the given sequence number was started.
    FetchStarted { seq: u64 },
    /// A fetch attempt settled with `result`.
    FetchSettled {
        seq: u64,
        result: FetchResult<CachedData>,
        lifetimes: Lifetimes,
    },
    /// A fetch attempt was abandoned before it settled.
    FetchAbandoned { seq: u64 },
    /// Data was written directly, without a fetch.
    Data {
        data: CachedData,
        lifetimes: Lifetimes,
    },
}

/// Whether [`CacheStore::set`] wrote the update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    Applied,
    /// The update came from a fetch attempt older than the one whose result is already stored.
    Discarded,
}

struct Observers {
    count: usize,
    notify: watch::Sender<u64>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    observers: HashMap<QueryKey, Observers>,
}

impl StoreInner {
    fn is_observed(&self, key: &QueryKey) -> bool {
        self.observers.get(key).is_some_and(|o| o.count > 0)
    }

    fn is_collectable(&self, entry: &CacheEntry, now: Instant) -> bool {
        entry.gc_at <= now && !entry.is_fetching() && !self.is_observed(&entry.key)
    }

    fn notify(&self, key: &QueryKey) {
        if let Some(observers) = self.observers.get(key) {
            observers.notify.send_modify(|version| *version += 1);
        }
    }
}

/// The keyed store of query results.
///
/// The store is shared by every caller of a [`QueryClient`](crate::client::QueryClient). All
/// mutations happen under a single lock which is never held across an `.await`, so every
/// operation is atomic with respect to concurrently running tasks.
///
/// Entries are garbage collected once their `gc_at` deadline has passed, as long as nobody
/// [observes](CacheStore::subscribe) them and no fetch for them is pending.
#[derive(Default)]
pub struct CacheStore {
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CacheStore")
            .field("entries", &inner.entries.len())
            .field("observed_keys", &inner.observers.len())
            .finish()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave an entry half-written, as all
        // mutations are plain field assignments.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a snapshot of the entry for `key`.
    ///
    /// An entry that is past its retention deadline and unobserved is dropped on access.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner.entries.get(key)?;
        if inner.is_collectable(entry, now) {
            tracing::trace!(%key, "Dropping expired entry on access");
            inner.entries.remove(key);
            metric!(counter("query.gc.evicted") += 1, "trigger" => "access");
            return None;
        }
        Some(entry.clone())
    }

    /// Returns a snapshot of the entry for `key` without collecting it.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Merges `update` into the entry for `key`, creating it if absent.
    ///
    /// Settling a fetch whose entry no longer exists is discarded, so a cleared entry is never
    /// brought back. All observers of `key` are notified of every change to the entry.
    pub fn set(&self, key: &QueryKey, update: EntryUpdate) -> SetOutcome {
        let now = Instant::now();
        let mut inner = self.lock();
        let settles_fetch = matches!(
            update,
            EntryUpdate::FetchSettled { .. } | EntryUpdate::FetchAbandoned { .. }
        );
        if settles_fetch && !inner.entries.contains_key(key) {
            // The entry was cleared while the fetch ran, there is nothing to settle.
            return SetOutcome::Discarded;
        }
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), now));

        let outcome = match update {
            EntryUpdate::FetchStarted { seq } => {
                entry.in_flight.insert(seq);
                entry.status = EntryStatus::Fetching;
                SetOutcome::Applied
            }
            EntryUpdate::FetchSettled {
                seq,
                result,
                lifetimes,
            } => {
                entry.in_flight.remove(&seq);
                if seq < entry.applied_seq {
                    tracing::debug!(
                        %key,
                        seq,
                        applied = entry.applied_seq,
                        "Discarding response of a superseded fetch"
                    );
                    entry.status = entry.settled_status();
                    SetOutcome::Discarded
                } else {
                    entry.applied_seq = seq;
                    match result {
                        Ok(data) => entry.write_data(data, lifetimes, now),
                        Err(error) => entry.write_error(error, lifetimes, now),
                    }
                    entry.status = entry.settled_status();
                    SetOutcome::Applied
                }
            }
            EntryUpdate::FetchAbandoned { seq } => {
                entry.in_flight.remove(&seq);
                entry.status = entry.settled_status();
                SetOutcome::Applied
            }
            EntryUpdate::Data { data, lifetimes } => {
                entry.write_data(data, lifetimes, now);
                entry.status = entry.settled_status();
                SetOutcome::Applied
            }
        };

        // a discarded response still settles its attempt, which may change the status
        inner.notify(key);
        outcome
    }

    /// Marks all entries matching `filter` as stale, keeping their data.
    ///
    /// Returns the number of invalidated entries.
    pub fn invalidate(&self, filter: &KeyFilter) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut invalidated = Vec::new();
        for (key, entry) in inner.entries.iter_mut() {
            if filter.matches(key) {
                entry.stale_at = now.max(entry.fetched_at);
                entry.gc_at = entry.gc_at.max(entry.stale_at);
                invalidated.push(key.clone());
            }
        }
        for key in &invalidated {
            inner.notify(key);
        }
        tracing::debug!(?filter, count = invalidated.len(), "Invalidated entries");
        invalidated.len()
    }

    /// Removes all entries past their retention deadline that are neither observed nor
    /// being fetched.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let expired: Vec<_> = inner
            .entries
            .values()
            .filter(|entry| inner.is_collectable(entry, now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            inner.entries.remove(key);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Evicted expired entries");
            metric!(counter("query.gc.evicted") += expired.len() as i64, "trigger" => "timer");
        }
        expired.len()
    }

    /// Registers an observer for `key`.
    ///
    /// The entry for `key` does not need to exist yet. As long as the returned subscription is
    /// alive, the entry is not garbage collected and every change to it wakes up
    /// [`StoreSubscription::changed`].
    pub fn subscribe(self: &Arc<Self>, key: &QueryKey) -> StoreSubscription {
        let receiver = {
            let mut inner = self.lock();
            let observers = inner.observers.entry(key.clone()).or_insert_with(|| Observers {
                count: 0,
                notify: watch::channel(0).0,
            });
            observers.count += 1;
            observers.notify.subscribe()
        };

        let store = Arc::downgrade(self);
        let guard_key = key.clone();
        let guard = CallOnDrop::new(move || {
            if let Some(store) = Weak::upgrade(&store) {
                store.unsubscribe(&guard_key);
            }
        });

        StoreSubscription {
            key: key.clone(),
            receiver,
            _guard: guard,
        }
    }

    fn unsubscribe(&self, key: &QueryKey) {
        let now = Instant::now();
        let mut inner = self.lock();
        let remaining = match inner.observers.get_mut(key) {
            Some(observers) => {
                observers.count = observers.count.saturating_sub(1);
                observers.count
            }
            None => return,
        };
        if remaining == 0 {
            inner.observers.remove(key);
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.gc_at = entry.gc_at.max(deadline(now, entry.gc_time));
            }
        }
    }

    /// The number of observers currently registered for `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.lock().observers.get(key).map_or(0, |o| o.count)
    }

    /// Returns the keys of all entries, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let keys: Vec<_> = inner.entries.keys().cloned().collect();
        inner.entries.clear();
        for key in &keys {
            inner.notify(key);
        }
    }

    /// Spawns the background collector which calls [`evict_expired`](Self::evict_expired)
    /// every `interval`.
    ///
    /// The collector stops by itself once the store is dropped; the returned handle can be
    /// used to abort it earlier.
    pub fn spawn_collector(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(deadline(Instant::now(), period), period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.evict_expired(Instant::now());
            }
        })
    }
}

/// An observer registration returned by [`CacheStore::subscribe`].
///
/// Dropping the subscription unregisters the observer.
#[derive(Debug)]
pub struct StoreSubscription {
    key: QueryKey,
    receiver: watch::Receiver<u64>,
    _guard: CallOnDrop,
}

impl StoreSubscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Waits until the observed entry changes.
    ///
    /// Returns `false` if the store was dropped in the meantime.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Whether the entry changed since the last call to [`changed`](Self::changed).
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }
}
