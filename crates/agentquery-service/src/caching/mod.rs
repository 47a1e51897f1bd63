//! # Query caching infrastructure
//!
//! Every query result lives in the [`CacheStore`], addressed by its [`QueryKey`]. This module
//! contains the store itself, the [`CacheEntry`] records it keeps, the keys, and the central
//! [`TransportError`] type that failed fetches are recorded with.
//!
//! ## Entry lifecycle
//!
//! An entry is created by the first fetch attempt for its key and moves through
//! `Idle -> Fetching -> Success | Error`. Refetches update the entry in place. Each successful
//! write stamps three deadlines, derived from the [`Lifetimes`] of the query that wrote it:
//!
//! - `fetched_at`: when the data was written.
//! - `stale_at`: from here on the data is outdated. It can still be served, but the next access
//!   through the [`RequestCoordinator`](crate::coordinator::RequestCoordinator) refetches it.
//! - `gc_at`: from here on the entry may be removed, which happens only if nobody observes it and
//!   no fetch for it is pending. `gc_at` is never earlier than `stale_at`.
//!
//! Collection runs on a periodic timer (see [`CacheStore::spawn_collector`]) and
//! opportunistically whenever an expired entry is read.
//!
//! ## Out-of-order responses
//!
//! Each fetch attempt carries a monotonically increasing sequence number. The store remembers
//! the sequence number of the newest result it wrote, and discards any result of an older
//! attempt that settles afterwards. See [`SetOutcome::Discarded`].
//!
//! ## Observers
//!
//! [`CacheStore::subscribe`] hands out a [`StoreSubscription`]. Every mutation of the key wakes
//! up its observers, and an observed entry is never garbage collected.
//!
//! ## [`QueryKey`]
//!
//! Keys are the only way to address an entry. They are ordered lists of [`KeySegment`]s, most
//! commonly a query name followed by the query parameters as a structured map. The
//! [`query_key!`](crate::query_key) macro builds one from plain values.

mod entry;
mod error;
mod key;
mod store;

pub use entry::{
    CacheEntry, CachedData, EntryStatus, Lifetimes, QueryState, QueryStatus, downcast,
};
pub use error::{FetchResult, PreconditionError, TransportError};
pub use key::{KeyFilter, KeySegment, QueryKey};
pub use store::{CacheStore, EntryUpdate, SetOutcome, StoreSubscription};
