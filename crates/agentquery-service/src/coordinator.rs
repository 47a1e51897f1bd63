//! Deduplicated, cancelable execution of query fetches.
//!
//! The [`RequestCoordinator`] makes sure that at most one fetch per [`QueryKey`] is running at a
//! time. Every caller asking for a key with a pending fetch gets a [`FetchHandle`] attached to
//! that fetch, and all of them resolve with the same outcome once it settles.
//!
//! A fetch runs as its own spawned task. It writes its result into the [`CacheStore`] first,
//! then releases the pending request, and only then resolves the attached handles. A caller
//! therefore either attaches to a fetch that will still deliver, or finds the written entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::caching::{
    CacheStore, CachedData, EntryUpdate, FetchResult, Lifetimes, QueryKey, SetOutcome,
    TransportError,
};
use crate::utils::futures::CallOnDrop;

type ComputationChannel = Shared<oneshot::Receiver<FetchResult<CachedData>>>;

/// How long to wait before a retry.
#[derive(Clone, Copy, Debug)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Computes the delay from the zero-based number of the attempt that failed.
    Custom(fn(u32) -> Duration),
}

impl RetryDelay {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => base
                .checked_mul(2u32.saturating_pow(attempt))
                .map_or(max, |delay| delay.min(max)),
            Self::Custom(f) => f(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// How often a failed fetch is repeated within the same pending request.
///
/// Errors that are not [retryable](TransportError::is_retryable) are never retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: RetryDelay,
}

impl RetryPolicy {
    pub const NONE: Self = Self {
        retries: 0,
        delay: RetryDelay::Fixed(Duration::ZERO),
    };
}

/// Per-call information handed to a fetch function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchContext {
    /// Zero for the first attempt, incremented for each retry.
    pub attempt: u32,
    /// The timeout the caller asked for, if any.
    pub timeout: Option<Duration>,
}

/// Options of a single [`RequestCoordinator::fetch`] call.
#[derive(Clone, Copy, Debug)]
pub struct FetchOptions {
    /// The query name, used for logs and metrics.
    pub name: &'static str,
    pub lifetimes: Lifetimes,
    pub retry: RetryPolicy,
    /// Abort the fetch once every attached handle was dropped.
    pub cancel_unobserved: bool,
    /// Skip the freshness check and supersede a pending fetch.
    pub force_refresh: bool,
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn new(name: &'static str, lifetimes: Lifetimes) -> Self {
        Self {
            name,
            lifetimes,
            retry: RetryPolicy::NONE,
            cancel_unobserved: false,
            force_refresh: false,
            timeout: None,
        }
    }
}

struct PendingRequest {
    seq: u64,
    name: &'static str,
    subscribers: AtomicUsize,
    cancel_unobserved: bool,
    abort: AbortHandle,
    channel: ComputationChannel,
}

struct CoordinatorInner {
    store: Arc<CacheStore>,
    pending: Mutex<HashMap<QueryKey, Arc<PendingRequest>>>,
    next_seq: AtomicU64,
}

impl CoordinatorInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<QueryKey, Arc<PendingRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called when the last subscriber of `request` went away.
    fn release(&self, key: &QueryKey, request: &Arc<PendingRequest>) {
        if !request.cancel_unobserved {
            return;
        }

        {
            let mut pending = self.pending();
            let is_current = pending
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, request));
            // A new subscriber may have attached in the meantime.
            if !is_current || request.subscribers.load(Ordering::Acquire) > 0 {
                return;
            }
            pending.remove(key);
        }

        tracing::debug!(%key, seq = request.seq, "Canceling unobserved fetch");
        metric!(counter("query.fetch.canceled") += 1, "query" => request.name);
        request.abort.abort();
        self.store.set(key, EntryUpdate::FetchAbandoned { seq: request.seq });
    }
}

/// Deduplicates and runs the fetches of all queries sharing a [`CacheStore`].
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .inner
            .pending
            .try_lock()
            .map(|p| p.len())
            .unwrap_or_default();
        f.debug_struct("RequestCoordinator")
            .field("pending", &pending)
            .finish()
    }
}

impl RequestCoordinator {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    /// Fetches the data for `key`, or joins the fetch that is already running for it.
    ///
    /// Fresh cached data resolves the handle right away without calling `fetch_fn`, unless
    /// [`force_refresh`](FetchOptions::force_refresh) is set.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the fetch,
    /// even if the returned handle is never awaited.
    pub fn fetch<F, Fut>(&self, key: &QueryKey, options: FetchOptions, fetch_fn: F) -> FetchHandle
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<CachedData>> + Send + 'static,
    {
        let name = options.name;
        metric!(counter("query.access") += 1, "query" => name);

        let mut pending = self.inner.pending();

        if !options.force_refresh {
            if let Some(entry) = self.inner.store.get(key) {
                if let Some(data) = entry.data.as_ref().filter(|_| entry.is_fresh(Instant::now())) {
                    tracing::trace!(%key, "Serving fresh data from cache");
                    metric!(counter("query.cache.hit") += 1, "query" => name);
                    return FetchHandle::ready(key.clone(), Ok(data.clone()));
                }
            }

            if let Some(request) = pending.get(key) {
                tracing::trace!(%key, seq = request.seq, "Joining pending fetch");
                metric!(counter("query.fetch.dedup") += 1, "query" => name);
                request.subscribers.fetch_add(1, Ordering::AcqRel);
                return FetchHandle::attached(key.clone(), Arc::clone(request), &self.inner);
            }
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.store.set(key, EntryUpdate::FetchStarted { seq });
        let (abort, channel) = self.spawn_fetch(key.clone(), seq, options, fetch_fn);

        let request = Arc::new(PendingRequest {
            seq,
            name,
            subscribers: AtomicUsize::new(1),
            cancel_unobserved: options.cancel_unobserved,
            abort,
            channel,
        });
        if let Some(superseded) = pending.insert(key.clone(), Arc::clone(&request)) {
            tracing::debug!(%key, seq, superseded = superseded.seq, "Superseding pending fetch");
        }
        drop(pending);

        FetchHandle::attached(key.clone(), request, &self.inner)
    }

    fn spawn_fetch<F, Fut>(
        &self,
        key: QueryKey,
        seq: u64,
        options: FetchOptions,
        fetch_fn: F,
    ) -> (AbortHandle, ComputationChannel)
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<CachedData>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let remove_request_token = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut pending = inner.pending();
                if pending.get(&key).is_some_and(|request| request.seq == seq) {
                    pending.remove(&key);
                }
            })
        };

        // Leaves the `Fetching` state if the task is dropped before it settles.
        let abandon_token = {
            let store = Arc::downgrade(&self.inner.store);
            let key = key.clone();
            CallOnDrop::new(move || {
                if let Some(store) = store.upgrade() {
                    store.set(&key, EntryUpdate::FetchAbandoned { seq });
                }
            })
        };

        let store = Arc::clone(&self.inner.store);
        let task = async move {
            tracing::debug!(%key, seq, "Fetching");
            metric!(counter("query.fetch.computation") += 1, "query" => options.name);
            let start = Instant::now();

            let result = run_with_retries(&fetch_fn, &key, &options).await;
            metric!(
                timer("query.fetch.duration") = start.elapsed(),
                "query" => options.name,
                "status" => result.as_ref().map_or_else(|e| e.metrics_tag(), |_| "ok"),
            );
            if let Err(err) = &result {
                tracing::warn!(%key, seq, error = %err, "Fetch failed");
            }

            let settled = EntryUpdate::FetchSettled {
                seq,
                result: result.clone(),
                lifetimes: options.lifetimes,
            };
            let result = match store.set(&key, settled) {
                SetOutcome::Applied => result,
                SetOutcome::Discarded => {
                    metric!(counter("query.fetch.discarded") += 1, "query" => options.name);
                    // Subscribers of the superseded fetch get the newer value.
                    store.peek(&key).map_or(result, |entry| entry.result())
                }
            };
            abandon_token.disarm();

            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they find the written entry.
            drop(remove_request_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        let handle = tokio::spawn(task);
        (handle.abort_handle(), receiver.shared())
    }

    /// Whether a fetch for `key` is currently pending.
    pub fn is_pending(&self, key: &QueryKey) -> bool {
        self.inner.pending().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Aborts every pending fetch. Attached handles resolve with [`TransportError::Canceled`].
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.inner.pending().drain().collect();
        for (key, request) in drained {
            tracing::debug!(%key, seq = request.seq, "Canceling fetch");
            metric!(counter("query.fetch.canceled") += 1, "query" => request.name);
            request.abort.abort();
            self.inner
                .store
                .set(&key, EntryUpdate::FetchAbandoned { seq: request.seq });
        }
    }
}

async fn run_with_retries<F, Fut>(
    fetch_fn: &F,
    key: &QueryKey,
    options: &FetchOptions,
) -> FetchResult<CachedData>
where
    F: Fn(FetchContext) -> Fut,
    Fut: Future<Output = FetchResult<CachedData>>,
{
    let mut attempt = 0;
    loop {
        let context = FetchContext {
            attempt,
            timeout: options.timeout,
        };
        match fetch_fn(context).await {
            Err(err) if attempt < options.retry.retries && err.is_retryable() => {
                let delay = options.retry.delay.delay_for(attempt);
                tracing::debug!(%key, attempt, error = %err, ?delay, "Retrying fetch");
                metric!(counter("query.fetch.retry") += 1, "query" => options.name);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

enum HandleState {
    Ready(Option<FetchResult<CachedData>>),
    Attached {
        request: Arc<PendingRequest>,
        channel: ComputationChannel,
        coordinator: Arc<CoordinatorInner>,
    },
    Done,
}

/// A subscriber of a fetch, resolving with its outcome.
///
/// Dropping the handle before it resolved unsubscribes from the fetch, which cancels it if it
/// was started with [`cancel_unobserved`](FetchOptions::cancel_unobserved) and nobody else is
/// attached anymore.
#[must_use = "dropping a FetchHandle unsubscribes from the fetch"]
pub struct FetchHandle {
    key: QueryKey,
    state: HandleState,
}

impl FetchHandle {
    fn ready(key: QueryKey, result: FetchResult<CachedData>) -> Self {
        Self {
            key,
            state: HandleState::Ready(Some(result)),
        }
    }

    fn attached(
        key: QueryKey,
        request: Arc<PendingRequest>,
        coordinator: &Arc<CoordinatorInner>,
    ) -> Self {
        let channel = request.channel.clone();
        Self {
            key,
            state: HandleState::Attached {
                request,
                channel,
                coordinator: Arc::clone(coordinator),
            },
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Whether the handle resolved from the cache without joining a fetch.
    pub fn is_cached(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    /// Lets the fetch run to completion in the background.
    ///
    /// The handle keeps counting as a subscriber, so the fetch is never canceled for lack of
    /// observers.
    pub fn detach(mut self) {
        self.state = HandleState::Done;
    }
}

impl Future for FetchHandle {
    type Output = FetchResult<CachedData>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            HandleState::Ready(result) => result.take().unwrap_or(Err(TransportError::Canceled)),
            HandleState::Attached {
                request, channel, ..
            } => match Pin::new(channel).poll(cx) {
                Poll::Ready(result) => {
                    request.subscribers.fetch_sub(1, Ordering::AcqRel);
                    result.unwrap_or(Err(TransportError::Canceled))
                }
                Poll::Pending => return Poll::Pending,
            },
            HandleState::Done => Err(TransportError::Canceled),
        };
        this.state = HandleState::Done;
        Poll::Ready(result)
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if let HandleState::Attached {
            request,
            coordinator,
            ..
        } = std::mem::replace(&mut self.state, HandleState::Done)
        {
            if request.subscribers.fetch_sub(1, Ordering::AcqRel) == 1 {
                coordinator.release(&self.key, &request);
            }
        }
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            HandleState::Ready(_) => "ready",
            HandleState::Attached { .. } => "attached",
            HandleState::Done => "done",
        };
        f.debug_struct("FetchHandle")
            .field("key", &self.key)
            .field("state", &state)
            .finish()
    }
}
