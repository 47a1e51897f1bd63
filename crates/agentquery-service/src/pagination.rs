//! Cursor based incremental loading.
//!
//! A [`PaginatedFetcher`] drives one paginated query. Pages are fetched one at a time through
//! the [`RequestCoordinator`], so every page is deduplicated and cached like any other query
//! under the key `[..base key, cursor]`, and appended to an ordered accumulator.
//!
//! The accumulator only accepts a page if it still continues where the accumulator left off.
//! Restarting with [`fetch_first_page`](PaginatedFetcher::fetch_first_page) bumps a generation
//! counter, and any page requested for an older generation is discarded when it arrives.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::caching::{
    CachedData, FetchResult, PreconditionError, QueryKey, QueryStatus, TransportError, downcast,
};
use crate::coordinator::{FetchOptions, RequestCoordinator};
use crate::definitions::{QueryDefinition, QueryParams};
use crate::enablement::EnablementResolver;
use crate::service::DataService;

/// An error of [`PaginatedFetcher::fetch_next_page`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A fetched page and the cursor it was requested with.
#[derive(Debug)]
pub struct Page<T> {
    /// `None` for the first page.
    pub cursor: Option<String>,
    pub data: Arc<T>,
}

impl<T> Clone for Page<T> {
    fn clone(&self) -> Self {
        Self {
            cursor: self.cursor.clone(),
            data: Arc::clone(&self.data),
        }
    }
}

#[derive(Debug)]
struct PageAccumulator<T> {
    pages: Vec<Page<T>>,
    /// The continuation token of the last page. `None` when exhausted.
    cursor: Option<String>,
    exhausted: bool,
    in_flight: bool,
    generation: u64,
    status: QueryStatus,
    error: Option<TransportError>,
}

impl<T> Default for PageAccumulator<T> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            cursor: None,
            exhausted: false,
            in_flight: false,
            generation: 0,
            status: QueryStatus::Idle,
            error: None,
        }
    }
}

/// Clears the in-flight flag of its generation when a page fetch ends, including when the
/// fetching future is dropped.
struct InFlightGuard<'a, T> {
    state: &'a Mutex<PageAccumulator<T>>,
    generation: u64,
}

impl<T> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation == self.generation && state.in_flight {
            state.in_flight = false;
            if state.status == QueryStatus::Loading {
                state.status = if state.error.is_some() {
                    QueryStatus::Error
                } else if state.pages.is_empty() {
                    QueryStatus::Idle
                } else {
                    QueryStatus::Success
                };
            }
        }
    }
}

/// Drives the incremental retrieval of one paginated query.
pub struct PaginatedFetcher<T> {
    definition: QueryDefinition,
    params: QueryParams,
    caller_override: Option<bool>,
    options: FetchOptions,
    coordinator: RequestCoordinator,
    resolver: EnablementResolver,
    service: Arc<dyn DataService>,
    state: Mutex<PageAccumulator<T>>,
    _data: PhantomData<fn() -> T>,
}

impl<T> PaginatedFetcher<T> {
    fn lock(&self) -> MutexGuard<'_, PageAccumulator<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for PaginatedFetcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PaginatedFetcher")
            .field("query", &self.definition.name())
            .field("params", &self.params)
            .field("pages", &state.pages.len())
            .field("cursor", &state.cursor)
            .field("exhausted", &state.exhausted)
            .field("in_flight", &state.in_flight)
            .field("generation", &state.generation)
            .finish()
    }
}

impl<T: Any + Send + Sync> PaginatedFetcher<T> {
    pub fn new(
        definition: QueryDefinition,
        params: QueryParams,
        caller_override: Option<bool>,
        coordinator: RequestCoordinator,
        resolver: EnablementResolver,
        service: Arc<dyn DataService>,
    ) -> Self {
        let options = definition.fetch_options();
        Self {
            definition,
            params,
            caller_override,
            options,
            coordinator,
            resolver,
            service,
            state: Mutex::new(PageAccumulator::default()),
            _data: PhantomData,
        }
    }

    /// Replaces the options every page fetch is issued with.
    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// The key all pages of this query are cached under.
    pub fn base_key(&self) -> QueryKey {
        self.definition.key(&self.params)
    }

    /// Fetches the first page, discarding all pages fetched so far.
    ///
    /// Does nothing if the query is disabled.
    pub async fn fetch_first_page(&self) -> FetchResult<()> {
        let enablement = self
            .resolver
            .evaluate(&self.definition, &self.params, self.caller_override);
        if !enablement.is_enabled() {
            tracing::trace!(query = self.definition.name(), ?enablement, "Query is disabled");
            metric!(counter("query.disabled") += 1, "query" => self.definition.name());
            return Ok(());
        }

        let generation = {
            let mut state = self.lock();
            let generation = state.generation + 1;
            *state = PageAccumulator {
                generation,
                in_flight: true,
                status: QueryStatus::Loading,
                ..Default::default()
            };
            generation
        };
        let _guard = InFlightGuard {
            state: &self.state,
            generation,
        };

        let result = self.fetch_page(None).await;
        self.accept(generation, None, result)
    }

    /// Fetches the page after the last one and appends it.
    ///
    /// Fails with a [`PreconditionError`] if no first page was fetched yet, another page is
    /// still being fetched, or the last page had no continuation cursor.
    pub async fn fetch_next_page(&self) -> Result<(), PaginationError> {
        let (generation, cursor) = {
            let mut state = self.lock();
            if state.pages.is_empty() {
                return Err(PreconditionError::NotStarted.into());
            }
            if state.in_flight {
                return Err(PreconditionError::InFlight.into());
            }
            let Some(cursor) = state.cursor.clone().filter(|_| !state.exhausted) else {
                return Err(PreconditionError::Exhausted.into());
            };
            state.in_flight = true;
            state.status = QueryStatus::Loading;
            (state.generation, cursor)
        };
        let _guard = InFlightGuard {
            state: &self.state,
            generation,
        };

        let result = self.fetch_page(Some(cursor.clone())).await;
        Ok(self.accept(generation, Some(cursor), result)?)
    }

    async fn fetch_page(&self, cursor: Option<String>) -> FetchResult<CachedData> {
        let key = self.definition.page_key(&self.params, cursor.as_deref());
        let params = match &cursor {
            Some(cursor) => self.params.with_cursor(cursor),
            None => self.params.clone(),
        };
        let definition = self.definition.clone();
        let service = Arc::clone(&self.service);

        self.coordinator
            .fetch(&key, self.options, move |ctx| {
                definition.fetch(Arc::clone(&service), params.clone(), ctx)
            })
            .await
    }

    fn accept(
        &self,
        generation: u64,
        cursor: Option<String>,
        result: FetchResult<CachedData>,
    ) -> FetchResult<()> {
        let mut state = self.lock();
        if state.generation != generation || (cursor.is_some() && state.cursor != cursor) {
            tracing::warn!(
                query = self.definition.name(),
                ?cursor,
                generation,
                current_generation = state.generation,
                "Discarding page that no longer continues the accumulated pages"
            );
            return Ok(());
        }

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                state.status = QueryStatus::Error;
                state.error = Some(err.clone());
                return Err(err);
            }
        };

        let next_cursor = self.definition.extract_cursor.and_then(|extract| extract(&data));
        let data = downcast::<T>(data)?;

        state.pages.push(Page { cursor, data });
        state.exhausted = next_cursor.is_none();
        state.cursor = next_cursor;
        state.status = QueryStatus::Success;
        state.error = None;
        state.in_flight = false;
        Ok(())
    }

    /// All pages accepted so far, in fetch order.
    pub fn pages(&self) -> Vec<Page<T>> {
        self.lock().pages.clone()
    }

    /// The data of all pages accepted so far, in fetch order.
    pub fn page_data(&self) -> Vec<Arc<T>> {
        self.lock()
            .pages
            .iter()
            .map(|page| Arc::clone(&page.data))
            .collect()
    }

    pub fn has_next_page(&self) -> bool {
        let state = self.lock();
        !state.pages.is_empty() && !state.exhausted
    }

    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    pub fn is_fetching(&self) -> bool {
        self.lock().in_flight
    }

    /// The continuation cursor the next page will be requested with.
    pub fn cursor(&self) -> Option<String> {
        self.lock().cursor.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.lock().status
    }

    pub fn error(&self) -> Option<TransportError> {
        self.lock().error.clone()
    }
}
