//! The explicit context object callers run queries through.
//!
//! A [`QueryClient`] owns one [`CacheStore`] together with the [`RequestCoordinator`] and
//! [`EnablementResolver`] working on it. Dropping the client tears everything down.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::caching::{
    CacheStore, CachedData, EntryUpdate, KeyFilter, QueryKey, QueryState, QueryStatus,
    StoreSubscription, downcast,
};
use crate::config::Config;
use crate::coordinator::{FetchHandle, FetchOptions, RequestCoordinator};
use crate::definitions::{Operation, QueryDefinition, QueryParams, Registry};
use crate::enablement::EnablementResolver;
use crate::pagination::PaginatedFetcher;
use crate::service::{
    Agent, AgentListParams, AgentListResponse, Category, DataService, EndpointsConfig,
    MarketplaceParams, ToolDescriptor,
};

/// The paginated marketplace listing.
pub type InfiniteQuery = PaginatedFetcher<AgentListResponse>;

/// Per-call options of a query.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryConfig {
    /// Narrows the query's enablement. `Some(false)` keeps the query from running.
    pub enabled: Option<bool>,
    /// Fetch even if fresh data is cached, superseding a pending fetch.
    pub force_refresh: bool,
    /// Return stale data right away and refresh it in the background.
    pub serve_stale: bool,
    pub timeout: Option<Duration>,
}

impl QueryConfig {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    fn fetch_options(&self, definition: &QueryDefinition) -> FetchOptions {
        let mut options = definition.fetch_options();
        options.force_refresh = self.force_refresh;
        options.timeout = self.timeout;
        options
    }
}

pub struct QueryClient {
    store: Arc<CacheStore>,
    coordinator: RequestCoordinator,
    resolver: EnablementResolver,
    registry: Registry,
    service: Arc<dyn DataService>,
    collector: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl QueryClient {
    /// Creates a client with an empty store and the built-in query options.
    ///
    /// Must be called within a tokio runtime, as it spawns the garbage collector.
    pub fn new(service: Arc<dyn DataService>) -> Self {
        Self::with_registry(service, Registry::new(), Config::default().cache.gc_interval)
    }

    /// Creates a client with the cache settings and query overrides of `config`.
    pub fn from_config(service: Arc<dyn DataService>, config: &Config) -> Self {
        Self::with_registry(service, Registry::from_config(config), config.cache.gc_interval)
    }

    fn with_registry(
        service: Arc<dyn DataService>,
        registry: Registry,
        gc_interval: Duration,
    ) -> Self {
        let store = Arc::new(CacheStore::new());
        let collector = store.spawn_collector(gc_interval);
        Self {
            coordinator: RequestCoordinator::new(Arc::clone(&store)),
            resolver: EnablementResolver::new(Arc::clone(&store)),
            store,
            registry,
            service,
            collector: Some(collector),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolver(&self) -> &EnablementResolver {
        &self.resolver
    }

    /// Fetches the endpoint configuration the agent queries depend on.
    pub async fn endpoints_config(&self) -> QueryState<EndpointsConfig> {
        self.query(Operation::EndpointsConfig, QueryParams::None, QueryConfig::default())
            .await
    }

    pub async fn available_tools(&self) -> QueryState<Vec<ToolDescriptor>> {
        self.query(Operation::AvailableTools, QueryParams::None, QueryConfig::default())
            .await
    }

    pub async fn list_agents(
        &self,
        params: AgentListParams,
        config: QueryConfig,
    ) -> QueryState<AgentListResponse> {
        self.query(Operation::ListAgents, QueryParams::AgentList(params), config)
            .await
    }

    pub async fn agent_by_id(&self, agent_id: &str, config: QueryConfig) -> QueryState<Agent> {
        let params = QueryParams::AgentId(agent_id.to_owned());
        self.query(Operation::AgentById, params, config).await
    }

    /// Fetches an agent including the fields only visible to editors.
    ///
    /// The caller is expected to pass `enabled: Some(false)` without edit permission.
    pub async fn expanded_agent_by_id(
        &self,
        agent_id: &str,
        config: QueryConfig,
    ) -> QueryState<Agent> {
        let params = QueryParams::AgentId(agent_id.to_owned());
        self.query(Operation::ExpandedAgentById, params, config).await
    }

    pub async fn agent_categories(&self, config: QueryConfig) -> QueryState<Vec<Category>> {
        self.query(Operation::AgentCategories, QueryParams::None, config)
            .await
    }

    /// Starts the paginated marketplace listing and fetches its first page.
    ///
    /// A failed first page is recorded in the returned query.
    pub async fn marketplace_agents(
        &self,
        params: MarketplaceParams,
        config: QueryConfig,
    ) -> InfiniteQuery {
        let params = QueryParams::Marketplace(params);
        let pages = self.paginated(Operation::MarketplaceAgents, params, config);
        if let Err(error) = pages.fetch_first_page().await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "Failed to fetch the first marketplace page"
            );
        }
        pages
    }

    /// Creates an accumulator for a paginated query without fetching anything.
    ///
    /// Every page is fetched with the timeout and refresh behavior of `config`.
    pub fn paginated<T: Any + Send + Sync>(
        &self,
        operation: Operation,
        params: QueryParams,
        config: QueryConfig,
    ) -> PaginatedFetcher<T> {
        let definition = self.registry.definition_for(operation);
        let options = config.fetch_options(definition);
        PaginatedFetcher::new(
            definition.clone(),
            params,
            config.enabled,
            self.coordinator.clone(),
            self.resolver.clone(),
            Arc::clone(&self.service),
        )
        .with_options(options)
    }

    /// Runs `operation` and returns its state once it settled.
    ///
    /// Disabled queries never fetch and return the cached state as is, which is
    /// [`Idle`](QueryStatus::Idle) if nothing is cached.
    pub async fn query<T: Any + Send + Sync>(
        &self,
        operation: Operation,
        params: QueryParams,
        config: QueryConfig,
    ) -> QueryState<T> {
        let definition = self.registry.definition_for(operation);
        let key = definition.key(&params);

        let enablement = self.resolver.evaluate(definition, &params, config.enabled);
        if !enablement.is_enabled() {
            tracing::trace!(%key, ?enablement, "Query is disabled");
            metric!(counter("query.disabled") += 1, "query" => definition.name());
            return QueryState::from_entry(self.store.peek(&key).as_ref());
        }

        let stale = if config.serve_stale && !config.force_refresh {
            self.store.get(&key).and_then(|entry| entry.data)
        } else {
            None
        };

        let handle = self.fetch(definition, &key, params, config);
        if let Some(data) = stale.filter(|_| !handle.is_cached()) {
            tracing::trace!(%key, "Serving stale data while revalidating");
            handle.detach();
            return success(data);
        }

        match handle.await {
            Ok(data) => success(data),
            Err(error) => {
                let previous = self.store.peek(&key).and_then(|entry| entry.data::<T>());
                QueryState {
                    status: QueryStatus::Error,
                    data: previous,
                    error: Some(error),
                }
            }
        }
    }

    fn fetch(
        &self,
        definition: &QueryDefinition,
        key: &QueryKey,
        params: QueryParams,
        config: QueryConfig,
    ) -> FetchHandle {
        let options = config.fetch_options(definition);
        let definition = definition.clone();
        let service = Arc::clone(&self.service);
        self.coordinator.fetch(key, options, move |ctx| {
            definition.fetch(Arc::clone(&service), params.clone(), ctx)
        })
    }

    /// Registers an observer of `operation`, which keeps its entry from being collected.
    pub fn observe<T: Any + Send + Sync>(
        &self,
        operation: Operation,
        params: &QueryParams,
    ) -> QueryObserver<T> {
        let key = self.registry.definition_for(operation).key(params);
        QueryObserver {
            subscription: self.store.subscribe(&key),
            store: Arc::clone(&self.store),
            _data: PhantomData,
        }
    }

    /// Returns the cached state of `operation` without fetching.
    pub fn get_query_state<T: Any + Send + Sync>(
        &self,
        operation: Operation,
        params: &QueryParams,
    ) -> QueryState<T> {
        let key = self.registry.definition_for(operation).key(params);
        QueryState::from_entry(self.store.peek(&key).as_ref())
    }

    /// Writes `data` as the result of `operation`, as if it had just been fetched.
    pub fn set_query_data<T: Any + Send + Sync>(
        &self,
        operation: Operation,
        params: &QueryParams,
        data: T,
    ) {
        let definition = self.registry.definition_for(operation);
        let key = definition.key(params);
        tracing::debug!(%key, "Setting query data");
        self.store.set(
            &key,
            EntryUpdate::Data {
                data: Arc::new(data),
                lifetimes: definition.options.lifetimes(),
            },
        );
    }

    /// Marks the matching entries stale, so their next access refetches them.
    pub fn invalidate(&self, filter: &KeyFilter) -> usize {
        self.store.invalidate(filter)
    }

    /// Marks every entry of `operation` stale, across all params.
    pub fn invalidate_operation(&self, operation: Operation) -> usize {
        let key = self.registry.definition_for(operation).key(&QueryParams::None);
        let prefix = match key.segments().first() {
            Some(name) => QueryKey::from_segments(vec![name.clone()]),
            None => return 0,
        };
        self.invalidate(&KeyFilter::Prefix(prefix))
    }

    /// Stops the collector, cancels all pending fetches and drops all entries.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.abort();
            self.coordinator.cancel_all();
            self.store.clear();
            tracing::debug!("Query client shut down");
        }
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn success<T: Any + Send + Sync>(data: CachedData) -> QueryState<T> {
    match downcast::<T>(data) {
        Ok(data) => QueryState {
            status: QueryStatus::Success,
            data: Some(data),
            error: None,
        },
        Err(error) => QueryState {
            status: QueryStatus::Error,
            data: None,
            error: Some(error),
        },
    }
}

/// Follows the cached state of a single query.
///
/// As long as the observer is alive, the entry is not garbage collected.
#[derive(Debug)]
pub struct QueryObserver<T> {
    subscription: StoreSubscription,
    store: Arc<CacheStore>,
    _data: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> QueryObserver<T> {
    pub fn key(&self) -> &QueryKey {
        self.subscription.key()
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        QueryState::from_entry(self.store.peek(self.key()).as_ref())
    }

    /// Waits for the next change and returns the new state.
    ///
    /// Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<QueryState<T>> {
        if self.subscription.changed().await {
            Some(self.state())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::caching::{FetchResult, TransportError};

    #[derive(Debug, Default)]
    struct Offline;

    #[async_trait]
    impl DataService for Offline {
        async fn get_endpoints_config(&self) -> FetchResult<EndpointsConfig> {
            Err(TransportError::RequestFailed("offline".into()))
        }
        async fn get_available_agent_tools(&self) -> FetchResult<Vec<ToolDescriptor>> {
            Err(TransportError::RequestFailed("offline".into()))
        }
        async fn list_agents(&self, _: &AgentListParams) -> FetchResult<AgentListResponse> {
            Err(TransportError::RequestFailed("offline".into()))
        }
        async fn get_agent_by_id(&self, _: &str) -> FetchResult<Agent> {
            Err(TransportError::NotFound)
        }
        async fn get_expanded_agent_by_id(&self, _: &str) -> FetchResult<Agent> {
            Err(TransportError::NotFound)
        }
        async fn get_agent_categories(&self) -> FetchResult<Vec<Category>> {
            Err(TransportError::RequestFailed("offline".into()))
        }
        async fn get_marketplace_agents(
            &self,
            _: &MarketplaceParams,
        ) -> FetchResult<AgentListResponse> {
            Err(TransportError::RequestFailed("offline".into()))
        }
    }

    fn category(value: &str) -> Category {
        serde_json::from_value(serde_json::json!({ "value": value, "label": value })).unwrap()
    }

    #[tokio::test]
    async fn test_error_keeps_seeded_data() {
        let client = QueryClient::new(Arc::new(Offline));
        client.set_query_data(
            Operation::AgentCategories,
            &QueryParams::None,
            vec![category("tools")],
        );
        client.invalidate_operation(Operation::AgentCategories);

        let state = client.agent_categories(QueryConfig::default()).await;
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(
            state.error,
            Some(TransportError::RequestFailed("offline".into()))
        );
        assert_eq!(state.data.unwrap()[0].value, "tools");
    }

    #[tokio::test]
    async fn test_disabled_query_stays_idle() {
        let client = QueryClient::new(Arc::new(Offline));
        let state = client
            .agent_by_id("agent_1", QueryConfig::enabled(false))
            .await;
        assert!(state.is_idle());
        assert!(client.store().is_empty());
    }

    #[tokio::test]
    async fn test_get_query_state_downcasts() {
        let client = QueryClient::new(Arc::new(Offline));
        let params = QueryParams::None;
        assert!(
            client
                .get_query_state::<Vec<Category>>(Operation::AgentCategories, &params)
                .is_idle()
        );

        client.set_query_data(Operation::AgentCategories, &params, vec![category("a")]);
        let state = client.get_query_state::<Vec<Category>>(Operation::AgentCategories, &params);
        assert!(state.is_success());

        let mismatched = client.get_query_state::<Agent>(Operation::AgentCategories, &params);
        assert_eq!(mismatched.error, Some(TransportError::InternalError));
    }

    #[tokio::test]
    async fn test_shutdown_clears_store() {
        let client = QueryClient::new(Arc::new(Offline));
        let store = Arc::clone(client.store());
        client.set_query_data(
            Operation::AgentCategories,
            &QueryParams::None,
            Vec::<Category>::new(),
        );
        assert_eq!(store.len(), 1);

        client.shutdown();
        assert!(store.is_empty());
    }
}
