//! The declarative descriptions of every query the client knows.
//!
//! A [`QueryDefinition`] bundles how a query is keyed, how it is fetched through the
//! [`DataService`], when it may run and how long its results are kept. The [`Registry`] holds
//! one definition per [`Operation`] and is pure configuration: looking a definition up never
//! performs I/O.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::caching::{CachedData, FetchResult, KeySegment, Lifetimes, QueryKey, TransportError};
use crate::config::{Config, QueryOverrides};
use crate::coordinator::{FetchContext, FetchOptions, RetryDelay, RetryPolicy};
use crate::query_key;
use crate::service::{
    AGENTS_ENDPOINT, AgentListParams, AgentListResponse, DataService, EndpointsConfig,
    MarketplaceParams,
};

/// Every query the client can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    EndpointsConfig,
    AvailableTools,
    ListAgents,
    AgentById,
    ExpandedAgentById,
    AgentCategories,
    MarketplaceAgents,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::EndpointsConfig,
        Operation::AvailableTools,
        Operation::ListAgents,
        Operation::AgentById,
        Operation::ExpandedAgentById,
        Operation::AgentCategories,
        Operation::MarketplaceAgents,
    ];

    /// The name used in logs, metrics and the configuration file.
    pub fn name(self) -> &'static str {
        match self {
            Self::EndpointsConfig => "endpoints",
            Self::AvailableTools => "tools",
            Self::ListAgents => "agents",
            Self::AgentById => "agent",
            Self::ExpandedAgentById => "expanded_agent",
            Self::AgentCategories => "categories",
            Self::MarketplaceAgents => "marketplace",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The parameters of a single query invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryParams {
    None,
    AgentList(AgentListParams),
    AgentId(String),
    Marketplace(MarketplaceParams),
}

impl QueryParams {
    /// Returns the params that request the page starting at `cursor`.
    ///
    /// Params without a cursor field are returned unchanged.
    pub fn with_cursor(&self, cursor: &str) -> Self {
        match self {
            Self::Marketplace(params) => {
                Self::Marketplace(params.with_cursor(Some(cursor.to_owned())))
            }
            Self::AgentList(params) => Self::AgentList(AgentListParams {
                after: Some(cursor.to_owned()),
                ..params.clone()
            }),
            other => other.clone(),
        }
    }
}

type KeyFn = fn(&QueryParams) -> QueryKey;
type FetchFn =
    fn(Arc<dyn DataService>, QueryParams) -> BoxFuture<'static, FetchResult<CachedData>>;
type CursorFn = fn(&CachedData) -> Option<String>;

/// A condition on another cache entry that must hold for a query to run.
#[derive(Clone, Debug)]
pub struct DependencyCheck {
    /// The entry the condition is evaluated on.
    pub key: QueryKey,
    /// Evaluated on the entry's data. An entry without data never satisfies the check.
    pub test: fn(&CachedData) -> bool,
}

/// The options of a query, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    /// Narrows the query's own enablement. `Some(false)` disables it entirely.
    pub enabled: Option<bool>,
    /// Abort fetches once nobody waits for them anymore.
    pub cancel_unobserved: bool,
}

impl QueryOptions {
    fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time,
            retry: RetryPolicy::NONE,
            enabled: None,
            cancel_unobserved: false,
        }
    }

    pub fn lifetimes(&self) -> Lifetimes {
        Lifetimes {
            stale_time: self.stale_time,
            gc_time: self.gc_time,
        }
    }

    fn apply(&mut self, overrides: &QueryOverrides) {
        if let Some(stale_time) = overrides.stale_time {
            self.stale_time = stale_time;
        }
        if let Some(gc_time) = overrides.gc_time {
            self.gc_time = gc_time;
        }
        if let Some(retries) = overrides.retries {
            self.retry.retries = retries;
            if overrides.retry_delay.is_none() {
                self.retry.delay = RetryDelay::default();
            }
        }
        if let Some(delay) = overrides.retry_delay {
            self.retry.delay = RetryDelay::Fixed(delay);
        }
        if overrides.enabled.is_some() {
            self.enabled = overrides.enabled;
        }
        if let Some(cancel_unobserved) = overrides.cancel_unobserved {
            self.cancel_unobserved = cancel_unobserved;
        }
    }
}

/// The description of one query.
#[derive(Clone)]
pub struct QueryDefinition {
    pub operation: Operation,
    key: KeyFn,
    fetch: FetchFn,
    /// A condition on the params alone.
    pub static_predicate: Option<fn(&QueryParams) -> bool>,
    pub dependencies: Vec<DependencyCheck>,
    pub options: QueryOptions,
    /// Extracts the continuation cursor from a page, for paginated queries.
    pub extract_cursor: Option<CursorFn>,
}

impl fmt::Debug for QueryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDefinition")
            .field("operation", &self.operation)
            .field("has_static_predicate", &self.static_predicate.is_some())
            .field("dependencies", &self.dependencies)
            .field("options", &self.options)
            .field("paginated", &self.extract_cursor.is_some())
            .finish()
    }
}

impl QueryDefinition {
    pub fn name(&self) -> &'static str {
        self.operation.name()
    }

    pub fn key(&self, params: &QueryParams) -> QueryKey {
        (self.key)(params)
    }

    /// The key a single page is cached under.
    ///
    /// The first page uses a `null` cursor segment.
    pub fn page_key(&self, params: &QueryParams, cursor: Option<&str>) -> QueryKey {
        self.key(params).with(cursor)
    }

    pub fn is_paginated(&self) -> bool {
        self.extract_cursor.is_some()
    }

    /// Fetches the query through `service`, honoring the timeout in `ctx`.
    pub fn fetch(
        &self,
        service: Arc<dyn DataService>,
        params: QueryParams,
        ctx: FetchContext,
    ) -> BoxFuture<'static, FetchResult<CachedData>> {
        let future = (self.fetch)(service, params);
        match ctx.timeout {
            Some(timeout) => async move {
                tokio::time::timeout(timeout, future)
                    .await
                    .unwrap_or(Err(TransportError::Timeout(timeout)))
            }
            .boxed(),
            None => future,
        }
    }

    /// The coordinator options derived from this definition.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            retry: self.options.retry,
            cancel_unobserved: self.options.cancel_unobserved,
            ..FetchOptions::new(self.name(), self.options.lifetimes())
        }
    }
}

fn erase<T: Any + Send + Sync>(value: T) -> CachedData {
    Arc::new(value)
}

/// Boxes a typed fetch and erases the type of its data.
fn erased<T, F>(future: F) -> BoxFuture<'static, FetchResult<CachedData>>
where
    T: Any + Send + Sync,
    F: Future<Output = FetchResult<T>> + Send + 'static,
{
    future.map(|result| result.map(erase)).boxed()
}

fn mismatched_params(operation: Operation, params: &QueryParams) -> TransportError {
    tracing::error!(%operation, ?params, "Query invoked with mismatched params");
    TransportError::InternalError
}

fn agents_endpoint_enabled(data: &CachedData) -> bool {
    data.downcast_ref::<EndpointsConfig>()
        .is_some_and(|config| config.has_endpoint(AGENTS_ENDPOINT))
}

fn agent_id_segment(params: &QueryParams) -> KeySegment {
    match params {
        QueryParams::AgentId(id) => id.into(),
        _ => KeySegment::Null,
    }
}

fn endpoints_definition(gc_time: Duration) -> QueryDefinition {
    QueryDefinition {
        operation: Operation::EndpointsConfig,
        key: |_| query_key!["endpoints"],
        fetch: |service, _| erased(async move { service.get_endpoints_config().await }),
        static_predicate: None,
        dependencies: Vec::new(),
        options: QueryOptions::new(Duration::ZERO, gc_time),
        extract_cursor: None,
    }
}

fn agents_endpoint_dependency() -> DependencyCheck {
    DependencyCheck {
        key: query_key!["endpoints"],
        test: agents_endpoint_enabled,
    }
}

fn tools_definition(gc_time: Duration) -> QueryDefinition {
    QueryDefinition {
        operation: Operation::AvailableTools,
        key: |_| query_key!["tools"],
        fetch: |service, _| erased(async move { service.get_available_agent_tools().await }),
        static_predicate: None,
        dependencies: vec![agents_endpoint_dependency()],
        options: QueryOptions::new(Duration::ZERO, gc_time),
        extract_cursor: None,
    }
}

fn agents_definition(gc_time: Duration) -> QueryDefinition {
    QueryDefinition {
        operation: Operation::ListAgents,
        key: |params| match params {
            QueryParams::AgentList(params) => query_key!["agents", params.key_segment()],
            _ => query_key!["agents"],
        },
        fetch: |service, params| {
            erased(async move {
                match params {
                    QueryParams::AgentList(params) => service.list_agents(&params).await,
                    other => Err(mismatched_params(Operation::ListAgents, &other)),
                }
            })
        },
        static_predicate: None,
        dependencies: vec![agents_endpoint_dependency()],
        options: QueryOptions::new(Duration::from_secs(5), gc_time),
        extract_cursor: None,
    }
}

fn agent_definition(gc_time: Duration) -> QueryDefinition {
    QueryDefinition {
        operation: Operation::AgentById,
        key: |params| query_key!["agent", agent_id_segment(params)],
        fetch: |service, params| {
            erased(async move {
                match params {
                    QueryParams::AgentId(agent_id) => service.get_agent_by_id(&agent_id).await,
                    other => Err(mismatched_params(Operation::AgentById, &other)),
                }
            })
        },
        static_predicate: None,
        dependencies: Vec::new(),
        options: QueryOptions::new(Duration::ZERO, gc_time),
        extract_cursor: None,
    }
}

fn expanded_agent_definition(gc_time: Duration) -> QueryDefinition {
    QueryDefinition {
        operation: Operation::ExpandedAgentById,
        key: |params| query_key!["agent", agent_id_segment(params), "expanded"],
        fetch: |service, params| {
            erased(async move {
                match params {
                    QueryParams::AgentId(agent_id) => {
                        service.get_expanded_agent_by_id(&agent_id).await
                    }
                    other => Err(mismatched_params(Operation::ExpandedAgentById, &other)),
                }
            })
        },
        static_predicate: None,
        dependencies: Vec::new(),
        options: QueryOptions::new(Duration::ZERO, gc_time),
        extract_cursor: None,
    }
}

fn categories_definition(gc_time: Duration) -> QueryDefinition {
    QueryDefinition {
        operation: Operation::AgentCategories,
        key: |_| query_key!["agentCategories"],
        fetch: |service, _| erased(async move { service.get_agent_categories().await }),
        static_predicate: None,
        dependencies: Vec::new(),
        options: QueryOptions::new(Duration::from_secs(5 * 60), gc_time),
        extract_cursor: None,
    }
}

fn marketplace_definition() -> QueryDefinition {
    QueryDefinition {
        operation: Operation::MarketplaceAgents,
        key: |params| match params {
            QueryParams::Marketplace(params) => {
                query_key!["marketplaceAgents", params.key_segment()]
            }
            _ => query_key!["marketplaceAgents"],
        },
        fetch: |service, params| {
            erased(async move {
                match params {
                    QueryParams::Marketplace(params) => {
                        service.get_marketplace_agents(&params).await
                    }
                    other => Err(mismatched_params(Operation::MarketplaceAgents, &other)),
                }
            })
        },
        static_predicate: Some(|params| {
            matches!(params, QueryParams::Marketplace(params) if params.required_permission != 0)
        }),
        dependencies: Vec::new(),
        options: QueryOptions::new(Duration::from_secs(2 * 60), Duration::from_secs(10 * 60)),
        extract_cursor: Some(|data| {
            data.downcast_ref::<AgentListResponse>()
                .and_then(|page| page.after.clone())
        }),
    }
}

/// One [`QueryDefinition`] per [`Operation`].
#[derive(Clone, Debug)]
pub struct Registry {
    definitions: [QueryDefinition; 7],
}

impl Registry {
    /// Creates the registry with the built-in options of every query.
    pub fn new() -> Self {
        Self::with_default_gc_time(Duration::from_secs(5 * 60))
    }

    fn with_default_gc_time(gc_time: Duration) -> Self {
        let definitions = Operation::ALL.map(|operation| match operation {
            Operation::EndpointsConfig => endpoints_definition(gc_time),
            Operation::AvailableTools => tools_definition(gc_time),
            Operation::ListAgents => agents_definition(gc_time),
            Operation::AgentById => agent_definition(gc_time),
            Operation::ExpandedAgentById => expanded_agent_definition(gc_time),
            Operation::AgentCategories => categories_definition(gc_time),
            Operation::MarketplaceAgents => marketplace_definition(),
        });
        Self { definitions }
    }

    /// Creates the registry and applies the per-query overrides of `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::with_default_gc_time(config.cache.default_gc_time);
        for definition in &mut registry.definitions {
            let overrides = config.queries.for_operation(definition.operation);
            definition.options.apply(overrides);
        }
        registry
    }

    pub fn definition_for(&self, operation: Operation) -> &QueryDefinition {
        // `definitions` is built in the order of `Operation::ALL`, which is declaration order.
        &self.definitions[operation as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.definitions.iter()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
