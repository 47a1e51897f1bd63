//! Helpers for testing the query layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`MockDataService`] answers from memory and counts every call, which is the fastest way
//!    to test the query layer. Use [`HitCounter`] to test the HTTP transport end to end.
//!
//!  - When using [`HitCounter`], make sure that it is held until all requests to it have been
//!    made. If the server is dropped, all connections to it fail.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{self, Query, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use agentquery_service::caching::{FetchResult, TransportError};
use agentquery_service::service::{
    Agent, AgentListParams, AgentListResponse, Category, DataService, EndpointsConfig,
    MarketplaceParams, ToolDescriptor,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `agentquery-service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("agentquery_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates an agent with the given id and a generated name.
pub fn agent(id: &str) -> Agent {
    serde_json::from_value(json!({ "id": id, "name": format!("Agent {id}") })).unwrap()
}

/// Creates a page of `count` agents whose ids start with `prefix`.
pub fn agent_page(prefix: &str, count: usize, after: Option<&str>) -> AgentListResponse {
    let data: Vec<_> = (0..count).map(|i| agent(&format!("{prefix}_{i}"))).collect();
    AgentListResponse {
        first_id: data.first().map(|agent| agent.id.clone()),
        last_id: data.last().map(|agent| agent.id.clone()),
        data,
        after: after.map(str::to_owned),
        has_more: after.is_some(),
    }
}

pub fn category(value: &str) -> Category {
    serde_json::from_value(json!({ "value": value, "label": value.to_uppercase() })).unwrap()
}

pub fn tool(name: &str) -> ToolDescriptor {
    serde_json::from_value(json!({ "name": name, "pluginKey": name })).unwrap()
}

/// An endpoints config that enables the agents endpoint.
pub fn endpoints_with_agents() -> EndpointsConfig {
    serde_json::from_value(json!({ "agents": { "disableBuilder": false }, "openAI": {} })).unwrap()
}

/// The names of the [`DataService`] methods, as used by [`MockDataService`].
pub mod methods {
    pub const ENDPOINTS: &str = "get_endpoints_config";
    pub const TOOLS: &str = "get_available_agent_tools";
    pub const LIST_AGENTS: &str = "list_agents";
    pub const AGENT: &str = "get_agent_by_id";
    pub const EXPANDED_AGENT: &str = "get_expanded_agent_by_id";
    pub const CATEGORIES: &str = "get_agent_categories";
    pub const MARKETPLACE: &str = "get_marketplace_agents";
}

#[derive(Debug, Default)]
struct MockState {
    endpoints: EndpointsConfig,
    tools: Vec<ToolDescriptor>,
    agents: Vec<Agent>,
    categories: Vec<Category>,
    marketplace: BTreeMap<Option<String>, AgentListResponse>,
    latency: Duration,
    delays: VecDeque<Duration>,
    failures: BTreeMap<&'static str, VecDeque<TransportError>>,
    calls: BTreeMap<&'static str, usize>,
    agent_list_requests: Vec<AgentListParams>,
    marketplace_requests: Vec<MarketplaceParams>,
}

/// An in-memory [`DataService`] with call counters and controllable latency and failures.
///
/// Every call first waits for the next [pushed delay](Self::push_delay), or the
/// [latency](Self::set_latency) if none is left, and then fails with the next
/// [queued failure](Self::fail_next) of its method, if any.
#[derive(Debug, Default)]
pub struct MockDataService {
    state: Mutex<MockState>,
}

impl MockDataService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_endpoints(&self, endpoints: EndpointsConfig) {
        self.state.lock().unwrap().endpoints = endpoints;
    }

    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        self.state.lock().unwrap().tools = tools;
    }

    pub fn set_agents(&self, agents: Vec<Agent>) {
        self.state.lock().unwrap().agents = agents;
    }

    pub fn set_categories(&self, categories: Vec<Category>) {
        self.state.lock().unwrap().categories = categories;
    }

    /// Serves `page` for marketplace requests starting at `cursor`.
    pub fn set_marketplace_page(&self, cursor: Option<&str>, page: AgentListResponse) {
        self.state
            .lock()
            .unwrap()
            .marketplace
            .insert(cursor.map(str::to_owned), page);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Delays the next call that has no pushed delay yet by `delay`.
    pub fn push_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delays.push_back(delay);
    }

    /// Fails the next call of `method` that has no queued failure yet with `error`.
    pub fn fail_next(&self, method: &'static str, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// The number of calls of `method` so far.
    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }

    pub fn agent_list_requests(&self) -> Vec<AgentListParams> {
        self.state.lock().unwrap().agent_list_requests.clone()
    }

    pub fn marketplace_requests(&self) -> Vec<MarketplaceParams> {
        self.state.lock().unwrap().marketplace_requests.clone()
    }

    fn find_agent(&self, agent_id: &str) -> FetchResult<Agent> {
        let state = self.state.lock().unwrap();
        state
            .agents
            .iter()
            .find(|agent| agent.id == agent_id)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    /// Counts the call, waits for its delay and returns `response` unless a failure is queued.
    ///
    /// The response is captured when the call starts, so later changes to the mock do not
    /// affect calls that are already running.
    async fn respond<T>(&self, method: &'static str, response: FetchResult<T>) -> FetchResult<T> {
        let (delay, failure) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(method).or_default() += 1;
            let latency = state.latency;
            let delay = state.delays.pop_front().unwrap_or(latency);
            let failure = state.failures.get_mut(method).and_then(VecDeque::pop_front);
            (delay, failure)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(error) => Err(error),
            None => response,
        }
    }
}

#[async_trait]
impl DataService for MockDataService {
    async fn get_endpoints_config(&self) -> FetchResult<EndpointsConfig> {
        let endpoints = self.state.lock().unwrap().endpoints.clone();
        self.respond(methods::ENDPOINTS, Ok(endpoints)).await
    }

    async fn get_available_agent_tools(&self) -> FetchResult<Vec<ToolDescriptor>> {
        let tools = self.state.lock().unwrap().tools.clone();
        self.respond(methods::TOOLS, Ok(tools)).await
    }

    async fn list_agents(&self, params: &AgentListParams) -> FetchResult<AgentListResponse> {
        let data: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.agent_list_requests.push(params.clone());
            state
                .agents
                .iter()
                .take(params.limit as usize)
                .cloned()
                .collect()
        };
        let page = AgentListResponse {
            first_id: data.first().map(|agent| agent.id.clone()),
            last_id: data.last().map(|agent| agent.id.clone()),
            data,
            ..Default::default()
        };
        self.respond(methods::LIST_AGENTS, Ok(page)).await
    }

    async fn get_agent_by_id(&self, agent_id: &str) -> FetchResult<Agent> {
        let agent = self.find_agent(agent_id);
        self.respond(methods::AGENT, agent).await
    }

    async fn get_expanded_agent_by_id(&self, agent_id: &str) -> FetchResult<Agent> {
        let agent = self.find_agent(agent_id).map(|mut agent| {
            agent.extra.insert("expanded".into(), Value::Bool(true));
            agent
        });
        self.respond(methods::EXPANDED_AGENT, agent).await
    }

    async fn get_agent_categories(&self) -> FetchResult<Vec<Category>> {
        let categories = self.state.lock().unwrap().categories.clone();
        self.respond(methods::CATEGORIES, Ok(categories)).await
    }

    async fn get_marketplace_agents(
        &self,
        params: &MarketplaceParams,
    ) -> FetchResult<AgentListResponse> {
        let page = {
            let mut state = self.state.lock().unwrap();
            state.marketplace_requests.push(params.clone());
            state
                .marketplace
                .get(&params.cursor)
                .cloned()
                .ok_or(TransportError::NotFound)
        };
        self.respond(methods::MARKETPLACE, page).await
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The bearer token [`HitCounter`] accepts.
pub const AUTH_TOKEN: &str = "test-token";

/// A fixture agents API that counts the requests it receives.
///
/// All routes live under `/api/`:
///
///  - `agents/missing`, `agents/forbidden` and `agents/broken` answer with 404, 403 and 502.
///  - `agents/garbage` answers with a body that is not JSON.
///  - `agents/slow` answers after two seconds.
///  - Every other agent id is found.
///  - `agents/marketplace` serves three pages, continued with the cursors `page2` and `page3`.
///
/// Requests carrying a bearer token other than [`AUTH_TOKEN`] are rejected with 401.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

async fn check_auth(headers: HeaderMap, req: Request, next: Next) -> Response {
    let expected = format!("Bearer {AUTH_TOKEN}");
    match headers.get(header::AUTHORIZATION) {
        Some(value) if value.as_bytes() != expected.as_bytes() => {
            (StatusCode::UNAUTHORIZED, "invalid token").into_response()
        }
        _ => next.run(req).await,
    }
}

async fn agent_route(extract::Path(agent_id): extract::Path<String>) -> Response {
    match agent_id.as_str() {
        "missing" => StatusCode::NOT_FOUND.into_response(),
        "forbidden" => (StatusCode::FORBIDDEN, "requires EDIT").into_response(),
        "broken" => (StatusCode::BAD_GATEWAY, "upstream down").into_response(),
        "garbage" => "definitely not json".into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(agent(&agent_id)).into_response()
        }
        _ => Json(agent(&agent_id)).into_response(),
    }
}

async fn marketplace_route(Query(query): Query<BTreeMap<String, String>>) -> Response {
    let page = match query.get("cursor").map(String::as_str) {
        None => agent_page("market", 2, Some("page2")),
        Some("page2") => agent_page("market_p2", 2, Some("page3")),
        Some("page3") => agent_page("market_p3", 1, None),
        Some(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    Json(page).into_response()
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let api = Router::new()
            .route(
                "/endpoints",
                get(|| async { Json(endpoints_with_agents()) }),
            )
            .route(
                "/agents",
                get(|Query(query): Query<BTreeMap<String, String>>| async move {
                    let limit = query
                        .get("limit")
                        .and_then(|limit| limit.parse().ok())
                        .unwrap_or(10);
                    Json(agent_page("listed", limit, None))
                }),
            )
            .route(
                "/agents/tools",
                get(|| async { Json(vec![tool("web_search"), tool("execute_code")]) }),
            )
            .route(
                "/agents/categories",
                get(|| async { Json(vec![category("general"), category("hr")]) }),
            )
            .route("/agents/marketplace", get(marketplace_route))
            .route("/agents/:agent_id", get(agent_route))
            .route(
                "/agents/:agent_id/expanded",
                get(|extract::Path(agent_id): extract::Path<String>| async move {
                    let mut agent = agent(&agent_id);
                    agent.extra.insert("expanded".into(), Value::Bool(true));
                    Json(agent)
                }),
            )
            .layer(middleware::from_fn(check_auth));

        let router = Router::new()
            .nest("/api", api)
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns and resets the number of requests received.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the requests received, keyed by path and query.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The base URL of the fixture API.
    pub fn api_url(&self) -> Url {
        self.server.url("api/")
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
