//! A [`DataService`] talking to the agents REST API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::caching::{FetchResult, TransportError};
use crate::config::ApiConfig;
use crate::service::{
    Agent, AgentListParams, AgentListResponse, Category, DataService, EndpointsConfig,
    MarketplaceParams, ToolDescriptor,
};

/// The user agent sent with every request.
pub const USER_AGENT: &str = concat!("agentquery/", env!("CARGO_PKG_VERSION"));

/// Fetches query data from the agents API over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDataService {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpDataService {
    /// Creates the service from the `api` section of the config.
    ///
    /// Fails if no base URL is configured.
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("no API base URL configured")?;

        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .user_agent(USER_AGENT)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: with_trailing_slash(base_url),
            auth_token: config.auth_token.clone(),
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL, appending `segments` percent-encoded.
    fn url(&self, path: &str, segments: &[&str]) -> FetchResult<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(TransportError::from_std_error)?;
        if !segments.is_empty() {
            url.path_segments_mut()
                .map_err(|()| TransportError::InternalError)?
                .pop_if_empty()
                .extend(segments);
        }
        Ok(url)
    }

    async fn get<T, Q>(&self, url: Url, query: Option<&Q>) -> FetchResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        tracing::debug!("Fetching `{}`", url);

        let mut builder = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(query) = query {
            builder = builder.query(query);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, "Request failed");
            return Err(TransportError::from_status(status, error_details(status, body)));
        }

        let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn error_details(status: StatusCode, body: String) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    }
}

#[async_trait]
impl DataService for HttpDataService {
    async fn get_endpoints_config(&self) -> FetchResult<EndpointsConfig> {
        self.get(self.url("endpoints", &[])?, None::<&()>).await
    }

    async fn get_available_agent_tools(&self) -> FetchResult<Vec<ToolDescriptor>> {
        self.get(self.url("agents/tools", &[])?, None::<&()>).await
    }

    async fn list_agents(&self, params: &AgentListParams) -> FetchResult<AgentListResponse> {
        self.get(self.url("agents", &[])?, Some(params)).await
    }

    async fn get_agent_by_id(&self, agent_id: &str) -> FetchResult<Agent> {
        self.get(self.url("agents/", &[agent_id])?, None::<&()>)
            .await
    }

    async fn get_expanded_agent_by_id(&self, agent_id: &str) -> FetchResult<Agent> {
        self.get(self.url("agents/", &[agent_id, "expanded"])?, None::<&()>)
            .await
    }

    async fn get_agent_categories(&self) -> FetchResult<Vec<Category>> {
        self.get(self.url("agents/categories", &[])?, None::<&()>)
            .await
    }

    async fn get_marketplace_agents(
        &self,
        params: &MarketplaceParams,
    ) -> FetchResult<AgentListResponse> {
        self.get(self.url("agents/marketplace", &[])?, Some(params))
            .await
    }
}
