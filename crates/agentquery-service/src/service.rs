//! Types of the remote agents API and the [`DataService`] interface the query layer fetches
//! through.
//!
//! Entities only model the fields this layer inspects. Everything else the API returns is kept
//! verbatim in a flattened `extra` map, so nothing is lost when data is handed on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::caching::{FetchResult, KeySegment};

/// Permission bits understood by the agents API.
pub mod permissions {
    pub const VIEW: u32 = 1;
    pub const EDIT: u32 = 2;
    pub const DELETE: u32 = 4;
    pub const SHARE: u32 = 8;
}

/// The endpoint name that gates every agent related query.
pub const AGENTS_ENDPOINT: &str = "agents";

type Extra = serde_json::Map<String, serde_json::Value>;

/// The configured model endpoints, keyed by endpoint name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointsConfig(pub BTreeMap<String, serde_json::Value>);

impl EndpointsConfig {
    /// Whether `endpoint` is configured with a value other than `null` or `false`.
    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        !matches!(
            self.0.get(endpoint),
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false))
        )
    }
}

/// A tool that can be attached to an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A marketplace category, as shown in the marketplace tabs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub value: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// One page of agents, shared by the agent list and the marketplace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentListResponse {
    #[serde(default)]
    pub data: Vec<Agent>,
    /// The continuation cursor. Absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListParams {
    pub limit: u32,
    pub required_permission: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl Default for AgentListParams {
    fn default() -> Self {
        Self {
            limit: 10,
            required_permission: permissions::EDIT,
            category: None,
            search: None,
            after: None,
        }
    }
}

impl AgentListParams {
    pub(crate) fn key_segment(&self) -> KeySegment {
        KeySegment::map([
            ("limit", Some(self.limit.into())),
            ("requiredPermission", Some(self.required_permission.into())),
            ("category", self.category.as_ref().map(Into::into)),
            ("search", self.search.as_ref().map(Into::into)),
            ("after", self.after.as_ref().map(Into::into)),
        ])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceParams {
    /// Must be non-zero for the marketplace query to run.
    pub required_permission: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted: Option<u8>,
    /// Where the first page starts. Continuation pages replace it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl MarketplaceParams {
    pub(crate) fn key_segment(&self) -> KeySegment {
        KeySegment::map([
            ("requiredPermission", Some(self.required_permission.into())),
            ("category", self.category.as_ref().map(Into::into)),
            ("search", self.search.as_ref().map(Into::into)),
            ("limit", self.limit.map(Into::into)),
            ("promoted", self.promoted.map(Into::into)),
            ("cursor", self.cursor.as_ref().map(Into::into)),
        ])
    }

    /// Returns a copy of these params that continues at `cursor`.
    pub fn with_cursor(&self, cursor: Option<String>) -> Self {
        let mut params = self.clone();
        if cursor.is_some() {
            params.cursor = cursor;
        }
        params
    }
}

/// The remote API, as seen by the query layer.
///
/// Implementations must be transport agnostic from the caller's point of view: every failure is
/// reported as a [`TransportError`](crate::caching::TransportError).
#[async_trait]
pub trait DataService: Send + Sync + 'static {
    async fn get_endpoints_config(&self) -> FetchResult<EndpointsConfig>;

    async fn get_available_agent_tools(&self) -> FetchResult<Vec<ToolDescriptor>>;

    async fn list_agents(&self, params: &AgentListParams) -> FetchResult<AgentListResponse>;

    /// Basic details of an agent, readable with the `VIEW` permission.
    async fn get_agent_by_id(&self, agent_id: &str) -> FetchResult<Agent>;

    /// Full details of an agent including its configuration, which requires `EDIT`.
    async fn get_expanded_agent_by_id(&self, agent_id: &str) -> FetchResult<Agent>;

    async fn get_agent_categories(&self) -> FetchResult<Vec<Category>>;

    async fn get_marketplace_agents(
        &self,
        params: &MarketplaceParams,
    ) -> FetchResult<AgentListResponse>;
}
