use std::sync::Arc;
use std::time::Duration;

use agentquery_service::caching::TransportError;
use agentquery_service::config::{ApiConfig, Config};
use agentquery_service::http::HttpDataService;
use agentquery_service::service::{
    AGENTS_ENDPOINT, AgentListParams, DataService, MarketplaceParams, permissions,
};
use agentquery_service::{QueryClient, QueryConfig};
use agentquery_test::{self as test, AUTH_TOKEN, HitCounter};

fn api_config(server: &HitCounter) -> ApiConfig {
    ApiConfig {
        base_url: Some(server.api_url()),
        auth_token: Some(AUTH_TOKEN.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_queries_over_http() {
    test::setup();
    let server = HitCounter::new();
    let config = Config {
        api: api_config(&server),
        ..Default::default()
    };
    let service = HttpDataService::new(&config.api).unwrap();
    let client = QueryClient::from_config(Arc::new(service), &config);

    let endpoints = client.endpoints_config().await;
    assert!(endpoints.data.unwrap().has_endpoint(AGENTS_ENDPOINT));

    let tools = client.available_tools().await;
    let names: Vec<_> = tools.data.unwrap().iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, ["web_search", "execute_code"]);

    let agents = client
        .list_agents(AgentListParams::default(), QueryConfig::default())
        .await;
    assert_eq!(agents.data.unwrap().data.len(), 10);

    let categories = client.agent_categories(QueryConfig::default()).await;
    assert_eq!(categories.data.unwrap().len(), 2);

    let expanded = client
        .expanded_agent_by_id("agent_1", QueryConfig::default())
        .await;
    assert_eq!(expanded.data.unwrap().extra["expanded"], true);

    assert_eq!(
        server.all_hits(),
        [
            ("/api/agents/agent_1/expanded".to_owned(), 1),
            ("/api/agents/categories".to_owned(), 1),
            ("/api/agents/tools".to_owned(), 1),
            ("/api/agents?limit=10&requiredPermission=2".to_owned(), 1),
            ("/api/endpoints".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn test_marketplace_over_http() {
    test::setup();
    let server = HitCounter::new();
    let config = Config {
        api: api_config(&server),
        ..Default::default()
    };
    let service = HttpDataService::new(&config.api).unwrap();
    let client = QueryClient::from_config(Arc::new(service), &config);

    let params = MarketplaceParams {
        required_permission: permissions::VIEW,
        category: Some("general".into()),
        ..Default::default()
    };
    let pages = client.marketplace_agents(params, QueryConfig::default()).await;
    while pages.has_next_page() {
        pages.fetch_next_page().await.unwrap();
    }
    let counts: Vec<_> = pages.page_data().iter().map(|page| page.data.len()).collect();
    assert_eq!(counts, [2, 2, 1]);

    assert_eq!(
        server.all_hits(),
        [
            (
                "/api/agents/marketplace?requiredPermission=1&category=general".to_owned(),
                1
            ),
            (
                "/api/agents/marketplace?requiredPermission=1&category=general&cursor=page2"
                    .to_owned(),
                1
            ),
            (
                "/api/agents/marketplace?requiredPermission=1&category=general&cursor=page3"
                    .to_owned(),
                1
            ),
        ]
    );
}

#[tokio::test]
async fn test_status_mapping() {
    test::setup();
    let server = HitCounter::new();
    let service = HttpDataService::new(&api_config(&server)).unwrap();

    assert_eq!(
        service.get_agent_by_id("missing").await,
        Err(TransportError::NotFound)
    );

    let forbidden = service.get_agent_by_id("forbidden").await.unwrap_err();
    let TransportError::PermissionDenied(details) = forbidden else {
        panic!("unexpected error: {forbidden:?}");
    };
    assert!(details.contains("requires EDIT"));

    let broken = service.get_agent_by_id("broken").await.unwrap_err();
    assert!(matches!(broken, TransportError::RequestFailed(details) if details.contains("502")));

    let garbage = service.get_agent_by_id("garbage").await.unwrap_err();
    assert!(matches!(garbage, TransportError::Malformed(_)));

    let agent = service.get_agent_by_id("a b").await.unwrap();
    assert_eq!(agent.id, "a b");
    assert_eq!(server.accesses(), 5);
}

#[tokio::test]
async fn test_invalid_token() {
    test::setup();
    let server = HitCounter::new();
    let service = HttpDataService::new(&ApiConfig {
        auth_token: Some("not-the-token".into()),
        ..api_config(&server)
    })
    .unwrap();

    let error = service.get_agent_categories().await.unwrap_err();
    assert!(matches!(error, TransportError::PermissionDenied(_)));

    // requests without a token are let through
    let service = HttpDataService::new(&ApiConfig {
        auth_token: None,
        ..api_config(&server)
    })
    .unwrap();
    assert!(service.get_agent_categories().await.is_ok());
}

#[tokio::test]
async fn test_request_timeout() {
    test::setup();
    let server = HitCounter::new();
    let timeout = Duration::from_millis(500);
    let service = HttpDataService::new(&ApiConfig {
        timeout,
        ..api_config(&server)
    })
    .unwrap();

    assert_eq!(
        service.get_agent_by_id("slow").await,
        Err(TransportError::Timeout(timeout))
    );
}
