use std::time::Duration;

use futures::future::join_all;

use agentquery_service::QueryConfig;
use agentquery_service::caching::{QueryStatus, TransportError};
use agentquery_service::definitions::{Operation, QueryParams};
use agentquery_service::service::{Agent, AgentListParams, Category, permissions};

use crate::{agent, category, endpoints_with_agents, methods, seed_endpoints, setup_client};

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_fetch_once() {
    let (client, service) = setup_client(|_| {});
    service.set_categories(vec![category("general")]);
    service.set_latency(Duration::from_millis(100));

    let states = join_all((0..10).map(|_| client.agent_categories(QueryConfig::default()))).await;

    for state in states {
        assert!(state.is_success());
        assert_eq!(state.data.unwrap()[0].value, "general");
    }
    assert_eq!(service.calls(methods::CATEGORIES), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reads_within_staleness_window() {
    let (client, service) = setup_client(|_| {});
    service.set_categories(vec![category("general")]);

    client.agent_categories(QueryConfig::default()).await;
    tokio::time::advance(Duration::from_secs(60)).await;
    client.agent_categories(QueryConfig::default()).await;
    assert_eq!(service.calls(methods::CATEGORIES), 1);

    // categories stay fresh for five minutes
    tokio::time::advance(Duration::from_secs(4 * 60 + 1)).await;
    let state = client.agent_categories(QueryConfig::default()).await;
    assert!(state.is_success());
    assert_eq!(service.calls(methods::CATEGORIES), 2);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_responses() {
    let (client, service) = setup_client(|_| {});
    service.set_categories(vec![category("first")]);
    service.push_delay(Duration::from_millis(200));
    service.push_delay(Duration::from_millis(10));

    let first = client.agent_categories(QueryConfig::default());
    tokio::pin!(first);
    assert!(futures::poll!(first.as_mut()).is_pending());
    // let the first fetch call the service before the data changes
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    assert_eq!(service.calls(methods::CATEGORIES), 1);

    service.set_categories(vec![category("second")]);
    let forced = QueryConfig {
        force_refresh: true,
        ..Default::default()
    };
    let (first, second) = tokio::join!(first, client.agent_categories(forced));

    // the forced fetch settles first, the older response is discarded afterwards
    assert_eq!(second.data.unwrap()[0].value, "second");
    assert_eq!(first.data.unwrap()[0].value, "second");

    let cached = client
        .get_query_state::<Vec<Category>>(
            Operation::AgentCategories,
            &QueryParams::None,
        );
    assert_eq!(cached.status, QueryStatus::Success);
    assert_eq!(cached.data.unwrap()[0].value, "second");
    assert_eq!(service.calls(methods::CATEGORIES), 2);
}

#[tokio::test]
async fn test_agent_list_waits_for_endpoints() {
    let (client, service) = setup_client(|_| {});
    service.set_agents(vec![agent("a"), agent("b")]);
    let params = AgentListParams {
        limit: 10,
        required_permission: permissions::EDIT,
        ..Default::default()
    };

    let state = client.list_agents(params.clone(), QueryConfig::default()).await;
    assert_eq!(state.status, QueryStatus::Idle);
    assert_eq!(service.calls(methods::LIST_AGENTS), 0);

    service.set_endpoints(endpoints_with_agents());
    assert!(client.endpoints_config().await.is_success());

    let state = client.list_agents(params.clone(), QueryConfig::default()).await;
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data.unwrap().data.len(), 2);
    assert_eq!(service.calls(methods::LIST_AGENTS), 1);
    assert_eq!(service.agent_list_requests(), vec![params]);
}

#[tokio::test]
async fn test_tools_require_agents_endpoint() {
    let (client, service) = setup_client(|_| {});
    service.set_endpoints(serde_json::from_value(serde_json::json!({"openAI": {}})).unwrap());
    service.set_tools(vec![agentquery_test::tool("web_search")]);

    assert!(client.endpoints_config().await.is_success());
    assert!(client.available_tools().await.is_idle());
    assert_eq!(service.calls(methods::TOOLS), 0);

    seed_endpoints(&client);
    let tools = client.available_tools().await;
    assert_eq!(tools.data.unwrap()[0].name, "web_search");
    assert_eq!(service.calls(methods::TOOLS), 1);
}

#[tokio::test]
async fn test_caller_disables_query() {
    let (client, service) = setup_client(|_| {});
    service.set_agents(vec![agent("a")]);

    let state = client
        .expanded_agent_by_id("a", QueryConfig::enabled(false))
        .await;
    assert!(state.is_idle());
    assert_eq!(service.total_calls(), 0);

    let state = client
        .expanded_agent_by_id("a", QueryConfig::enabled(true))
        .await;
    let agent = state.data.unwrap();
    assert_eq!(agent.extra["expanded"], serde_json::Value::Bool(true));
    assert_eq!(service.calls(methods::EXPANDED_AGENT), 1);
}

#[tokio::test(start_paused = true)]
async fn test_serve_stale_revalidates() {
    let (client, service) = setup_client(|_| {});
    service.set_agents(vec![agent("a")]);
    assert!(client.agent_by_id("a", QueryConfig::default()).await.is_success());

    let mut renamed = agent("a");
    renamed.name = Some("Renamed".into());
    service.set_agents(vec![renamed]);
    service.push_delay(Duration::from_millis(100));

    let stale = QueryConfig {
        serve_stale: true,
        ..Default::default()
    };
    let state = client.agent_by_id("a", stale).await;
    assert!(state.is_success());
    assert_eq!(state.data.unwrap().name.as_deref(), Some("Agent a"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.calls(methods::AGENT), 2);
    let state = client.get_query_state::<Agent>(
        Operation::AgentById,
        &QueryParams::AgentId("a".into()),
    );
    assert_eq!(state.data.unwrap().name.as_deref(), Some("Renamed"));
}

#[tokio::test]
async fn test_error_keeps_previous_data() {
    let (client, service) = setup_client(|_| {});
    service.set_agents(vec![agent("a")]);
    assert!(client.agent_by_id("a", QueryConfig::default()).await.is_success());

    let error = TransportError::RequestFailed("502 Bad Gateway".into());
    service.fail_next(methods::AGENT, error.clone());
    let state = client.agent_by_id("a", QueryConfig::default()).await;
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.error, Some(error));
    assert_eq!(state.data.unwrap().id, "a");

    let state = client.agent_by_id("a", QueryConfig::default()).await;
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.error, None);
}

#[tokio::test(start_paused = true)]
async fn test_retries_within_one_request() {
    let (client, service) = setup_client(|config| {
        config.queries.agent.retries = Some(2);
        config.queries.agent.retry_delay = Some(Duration::from_secs(1));
    });
    service.set_agents(vec![agent("a")]);
    service.fail_next(methods::AGENT, TransportError::RequestFailed("reset".into()));
    service.fail_next(methods::AGENT, TransportError::Timeout(Duration::from_secs(5)));

    let (first, second) = tokio::join!(
        client.agent_by_id("a", QueryConfig::default()),
        client.agent_by_id("a", QueryConfig::default()),
    );
    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(service.calls(methods::AGENT), 3);

    // missing agents are not retried
    let state = client.agent_by_id("missing", QueryConfig::default()).await;
    assert_eq!(state.error, Some(TransportError::NotFound));
    assert_eq!(service.calls(methods::AGENT), 4);
}

#[tokio::test(start_paused = true)]
async fn test_caller_timeout() {
    let (client, service) = setup_client(|_| {});
    service.set_agents(vec![agent("a")]);
    service.push_delay(Duration::from_secs(10));

    let config = QueryConfig {
        timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let state = client.agent_by_id("a", config).await;
    assert_eq!(
        state.error,
        Some(TransportError::Timeout(Duration::from_secs(1)))
    );
}

#[tokio::test]
async fn test_observer_sees_updates() {
    let (client, service) = setup_client(|_| {});
    service.set_categories(vec![category("general")]);

    let mut observer = client.observe::<Vec<Category>>(
        Operation::AgentCategories,
        &QueryParams::None,
    );
    assert!(observer.state().is_idle());

    client.agent_categories(QueryConfig::default()).await;
    let state = observer.changed().await.unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(observer.state().data.unwrap()[0].label, "GENERAL");
}

#[tokio::test]
async fn test_set_query_data_counts_as_fetched() {
    let (client, service) = setup_client(|_| {});
    client.set_query_data(
        Operation::AgentCategories,
        &QueryParams::None,
        vec![category("seeded")],
    );

    let state = client.agent_categories(QueryConfig::default()).await;
    assert_eq!(state.data.unwrap()[0].value, "seeded");
    assert_eq!(service.total_calls(), 0);
}
