use std::time::Duration;

use agentquery_service::QueryConfig;
use agentquery_service::caching::KeyFilter;
use agentquery_service::config::QueryOverrides;
use agentquery_service::definitions::{Operation, QueryParams};
use agentquery_service::query_key;
use agentquery_service::service::Category;

use crate::{category, methods, setup_client};

fn short_lived() -> QueryOverrides {
    QueryOverrides {
        stale_time: Some(Duration::from_secs(1)),
        gc_time: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_observed_entries_survive_collection() {
    let (client, service) = setup_client(|config| {
        config.cache.gc_interval = Duration::from_secs(1);
        config.queries.categories = short_lived();
    });
    service.set_categories(vec![category("general")]);
    let key = query_key!["agentCategories"];

    let observer = client.observe::<Vec<Category>>(Operation::AgentCategories, &QueryParams::None);
    assert!(client.agent_categories(QueryConfig::default()).await.is_success());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.store().peek(&key).is_some());

    // retention restarts once the last observer is gone
    drop(observer);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(client.store().peek(&key).is_some());

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(client.store().peek(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pending_entries_survive_collection() {
    let (client, service) = setup_client(|config| {
        config.cache.gc_interval = Duration::from_secs(1);
        config.queries.categories = short_lived();
    });
    service.push_delay(Duration::from_secs(30));

    let state = client.agent_categories(QueryConfig::default()).await;
    assert!(state.is_success());
    assert_eq!(service.calls(methods::CATEGORIES), 1);
    assert!(client.store().peek(&query_key!["agentCategories"]).is_some());
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let (client, service) = setup_client(|_| {});
    service.set_categories(vec![category("general")]);

    client.agent_categories(QueryConfig::default()).await;
    client.agent_categories(QueryConfig::default()).await;
    assert_eq!(service.calls(methods::CATEGORIES), 1);

    assert_eq!(client.invalidate_operation(Operation::AgentCategories), 1);
    let state = client.agent_categories(QueryConfig::default()).await;
    assert!(state.is_success());
    assert_eq!(service.calls(methods::CATEGORIES), 2);

    // unrelated prefixes leave the entry alone
    assert_eq!(client.invalidate(&KeyFilter::Prefix(query_key!["agent"])), 0);
    client.agent_categories(QueryConfig::default()).await;
    assert_eq!(service.calls(methods::CATEGORIES), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_fetches() {
    let (client, service) = setup_client(|_| {});
    service.push_delay(Duration::from_secs(30));

    let coordinator = client.coordinator().clone();
    let store = client.store().clone();
    {
        let fetch = client.agent_categories(QueryConfig::default());
        tokio::pin!(fetch);
        assert!(futures::poll!(fetch.as_mut()).is_pending());
    }
    assert_eq!(coordinator.pending_count(), 1);

    client.shutdown();
    assert_eq!(coordinator.pending_count(), 0);
    assert!(store.is_empty());
}
