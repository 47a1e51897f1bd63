use std::time::Duration;

use agentquery_service::QueryConfig;
use agentquery_service::caching::{PreconditionError, QueryStatus, TransportError};
use agentquery_service::pagination::PaginationError;
use agentquery_service::service::{MarketplaceParams, permissions};

use crate::{MockDataService, agent_page, methods, setup_client};

fn marketplace_params() -> MarketplaceParams {
    MarketplaceParams {
        required_permission: permissions::VIEW,
        ..Default::default()
    }
}

fn three_pages(service: &MockDataService) {
    service.set_marketplace_page(None, agent_page("one", 2, Some("c2")));
    service.set_marketplace_page(Some("c2"), agent_page("two", 2, Some("c3")));
    service.set_marketplace_page(Some("c3"), agent_page("three", 1, None));
}

#[tokio::test]
async fn test_fetch_until_exhausted() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);

    let pages = client.marketplace_agents(marketplace_params(), QueryConfig::default()).await;
    assert_eq!(pages.status(), QueryStatus::Success);
    while pages.has_next_page() {
        pages.fetch_next_page().await.unwrap();
    }

    let ids: Vec<_> = pages
        .page_data()
        .iter()
        .map(|page| page.first_id.clone().unwrap())
        .collect();
    assert_eq!(ids, ["one_0", "two_0", "three_0"]);
    assert!(pages.is_exhausted());
    assert_eq!(pages.cursor(), None);

    assert_eq!(
        pages.fetch_next_page().await,
        Err(PaginationError::Precondition(PreconditionError::Exhausted))
    );
    assert_eq!(service.calls(methods::MARKETPLACE), 3);
}

#[tokio::test]
async fn test_marketplace_continuation_cursor() {
    let (client, service) = setup_client(|_| {});
    service.set_marketplace_page(None, agent_page("first", 20, Some("cursor123")));
    service.set_marketplace_page(Some("cursor123"), agent_page("second", 5, None));

    let params = MarketplaceParams {
        required_permission: 1,
        limit: Some(20),
        ..Default::default()
    };
    let pages = client.marketplace_agents(params.clone(), QueryConfig::default()).await;
    let page_data = pages.page_data();
    let first = &page_data[0];
    assert_eq!(first.data.len(), 20);
    assert_eq!(first.after.as_deref(), Some("cursor123"));
    assert!(pages.has_next_page());

    pages.fetch_next_page().await.unwrap();
    let requests = service.marketplace_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], params);
    assert_eq!(requests[1].cursor.as_deref(), Some("cursor123"));
    assert_eq!(requests[1].limit, Some(20));

    assert!(pages.is_exhausted());
    assert!(!pages.has_next_page());

    let cursors: Vec<_> = pages.pages().into_iter().map(|page| page.cursor).collect();
    assert_eq!(cursors, [None, Some("cursor123".to_owned())]);
}

#[tokio::test]
async fn test_marketplace_requires_permission() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);

    let pages = client
        .marketplace_agents(MarketplaceParams::default(), QueryConfig::default())
        .await;
    assert_eq!(pages.status(), QueryStatus::Idle);
    assert!(pages.page_data().is_empty());
    assert!(format!("{pages:?}").contains("pages: 0"));
    assert_eq!(
        pages.fetch_next_page().await,
        Err(PaginationError::Precondition(PreconditionError::NotStarted))
    );
    assert_eq!(service.total_calls(), 0);
}

#[tokio::test]
async fn test_caller_disables_marketplace() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);

    let pages = client
        .marketplace_agents(marketplace_params(), QueryConfig::enabled(false))
        .await;
    assert_eq!(pages.status(), QueryStatus::Idle);
    assert!(pages.page_data().is_empty());
    assert_eq!(
        pages.fetch_next_page().await,
        Err(PaginationError::Precondition(PreconditionError::NotStarted))
    );
    assert_eq!(service.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_caller_config_applies_to_pages() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);

    let pages = client
        .marketplace_agents(marketplace_params(), QueryConfig::default())
        .await;
    assert_eq!(pages.status(), QueryStatus::Success);
    assert_eq!(service.calls(methods::MARKETPLACE), 1);

    // a forced refresh skips the cached first page
    let config = QueryConfig {
        force_refresh: true,
        timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let refreshed = client.marketplace_agents(marketplace_params(), config).await;
    assert_eq!(refreshed.status(), QueryStatus::Success);
    assert_eq!(service.calls(methods::MARKETPLACE), 2);

    service.push_delay(Duration::from_secs(10));
    assert_eq!(
        refreshed.fetch_next_page().await,
        Err(PaginationError::Transport(TransportError::Timeout(
            Duration::from_secs(1)
        )))
    );
    assert_eq!(refreshed.page_data().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_continuation_at_a_time() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);
    service.push_delay(Duration::ZERO);
    service.push_delay(Duration::from_secs(1));

    let pages = client.marketplace_agents(marketplace_params(), QueryConfig::default()).await;

    let next = pages.fetch_next_page();
    tokio::pin!(next);
    assert!(futures::poll!(next.as_mut()).is_pending());
    assert!(pages.is_fetching());
    assert_eq!(
        pages.fetch_next_page().await,
        Err(PaginationError::Precondition(PreconditionError::InFlight))
    );

    next.await.unwrap();
    assert!(!pages.is_fetching());
    assert_eq!(pages.page_data().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_restart_discards_superseded_page() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);
    service.push_delay(Duration::ZERO);
    service.push_delay(Duration::from_secs(1));

    let pages = client.marketplace_agents(marketplace_params(), QueryConfig::default()).await;

    let next = pages.fetch_next_page();
    tokio::pin!(next);
    assert!(futures::poll!(next.as_mut()).is_pending());

    // the first page is still fresh and served from the cache
    pages.fetch_first_page().await.unwrap();

    // the continuation was issued for the previous accumulator and is dropped
    next.await.unwrap();
    assert_eq!(service.calls(methods::MARKETPLACE), 2);
    assert_eq!(pages.page_data().len(), 1);
    assert_eq!(pages.cursor().as_deref(), Some("c2"));
    assert!(pages.has_next_page());
}

#[tokio::test]
async fn test_pages_are_cached_by_cursor() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);

    let pages = client.marketplace_agents(marketplace_params(), QueryConfig::default()).await;
    pages.fetch_next_page().await.unwrap();
    assert_eq!(service.calls(methods::MARKETPLACE), 2);

    let again = client.marketplace_agents(marketplace_params(), QueryConfig::default()).await;
    again.fetch_next_page().await.unwrap();
    again.fetch_next_page().await.unwrap();
    assert_eq!(again.page_data().len(), 3);
    assert_eq!(service.calls(methods::MARKETPLACE), 3);
}

#[tokio::test]
async fn test_failed_page_can_be_retried() {
    let (client, service) = setup_client(|_| {});
    three_pages(&service);

    let pages = client.marketplace_agents(marketplace_params(), QueryConfig::default()).await;
    let error = TransportError::RequestFailed("503 Service Unavailable".into());
    service.fail_next(methods::MARKETPLACE, error.clone());

    assert_eq!(
        pages.fetch_next_page().await,
        Err(PaginationError::Transport(error.clone()))
    );
    assert_eq!(pages.status(), QueryStatus::Error);
    assert_eq!(pages.error(), Some(error));
    assert_eq!(pages.page_data().len(), 1);

    pages.fetch_next_page().await.unwrap();
    assert_eq!(pages.status(), QueryStatus::Success);
    assert_eq!(pages.page_data().len(), 2);
}
