use std::sync::Arc;

use agentquery_service::QueryClient;
use agentquery_service::config::Config;
use agentquery_service::definitions::{Operation, QueryParams};
use agentquery_test as test;

pub use test::{MockDataService, agent, agent_page, category, endpoints_with_agents, methods};

/// Setup tests and create a client backed by a fresh [`MockDataService`].
///
/// The `update_config` closure can modify the default configuration before the client is
/// created.
pub fn setup_client(
    update_config: impl FnOnce(&mut Config),
) -> (QueryClient, Arc<MockDataService>) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let service = Arc::new(MockDataService::new());
    let client = QueryClient::from_config(service.clone(), &config);

    (client, service)
}

/// Seeds the endpoints entry so that the agent queries are enabled.
pub fn seed_endpoints(client: &QueryClient) {
    client.set_query_data(
        Operation::EndpointsConfig,
        &QueryParams::None,
        endpoints_with_agents(),
    );
}
