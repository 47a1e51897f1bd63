use std::sync::Arc;

use agentquery_service::caching::QueryState;
use agentquery_service::http::HttpDataService;
use agentquery_service::service::{AgentListParams, MarketplaceParams, permissions};
use agentquery_service::{QueryClient, QueryConfig, logging, metrics};
use anyhow::{Context, Result, bail};

use settings::{Command, OutputFormat, Settings};

mod output;
mod settings;

fn main() -> Result<()> {
    let settings = Settings::get()?;
    let config = &settings.config;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are in a single-threaded context, the runtime has not been started yet.
    unsafe { logging::init_logging(config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let tags = config.metrics.custom_tags.clone();
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let result = runtime.block_on(run(settings));
    if let Err(ref error) = result {
        logging::ensure_log_error(error);
    }
    result
}

async fn run(settings: Settings) -> Result<()> {
    let service = HttpDataService::new(&settings.config.api)?;
    let client = QueryClient::from_config(Arc::new(service), &settings.config);
    let format = settings.format;

    // every other query is gated on the endpoints configuration
    expect_data(client.endpoints_config().await, "endpoints configuration")?;

    match settings.command {
        Command::Tools => {
            let tools = expect_data(client.available_tools().await, "tools")?;
            print(format, &*tools, || output::tools_table(&tools))?;
        }
        Command::Agents {
            limit,
            category,
            search,
        } => {
            let params = AgentListParams {
                limit,
                required_permission: permissions::EDIT,
                category,
                search,
                after: None,
            };
            let state = client.list_agents(params, QueryConfig::default()).await;
            let agents = expect_data(state, "agents")?;
            print(format, &*agents, || output::agents_table(&agents.data))?;
        }
        Command::Agent { id, expanded } => {
            let state = if expanded {
                client.expanded_agent_by_id(&id, QueryConfig::default()).await
            } else {
                client.agent_by_id(&id, QueryConfig::default()).await
            };
            let agent = expect_data(state, "agent")?;
            print(format, &*agent, || output::agent_table(&agent))?;
        }
        Command::Categories => {
            let state = client.agent_categories(QueryConfig::default()).await;
            let categories = expect_data(state, "categories")?;
            print(format, &*categories, || output::categories_table(&categories))?;
        }
        Command::Marketplace {
            category,
            search,
            limit,
            pages,
        } => {
            let params = MarketplaceParams {
                required_permission: permissions::VIEW,
                category,
                search,
                limit,
                ..Default::default()
            };
            let marketplace = client.marketplace_agents(params, QueryConfig::default()).await;
            if let Some(error) = marketplace.error() {
                return Err(error).context("failed to fetch the marketplace");
            }
            while marketplace.page_data().len() < pages && marketplace.has_next_page() {
                marketplace
                    .fetch_next_page()
                    .await
                    .context("failed to fetch the next marketplace page")?;
            }

            let page_data = marketplace.page_data();
            tracing::debug!(
                pages = page_data.len(),
                exhausted = marketplace.is_exhausted(),
                "Loaded marketplace"
            );
            let agents: Vec<_> = page_data.iter().flat_map(|page| &page.data).collect();
            print(format, &agents, || output::agents_table(agents.iter().copied()))?;
        }
    }

    client.shutdown();
    Ok(())
}

/// Unwraps the data of a settled query, turning errors and disabled queries into failures.
fn expect_data<T>(state: QueryState<T>, what: &str) -> Result<Arc<T>> {
    if let Some(error) = state.error {
        return Err(error).with_context(|| format!("failed to fetch {what}"));
    }
    match state.data {
        Some(data) => Ok(data),
        None => bail!("{what} not available, the API does not expose the required endpoint"),
    }
}

fn print<T: serde::Serialize + ?Sized>(
    format: OutputFormat,
    value: &T,
    table: impl FnOnce() -> prettytable::Table,
) -> Result<()> {
    match format {
        OutputFormat::Json => output::print_json(value),
        OutputFormat::Table => {
            table().printstd();
            Ok(())
        }
    }
}
