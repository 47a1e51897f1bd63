use std::env;
use std::path::PathBuf;

use agentquery_service::config::Config;
use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Environment variable holding the bearer token, if not passed on the command line.
pub const AUTH_TOKEN_ENV: &str = "AGENTQUERY_AUTH_TOKEN";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    #[default]
    Table,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// List the tools that can be attached to agents.
    Tools,
    /// List the agents you are allowed to edit.
    Agents {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
    },
    /// Show a single agent.
    Agent {
        id: String,
        /// Fetch the expanded representation, including attached tools.
        #[arg(long)]
        expanded: bool,
    },
    /// List the agent categories.
    Categories,
    /// Browse the agent marketplace.
    Marketplace {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Number of agents per page.
        #[arg(long)]
        limit: Option<u32>,
        /// Number of pages to load at most.
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
}

/// Query the agents API from the command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Base URL of the API, overriding `api.base_url` from the config file.
    #[arg(long)]
    url: Option<Url>,

    /// Bearer token sent with every request.
    ///
    /// Falls back to the `AGENTQUERY_AUTH_TOKEN` environment variable and then
    /// to `api.auth_token` from the config file.
    #[arg(long)]
    auth_token: Option<String>,

    /// The format in which results are printed.
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,

    /// The log level, overriding `logging.level` from the config file.
    #[arg(long)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub config: Config,
    pub format: OutputFormat,
    pub command: Command,
}

impl Settings {
    pub fn get() -> Result<Self> {
        Self::from_cli(Cli::parse(), env::var(AUTH_TOKEN_ENV).ok())
    }

    fn from_cli(cli: Cli, env_token: Option<String>) -> Result<Self> {
        let mut config = Config::get(cli.config.as_deref())?;

        if let Some(url) = cli.url {
            config.api.base_url = Some(url);
        }
        if config.api.base_url.is_none() {
            bail!(
                "No API URL provided. Pass it either via the `--url` option or via `api.base_url` in the config file."
            );
        }

        if let Some(token) = cli.auth_token.or(env_token) {
            config.api.auth_token = Some(token);
        }
        if let Some(level) = cli.log_level {
            config.logging.level = level;
        }

        Ok(Self {
            config,
            format: cli.format,
            command: cli.command,
        })
    }
}
