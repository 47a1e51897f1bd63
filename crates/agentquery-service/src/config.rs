use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::definitions::Operation;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "agentquery".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection settings of the remote agents API.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// The URL all API routes are resolved against.
    ///
    /// A missing trailing `/` is added when the client is created.
    pub base_url: Option<Url>,

    /// A bearer token that is forwarded with every request.
    pub auth_token: Option<String>,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a whole request, including reading the response body.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Settings of the in-memory query cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// How often the collector looks for expired entries.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,

    /// How long unobserved entries are retained unless a query defines its own retention.
    #[serde(with = "humantime_serde")]
    pub default_gc_time: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            default_gc_time: Duration::from_secs(5 * 60),
        }
    }
}

/// Overrides for the built-in options of a single query.
///
/// Every field that is left out keeps the query's default.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QueryOverrides {
    #[serde(with = "humantime_serde")]
    pub stale_time: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub gc_time: Option<Duration>,
    pub retries: Option<u32>,
    /// A fixed delay between retries.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
    /// Forces the query on or off, in addition to its own enablement checks.
    pub enabled: Option<bool>,
    pub cancel_unobserved: Option<bool>,
}

/// Per-query overrides, keyed by the query name.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueriesConfig {
    pub endpoints: QueryOverrides,
    pub tools: QueryOverrides,
    pub agents: QueryOverrides,
    pub agent: QueryOverrides,
    pub expanded_agent: QueryOverrides,
    pub categories: QueryOverrides,
    pub marketplace: QueryOverrides,
}

impl QueriesConfig {
    pub fn for_operation(&self, operation: Operation) -> &QueryOverrides {
        match operation {
            Operation::EndpointsConfig => &self.endpoints,
            Operation::AvailableTools => &self.tools,
            Operation::ListAgents => &self.agents,
            Operation::AgentById => &self.agent,
            Operation::ExpandedAgentById => &self.expanded_agent,
            Operation::AgentCategories => &self.categories,
            Operation::MarketplaceAgents => &self.marketplace,
        }
    }
}

/// The configuration of the query layer and its outer surfaces.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The remote API to fetch from.
    pub api: ApiConfig,

    /// Fine-tune the in-memory cache.
    pub cache: CacheSettings,

    /// Fine-tune individual queries.
    pub queries: QueriesConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, CacheSettings::default());
        assert!(cfg.api.base_url.is_none());
        assert_eq!(cfg.api.timeout, Duration::from_secs(30));
        assert_eq!(cfg.queries.agents, QueryOverrides::default());
        assert_eq!(cfg.logging.format, LogFormat::Auto);
    }

    #[test]
    fn test_query_overrides() {
        // Overriding a single option keeps the defaults of everything else.
        let yaml = r#"
            queries:
              agents:
                stale_time: 30s
                retries: 2
                retry_delay: 250ms
              marketplace:
                enabled: false
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        let agents = cfg.queries.for_operation(Operation::ListAgents);
        assert_eq!(agents.stale_time, Some(Duration::from_secs(30)));
        assert_eq!(agents.gc_time, None);
        assert_eq!(agents.retries, Some(2));
        assert_eq!(agents.retry_delay, Some(Duration::from_millis(250)));

        let marketplace = cfg.queries.for_operation(Operation::MarketplaceAgents);
        assert_eq!(marketplace.enabled, Some(false));
        assert_eq!(marketplace.stale_time, None);

        assert_eq!(
            *cfg.queries.for_operation(Operation::AgentCategories),
            QueryOverrides::default()
        );
    }

    #[test]
    fn test_api_and_cache() {
        let yaml = r#"
            api:
              base_url: "https://agents.example.com/api/"
              auth_token: secret
              timeout: 10s
            cache:
              gc_interval: 5m
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let base_url = cfg.api.base_url.unwrap();
        assert_eq!(base_url.host_str(), Some("agents.example.com"));
        assert_eq!(cfg.api.auth_token.as_deref(), Some("secret"));
        assert_eq!(cfg.api.timeout, Duration::from_secs(10));
        assert_eq!(cfg.api.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.cache.gc_interval, Duration::from_secs(300));
        assert_eq!(cfg.cache.default_gc_time, Duration::from_secs(300));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            queries:
              not_a_query:
                stale_time: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
