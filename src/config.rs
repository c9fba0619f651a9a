use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::RegexBuilder;
use serde::Deserialize;

/// Top-level configuration for the event-rollup service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging filter used when `--log-level` is not given. Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database holding the per-version raw event collections.
    #[serde(default)]
    pub source: SourceConfig,

    /// Collection mapping version ids to game and customer.
    #[serde(default)]
    pub dimensions: DimensionSourceConfig,

    /// Destination of the aggregate rows.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Backlog discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Collection scanner configuration.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Aggregation rule switches.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Raw event source connection.
#[derive(Debug, Default, Deserialize)]
pub struct SourceConfig {
    /// MongoDB connection string (e.g., "mongodb://localhost:27017").
    #[serde(default)]
    pub uri: String,

    /// Database name.
    #[serde(default)]
    pub database: String,
}

/// Dimension collection connection.
#[derive(Debug, Deserialize)]
pub struct DimensionSourceConfig {
    /// Connection string. Empty means the source URI.
    #[serde(default)]
    pub uri: String,

    /// Default: "results".
    #[serde(default = "default_dimension_database")]
    pub database: String,

    #[serde(default)]
    pub collection: String,
}

/// Aggregate sink connection.
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    /// Connection string. Empty means the source URI.
    #[serde(default)]
    pub uri: String,

    /// Database name. Empty means the source database.
    #[serde(default)]
    pub database: String,

    /// Default: "aggragatedResults".
    #[serde(default = "default_sink_collection")]
    pub collection: String,
}

/// Backlog discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Time between discovery passes. Default: 1h.
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Case-insensitive regex selecting source collections. Default: "x00*".
    #[serde(default = "default_collection_filter")]
    pub collection_filter: String,

    /// Collections below this many documents are not scanned yet.
    /// Default: 1,000,000.
    #[serde(default = "default_min_documents")]
    pub min_documents: u64,
}

/// Collection scanner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Maximum number of collections scanned at once. Default: 4.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Aggregation rule switches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cta_routing: CtaRouting,
}

/// Routing of raw `cta` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtaRouting {
    /// `cta` is ignored; only `ctaClick` feeds the CTA split.
    #[default]
    Observed,
    /// `cta` feeds the CTA split by value and emits `ctaTime`.
    Merged,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dimension_database() -> String {
    "results".to_string()
}

fn default_sink_collection() -> String {
    "aggragatedResults".to_string()
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_collection_filter() -> String {
    "x00*".to_string()
}

fn default_min_documents() -> u64 {
    1_000_000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            dimensions: DimensionSourceConfig::default(),
            sink: SinkConfig::default(),
            discovery: DiscoveryConfig::default(),
            scan: ScanConfig::default(),
            engine: EngineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DimensionSourceConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            database: default_dimension_database(),
            collection: String::new(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            database: String::new(),
            collection: default_sink_collection(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: default_discovery_interval(),
            collection_filter: default_collection_filter(),
            min_documents: default_min_documents(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Environment overrides ---

/// Environment variables that override file values when set and non-empty.
pub const ENV_SOURCE_URI: &str = "ROLLUP_SOURCE_URI";
pub const ENV_SOURCE_DATABASE: &str = "ROLLUP_SOURCE_DATABASE";
pub const ENV_DIMENSION_URI: &str = "ROLLUP_DIMENSION_URI";
pub const ENV_DIMENSION_COLLECTION: &str = "ROLLUP_DIMENSION_COLLECTION";
pub const ENV_SINK_URI: &str = "ROLLUP_SINK_URI";

// --- Validation and loading ---

impl Config {
    /// Tracing filter in effect: `flag` when given on the command line,
    /// otherwise the configured level.
    pub fn log_filter<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.filter(|level| !level.is_empty())
            .unwrap_or(self.log_level.as_str())
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;

        Ok(cfg)
    }

    /// Build configuration from defaults and environment variables only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from `lookup`, typically the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get(ENV_SOURCE_URI) {
            self.source.uri = v;
        }
        if let Some(v) = get(ENV_SOURCE_DATABASE) {
            self.source.database = v;
        }
        if let Some(v) = get(ENV_DIMENSION_URI) {
            self.dimensions.uri = v;
        }
        if let Some(v) = get(ENV_DIMENSION_COLLECTION) {
            self.dimensions.collection = v;
        }
        if let Some(v) = get(ENV_SINK_URI) {
            self.sink.uri = v;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.uri.is_empty() {
            bail!("source.uri is required");
        }

        if self.source.database.is_empty() {
            bail!("source.database is required");
        }

        if self.dimensions.database.is_empty() {
            bail!("dimensions.database is required");
        }

        if self.dimensions.collection.is_empty() {
            bail!("dimensions.collection is required");
        }

        if self.sink.collection.is_empty() {
            bail!("sink.collection is required");
        }

        if self.discovery.interval.is_zero() {
            bail!("discovery.interval must be positive");
        }

        RegexBuilder::new(&self.discovery.collection_filter)
            .case_insensitive(true)
            .build()
            .with_context(|| {
                format!(
                    "discovery.collection_filter is not a valid regex: {}",
                    self.discovery.collection_filter
                )
            })?;

        if self.scan.max_concurrent == 0 {
            bail!("scan.max_concurrent must be positive");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }

    /// Connection string for the dimension collection.
    pub fn dimension_uri(&self) -> &str {
        non_empty_or(&self.dimensions.uri, &self.source.uri)
    }

    /// Connection string for the aggregate sink.
    pub fn sink_uri(&self) -> &str {
        non_empty_or(&self.sink.uri, &self.source.uri)
    }

    /// Database holding the aggregate sink collection.
    pub fn sink_database(&self) -> &str {
        non_empty_or(&self.sink.database, &self.source.database)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
