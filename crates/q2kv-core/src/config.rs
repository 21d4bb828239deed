//! Configuration structures for q2kv.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! Flat agent-style property maps (`batchSize`, `accumulo.table`, ...) are
//! accepted through [`Config::from_properties`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Batch sink configuration
    pub sink: SinkConfig,

    /// Store connection configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Buffered writer configuration
    #[serde(default)]
    pub writer: WriterConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Batch sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Maximum number of events taken per transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Name of the mutation builder strategy
    #[serde(default = "default_serializer")]
    pub serializer: String,

    /// Target table
    pub table: String,

    /// Options handed to the mutation builder on configure
    #[serde(default)]
    pub serializer_options: HashMap<String, String>,
}

impl SinkConfig {
    /// Create a sink configuration for a table with default settings.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            batch_size: default_batch_size(),
            serializer: default_serializer(),
            table: table.into(),
            serializer_options: HashMap::new(),
        }
    }
}

/// Store connection configuration.
///
/// Only required when no connector is injected into the sink.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Store instance name
    pub instance: Option<String>,

    /// Coordination service addresses
    #[serde(default)]
    pub zk_servers: Vec<String>,

    /// Username
    pub user: Option<String>,

    /// Password
    pub password: Option<String>,
}

/// Buffered mutation writer configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WriterConfig {
    /// Maximum bytes buffered before submit blocks
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    /// Maximum time a mutation stays buffered in milliseconds (0 = no limit)
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    /// Maximum concurrent flushes
    #[serde(default = "default_max_write_threads")]
    pub max_write_threads: usize,
}

impl WriterConfig {
    /// Max latency as a duration, `None` when latency flushing is disabled.
    pub fn max_latency(&self) -> Option<Duration> {
        (self.max_latency_ms > 0).then(|| Duration::from_millis(self.max_latency_ms))
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            max_latency_ms: default_max_latency_ms(),
            max_write_threads: default_max_write_threads(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_batch_size() -> usize {
    100
}
fn default_serializer() -> String {
    crate::serializer::SIMPLE_SERIALIZER.to_string()
}
fn default_max_memory() -> u64 {
    1_000_000
}
fn default_max_latency_ms() -> u64 {
    1000
}
fn default_max_write_threads() -> usize {
    2
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

/// Property keys accepted by [`Config::from_properties`].
pub mod keys {
    /// Maximum events per transaction
    pub const BATCH_SIZE: &str = "batchSize";
    /// Mutation builder name
    pub const SERIALIZER: &str = "accumulo.serializer";
    /// Coordination service addresses, comma separated
    pub const ZK_SERVERS: &str = "accumulo.zkServers";
    /// Store instance name
    pub const INSTANCE: &str = "accumulo.instance";
    /// Username
    pub const USER: &str = "accumulo.user";
    /// Password
    pub const PASSWORD: &str = "accumulo.password";
    /// Target table
    pub const TABLE: &str = "accumulo.table";
    /// Writer max memory
    pub const MAX_MEMORY: &str = "accumulo.maxMemory";
    /// Writer max latency
    pub const MAX_LATENCY: &str = "accumulo.maxLatency";
    /// Writer max write threads
    pub const MAX_WRITE_THREADS: &str = "accumulo.maxWriteThreads";
    /// Prefix for mutation builder options
    pub const SERIALIZER_PREFIX: &str = "serializer.";
}

impl Config {
    /// Create a configuration for a table with default settings.
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            sink: SinkConfig::new(table),
            store: StoreConfig::default(),
            writer: WriterConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from a flat property map.
    ///
    /// Both the `accumulo.`-prefixed keys and their short forms are accepted;
    /// the prefixed key wins when both are present.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let get = |long: &str| -> Option<&String> {
            props
                .get(long)
                .or_else(|| long.strip_prefix("accumulo.").and_then(|k| props.get(k)))
        };

        let table = get(keys::TABLE)
            .cloned()
            .ok_or_else(|| Error::Config(format!("{} is required", keys::TABLE)))?;

        let mut sink = SinkConfig::new(table);
        if let Some(v) = get(keys::BATCH_SIZE) {
            sink.batch_size = parse_number(keys::BATCH_SIZE, v)?;
        }
        if let Some(v) = get(keys::SERIALIZER) {
            sink.serializer = v.clone();
        }
        sink.serializer_options = props
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(keys::SERIALIZER_PREFIX)
                    .map(|opt| (opt.to_string(), v.clone()))
            })
            .collect();

        let store = StoreConfig {
            instance: get(keys::INSTANCE).cloned(),
            zk_servers: get(keys::ZK_SERVERS)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            user: get(keys::USER).cloned(),
            password: get(keys::PASSWORD).cloned(),
        };

        let mut writer = WriterConfig::default();
        if let Some(v) = get(keys::MAX_MEMORY) {
            writer.max_memory = parse_number(keys::MAX_MEMORY, v)?;
        }
        if let Some(v) = get(keys::MAX_LATENCY) {
            writer.max_latency_ms = parse_number(keys::MAX_LATENCY, v)?;
        }
        if let Some(v) = get(keys::MAX_WRITE_THREADS) {
            writer.max_write_threads = parse_number(keys::MAX_WRITE_THREADS, v)?;
        }

        let config = Self {
            sink,
            store,
            writer,
            monitoring: MonitoringConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sink.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }

        if self.sink.table.trim().is_empty() {
            return Err(Error::Config("Target table is required".into()));
        }

        if self.sink.serializer.trim().is_empty() {
            return Err(Error::Config("Serializer name must not be empty".into()));
        }

        if self.writer.max_memory == 0 {
            return Err(Error::Config("writer max_memory must be positive".into()));
        }

        if self.writer.max_write_threads == 0 {
            return Err(Error::Config(
                "writer max_write_threads must be positive".into(),
            ));
        }

        if self.writer.max_latency_ms == 0 {
            tracing::warn!("writer max_latency_ms is 0, latency-triggered flushes are disabled");
        }

        Ok(())
    }

    /// Validate the parameters needed to locate and authenticate to the store.
    ///
    /// Called when the sink has no injected connector.
    pub fn validate_connection(&self) -> Result<()> {
        let store = &self.store;
        if store.instance.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("{} is required", keys::INSTANCE)));
        }
        if store.zk_servers.is_empty() {
            return Err(Error::Config(format!("{} is required", keys::ZK_SERVERS)));
        }
        if store.user.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("{} is required", keys::USER)));
        }
        if store.password.is_none() {
            return Err(Error::Config(format!("{} is required", keys::PASSWORD)));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_writer_config() {
        let config = WriterConfig::default();
        assert_eq!(config.max_memory, 1_000_000);
        assert_eq!(config.max_latency_ms, 1000);
        assert_eq!(config.max_write_threads, 2);
        assert_eq!(config.max_latency(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_latency_disables_timer() {
        let config = WriterConfig {
            max_latency_ms: 0,
            ..WriterConfig::default()
        };
        assert_eq!(config.max_latency(), None);
    }

    #[test]
    fn test_default_sink_config() {
        let config = SinkConfig::new("events");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.serializer, "simple");
        assert_eq!(config.table, "events");
        assert!(config.serializer_options.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let config = Config::for_table("events");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_batch_size() {
        let mut config = Config::for_table("events");
        config.sink.batch_size = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_config_validation_empty_table() {
        let config = Config::for_table("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_writer_knobs() {
        let mut config = Config::for_table("events");
        config.writer.max_write_threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::for_table("events");
        config.writer.max_memory = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_connection_requires_all_params() {
        let mut config = Config::for_table("events");
        assert!(config.validate_connection().is_err());

        config.store = StoreConfig {
            instance: Some("test-instance".into()),
            zk_servers: vec!["zk1:2181".into()],
            user: Some("root".into()),
            password: Some("secret".into()),
        };
        assert!(config.validate_connection().is_ok());

        config.store.password = None;
        let err = config.validate_connection().unwrap_err();
        assert!(err.to_string().contains("accumulo.password"));
    }

    #[test]
    fn test_from_toml() {
        let content = r#"
            [sink]
            table = "events"
            batch_size = 25

            [sink.serializer_options]
            charset = "utf-8"

            [store]
            instance = "test-instance"
            zk_servers = ["zk1:2181", "zk2:2181"]
            user = "root"
            password = "secret"

            [writer]
            max_memory = 2048

            [monitoring]
            log_format = "text"
        "#;

        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.sink.batch_size, 25);
        assert_eq!(config.sink.serializer, "simple");
        assert_eq!(
            config.sink.serializer_options.get("charset"),
            Some(&"utf-8".to_string())
        );
        assert_eq!(config.store.zk_servers.len(), 2);
        assert_eq!(config.writer.max_memory, 2048);
        assert_eq!(config.writer.max_latency_ms, 1000);
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
        assert_eq!(config.monitoring.log_level, LogLevel::Info);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q2kv.toml");
        std::fs::write(&path, "[sink]\ntable = \"events\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sink.table, "events");
        assert_eq!(config.monitoring.metrics_port, 9090);
        assert_eq!(config.monitoring.health_port, 8080);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q2kv.toml");
        std::fs::write(&path, "[sink]\ntable = \"events\"\nbatch_size = 0\n").unwrap();

        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_from_properties_defaults() {
        let config = Config::from_properties(&props(&[("accumulo.table", "events")])).unwrap();
        assert_eq!(config.sink.table, "events");
        assert_eq!(config.sink.batch_size, 100);
        assert_eq!(config.sink.serializer, "simple");
        assert_eq!(config.writer, WriterConfig::default());
        assert!(config.store.instance.is_none());
    }

    #[test]
    fn test_from_properties_full() {
        let config = Config::from_properties(&props(&[
            ("accumulo.table", "events"),
            ("batchSize", "10"),
            ("accumulo.instance", "test-instance"),
            ("accumulo.zkServers", "zk1:2181, zk2:2181"),
            ("accumulo.user", "root"),
            ("accumulo.password", "secret"),
            ("maxMemory", "4096"),
            ("accumulo.maxLatency", "250"),
            ("accumulo.maxWriteThreads", "4"),
            ("serializer.charset", "utf-8"),
        ]))
        .unwrap();

        assert_eq!(config.sink.batch_size, 10);
        assert_eq!(config.store.zk_servers, vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(config.writer.max_memory, 4096);
        assert_eq!(config.writer.max_latency_ms, 250);
        assert_eq!(config.writer.max_write_threads, 4);
        assert_eq!(
            config.sink.serializer_options.get("charset"),
            Some(&"utf-8".to_string())
        );
        assert!(config.validate_connection().is_ok());
    }

    #[test]
    fn test_from_properties_missing_table() {
        let err = Config::from_properties(&props(&[("batchSize", "10")])).unwrap_err();
        assert!(err.to_string().contains("accumulo.table is required"));
    }

    #[test]
    fn test_from_properties_bad_number() {
        let err = Config::from_properties(&props(&[
            ("accumulo.table", "events"),
            ("batchSize", "ten"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_properties_zero_batch_size() {
        let result = Config::from_properties(&props(&[
            ("accumulo.table", "events"),
            ("batchSize", "0"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level_directives() {
        assert_eq!(LogLevel::default().as_directive(), "info");
        assert_eq!(LogLevel::Trace.as_directive(), "trace");
        assert_eq!(LogFormat::default(), LogFormat::Json);
    }
}
