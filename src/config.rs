use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";

/// Error returned when configuration cannot be loaded or is invalid
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Refuse new deliveries while the queue is full
    RejectNew,
    /// Evict the oldest queued delivery to make room
    DropOldest,
}

impl BackpressurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressurePolicy::RejectNew => "reject_new",
            BackpressurePolicy::DropOldest => "drop_oldest",
        }
    }
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::DropOldest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterBackend {
    Memory,
    /// `INCR` against a Redis server
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PubSubBackend {
    /// Publishing disabled
    Disabled,
    /// In-process broadcast channel (single gateway process)
    Local,
    /// PUBLISH/SUBSCRIBE against a Redis server
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

/// Ingest endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Listen address of the HTTP ingest endpoint
    pub addr: String,
    /// Largest accepted request body in bytes
    pub max_body_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Live-channel gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub addr: String,
    /// Size of the bounded delivery worker pool
    pub dispatch_workers: usize,
    /// Deliveries that may wait for a worker
    pub dispatch_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Upper bound on a single transport write
    pub send_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            addr: "0.0.0.0:8081".to_string(),
            dispatch_workers: 8,
            dispatch_queue_capacity: 10_000,
            backpressure: BackpressurePolicy::DropOldest,
            send_timeout_ms: 5_000,
        }
    }
}

impl GatewayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Windowed aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Tumbling window size in milliseconds
    pub window_size_ms: u64,
    /// Close every open bucket after this long without events
    pub idle_flush_ms: u64,
    /// Log throughput every N events per partition
    pub progress_every: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            window_size_ms: 60_000,
            idle_flush_ms: 120_000,
            progress_every: 10_000,
        }
    }
}

impl AggregatorConfig {
    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }
}

/// Event log topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub partitions: usize,
    /// Bounded queue length per partition per consumer group
    pub partition_capacity: usize,
    pub events_topic: String,
    pub aggregates_topic: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            partitions: 3,
            partition_capacity: 4_096,
            events_topic: "events".to_string(),
            aggregates_topic: "events-aggregated".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterStoreConfig {
    pub backend: CounterBackend,
    /// Connection URL when `backend = "redis"`
    pub url: String,
    pub connect_timeout_ms: u64,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        CounterStoreConfig {
            backend: CounterBackend::Memory,
            url: DEFAULT_REDIS_URL.to_string(),
            connect_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub backend: PubSubBackend,
    /// Connection URL when `backend = "redis"`
    pub url: String,
    pub channel: String,
    /// Buffer of the in-process broadcast channel
    pub local_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        PubSubConfig {
            backend: PubSubBackend::Disabled,
            url: DEFAULT_REDIS_URL.to_string(),
            channel: "live-updates".to_string(),
            local_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ingest: IngestConfig,
    pub gateway: GatewayConfig,
    pub aggregator: AggregatorConfig,
    pub log: LogConfig,
    pub counter_store: CounterStoreConfig,
    pub pubsub: PubSubConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Config bound to ephemeral local ports, small windows and short timeouts
    pub fn test() -> Self {
        let mut config = AppConfig::default();
        config.ingest.addr = "127.0.0.1:0".to_string();
        config.gateway.addr = "127.0.0.1:0".to_string();
        config.gateway.dispatch_workers = 2;
        config.gateway.dispatch_queue_capacity = 64;
        config.gateway.send_timeout_ms = 1_000;
        config.aggregator.window_size_ms = 60;
        config.aggregator.idle_flush_ms = 60_000;
        config.log.partition_capacity = 256;
        config
    }

    /// Apply `RTA_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("RTA_INGEST_ADDR") {
            self.ingest.addr = addr;
        }
        if let Some(addr) = lookup("RTA_GATEWAY_ADDR") {
            self.gateway.addr = addr;
        }
        if let Some(raw) = lookup("RTA_WINDOW_SIZE_MS") {
            self.aggregator.window_size_ms = parse_env("RTA_WINDOW_SIZE_MS", &raw)?;
        }
        if let Some(raw) = lookup("RTA_PARTITIONS") {
            self.log.partitions = parse_env("RTA_PARTITIONS", &raw)?;
        }
        if let Some(url) = lookup("RTA_COUNTER_STORE_URL") {
            self.counter_store.backend = CounterBackend::Redis;
            self.counter_store.url = url;
        }
        if let Some(url) = lookup("RTA_PUBSUB_URL") {
            self.pubsub.backend = PubSubBackend::Redis;
            self.pubsub.url = url;
        }
        if let Some(raw) = lookup("RTA_LOG_FORMAT") {
            self.logging.format = match raw.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "RTA_LOG_FORMAT must be 'text' or 'json', got '{}'",
                        other
                    )))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_window_size_ms(mut self, size_ms: u64) -> Self {
        self.aggregator.window_size_ms = size_ms;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.log.partitions = partitions;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.gateway.backpressure = policy;
        self
    }

    pub fn with_pubsub(mut self, backend: PubSubBackend) -> Self {
        self.pubsub.backend = backend;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 7] = [
            (self.aggregator.window_size_ms > 0, "aggregator.window_size_ms must be > 0"),
            (self.log.partitions > 0, "log.partitions must be > 0"),
            (self.log.partition_capacity > 0, "log.partition_capacity must be > 0"),
            (self.gateway.dispatch_workers > 0, "gateway.dispatch_workers must be > 0"),
            (
                self.gateway.dispatch_queue_capacity > 0,
                "gateway.dispatch_queue_capacity must be > 0",
            ),
            (self.aggregator.idle_flush_ms > 0, "aggregator.idle_flush_ms must be > 0"),
            (self.ingest.max_body_bytes > 0, "ingest.max_body_bytes must be > 0"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(ConfigError::Invalid(msg.to_string())),
            None => Ok(()),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has an invalid value '{}'", name, raw)))
}
