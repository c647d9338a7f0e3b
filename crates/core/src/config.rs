//! Harness settings: `kafka-harness.toml` parsing and runtime configuration.
//!
//! [`HarnessConfig`] is the immutable settings object shared (as
//! `Arc<HarnessConfig>`) by every harness component. Each component reads only
//! its own section.
//!
//! # Loading precedence
//! 1. CLI arguments (highest)
//! 2. Environment variables (`KAFKA_HARNESS_BROKER_PORT=9092` style)
//! 3. Configuration file (`kafka-harness.toml`)
//! 4. Defaults (`Default` impls)
//!
//! The defaults are test-ready: ports are `0` (ephemeral) and empty directory
//! settings are replaced by fresh temporary directories in
//! [`HarnessConfig::resolve_directories`].
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), harness_core::error::HarnessError> {
//! use harness_core::config::HarnessConfig;
//!
//! let config = HarnessConfig::load("kafka-harness.toml").await?;
//! let config = HarnessConfig::parse("[broker]\nbroker_id = 3")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::SerdeFormat;
use crate::error::{ConfigError, HarnessError};
use crate::retry::PollSpec;

/// Complete harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Logging settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Embedded coordination service
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Embedded broker
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Producer session
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Consumer sessions
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Readiness-poll windows
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl HarnessConfig {
    /// Load a TOML file, apply environment overrides and validate.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HarnessError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                HarnessError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, HarnessError> {
        toml::from_str(toml_str).map_err(|e| {
            HarnessError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Override values from environment variables.
    ///
    /// Naming rule: `KAFKA_HARNESS_{SECTION}_{FIELD}`,
    /// e.g. `KAFKA_HARNESS_BROKER_PORT=9092`.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "KAFKA_HARNESS_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "KAFKA_HARNESS_GENERAL_LOG_FORMAT");

        // Coordination
        override_string(&mut self.coordination.host, "KAFKA_HARNESS_COORDINATION_HOST");
        override_parsed(
            &mut self.coordination.client_port,
            "KAFKA_HARNESS_COORDINATION_CLIENT_PORT",
        );
        override_string(
            &mut self.coordination.data_dir,
            "KAFKA_HARNESS_COORDINATION_DATA_DIR",
        );
        override_parsed(
            &mut self.coordination.tick_time_ms,
            "KAFKA_HARNESS_COORDINATION_TICK_TIME_MS",
        );
        override_parsed(
            &mut self.coordination.session_timeout_ms,
            "KAFKA_HARNESS_COORDINATION_SESSION_TIMEOUT_MS",
        );
        override_parsed(
            &mut self.coordination.connection_timeout_ms,
            "KAFKA_HARNESS_COORDINATION_CONNECTION_TIMEOUT_MS",
        );
        override_parsed(
            &mut self.coordination.max_client_connections,
            "KAFKA_HARNESS_COORDINATION_MAX_CLIENT_CONNECTIONS",
        );

        // Broker
        override_parsed(&mut self.broker.broker_id, "KAFKA_HARNESS_BROKER_BROKER_ID");
        override_string(&mut self.broker.host, "KAFKA_HARNESS_BROKER_HOST");
        override_parsed(&mut self.broker.port, "KAFKA_HARNESS_BROKER_PORT");
        override_csv(&mut self.broker.log_dirs, "KAFKA_HARNESS_BROKER_LOG_DIRS");
        override_parsed(
            &mut self.broker.num_partitions,
            "KAFKA_HARNESS_BROKER_NUM_PARTITIONS",
        );
        override_parsed(
            &mut self.broker.default_replication_factor,
            "KAFKA_HARNESS_BROKER_DEFAULT_REPLICATION_FACTOR",
        );
        override_parsed(
            &mut self.broker.auto_create_topics,
            "KAFKA_HARNESS_BROKER_AUTO_CREATE_TOPICS",
        );
        override_parsed(
            &mut self.broker.controller_poll_interval_ms,
            "KAFKA_HARNESS_BROKER_CONTROLLER_POLL_INTERVAL_MS",
        );
        override_parsed(
            &mut self.broker.controlled_shutdown,
            "KAFKA_HARNESS_BROKER_CONTROLLED_SHUTDOWN",
        );

        // Producer
        override_string(&mut self.producer.client_id, "KAFKA_HARNESS_PRODUCER_CLIENT_ID");
        override_parsed(&mut self.producer.key_format, "KAFKA_HARNESS_PRODUCER_KEY_FORMAT");
        override_parsed(
            &mut self.producer.value_format,
            "KAFKA_HARNESS_PRODUCER_VALUE_FORMAT",
        );
        override_parsed(&mut self.producer.batch_size, "KAFKA_HARNESS_PRODUCER_BATCH_SIZE");
        override_parsed(&mut self.producer.linger_ms, "KAFKA_HARNESS_PRODUCER_LINGER_MS");
        override_parsed(&mut self.producer.retries, "KAFKA_HARNESS_PRODUCER_RETRIES");

        // Consumer
        override_string(&mut self.consumer.group_id, "KAFKA_HARNESS_CONSUMER_GROUP_ID");
        override_parsed(
            &mut self.consumer.auto_offset_reset,
            "KAFKA_HARNESS_CONSUMER_AUTO_OFFSET_RESET",
        );
        override_parsed(
            &mut self.consumer.enable_auto_commit,
            "KAFKA_HARNESS_CONSUMER_ENABLE_AUTO_COMMIT",
        );
        override_parsed(&mut self.consumer.key_format, "KAFKA_HARNESS_CONSUMER_KEY_FORMAT");
        override_parsed(
            &mut self.consumer.value_format,
            "KAFKA_HARNESS_CONSUMER_VALUE_FORMAT",
        );

        // Timeouts
        override_parsed(
            &mut self.timeouts.coordination_startup_ms,
            "KAFKA_HARNESS_TIMEOUTS_COORDINATION_STARTUP_MS",
        );
        override_parsed(
            &mut self.timeouts.broker_startup_ms,
            "KAFKA_HARNESS_TIMEOUTS_BROKER_STARTUP_MS",
        );
        override_parsed(
            &mut self.timeouts.propagation_ms,
            "KAFKA_HARNESS_TIMEOUTS_PROPAGATION_MS",
        );
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.coordination.host.is_empty() {
            return Err(invalid("coordination.host", "must not be empty"));
        }
        if self.coordination.tick_time_ms == 0 {
            return Err(invalid("coordination.tick_time_ms", "must be positive"));
        }
        if self.coordination.session_timeout_ms == 0 {
            return Err(invalid("coordination.session_timeout_ms", "must be positive"));
        }
        if self.coordination.max_client_connections == 0 {
            return Err(invalid(
                "coordination.max_client_connections",
                "must be positive",
            ));
        }

        if self.broker.broker_id < 0 {
            return Err(invalid("broker.broker_id", "must be >= 0"));
        }
        if self.broker.host.is_empty() {
            return Err(invalid("broker.host", "must not be empty"));
        }
        if self.broker.num_partitions < 1 {
            return Err(invalid("broker.num_partitions", "must be >= 1"));
        }
        if self.broker.default_replication_factor < 1 {
            return Err(invalid("broker.default_replication_factor", "must be >= 1"));
        }
        if self.broker.controller_poll_interval_ms == 0 {
            return Err(invalid(
                "broker.controller_poll_interval_ms",
                "must be positive",
            ));
        }

        if self.producer.batch_size == 0 {
            return Err(invalid("producer.batch_size", "must be positive"));
        }
        if self.consumer.group_id.is_empty() {
            return Err(invalid("consumer.group_id", "must not be empty"));
        }
        if self.consumer.max_poll_records == 0 {
            return Err(invalid("consumer.max_poll_records", "must be positive"));
        }

        let windows = [
            (
                "timeouts.coordination_startup_ms",
                self.timeouts.coordination_startup_ms,
                self.timeouts.coordination_poll_ms,
            ),
            (
                "timeouts.broker_startup_ms",
                self.timeouts.broker_startup_ms,
                self.timeouts.broker_poll_ms,
            ),
            (
                "timeouts.propagation_ms",
                self.timeouts.propagation_ms,
                self.timeouts.propagation_poll_ms,
            ),
        ];
        for (field, timeout, interval) in windows {
            if interval == 0 || interval > timeout {
                return Err(invalid(
                    field,
                    format!("poll interval {interval}ms must be in 1..={timeout}ms"),
                ));
            }
        }

        Ok(())
    }

    /// Return a copy where empty directory settings point at fresh
    /// per-instance temporary directories.
    ///
    /// Called once when a harness is constructed, so the shared settings
    /// never change afterwards.
    pub fn resolve_directories(mut self) -> Self {
        let needs_root = self.coordination.data_dir.is_empty() || self.broker.log_dirs.is_empty();
        if needs_root {
            let root =
                std::env::temp_dir().join(format!("kafka-harness-{}", uuid::Uuid::new_v4()));
            if self.coordination.data_dir.is_empty() {
                self.coordination.data_dir = root.join("coordination").display().to_string();
            }
            if self.broker.log_dirs.is_empty() {
                self.broker.log_dirs = vec![root.join("broker-logs").display().to_string()];
            }
        }
        self
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> HarnessError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

/// Embedded coordination service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Bind host for the client endpoint
    pub host: String,
    /// Client port (`0` picks an ephemeral port)
    pub client_port: u16,
    /// Data directory (empty: temporary directory)
    pub data_dir: String,
    /// Base time unit; negotiated session timeouts are clamped to `[2, 20]` ticks
    pub tick_time_ms: u64,
    /// Requested session timeout for clients
    pub session_timeout_ms: u64,
    /// Client connect timeout
    pub connection_timeout_ms: u64,
    /// Maximum concurrent client connections
    pub max_client_connections: usize,
}

impl CoordinationConfig {
    /// `host:port` connection string as configured.
    pub fn connect_string(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    /// Resolved data directory.
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            client_port: 0,
            data_dir: String::new(),
            tick_time_ms: 500,
            session_timeout_ms: 6_000,
            connection_timeout_ms: 10_000,
            max_client_connections: 60,
        }
    }
}

/// Embedded broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker id registered in the coordination service
    pub broker_id: i32,
    /// Listener host
    pub host: String,
    /// Listener port (`0` picks an ephemeral port)
    pub port: u16,
    /// Log directories (empty: one temporary directory)
    pub log_dirs: Vec<String>,
    /// Partition count for auto-created topics
    pub num_partitions: i32,
    /// Replication factor for auto-created topics
    pub default_replication_factor: i16,
    /// Create unknown topics on metadata/produce requests
    pub auto_create_topics: bool,
    /// Controller scan period for new topic assignments
    pub controller_poll_interval_ms: u64,
    /// Resign the controller role before stopping the listener
    pub controlled_shutdown: bool,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl BrokerConfig {
    /// Resolved log directories.
    pub fn log_dir_paths(&self) -> Vec<PathBuf> {
        self.log_dirs.iter().map(PathBuf::from).collect()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: 0,
            host: "127.0.0.1".to_owned(),
            port: 0,
            log_dirs: Vec::new(),
            num_partitions: 1,
            default_replication_factor: 1,
            auto_create_topics: true,
            controller_poll_interval_ms: 50,
            controlled_shutdown: true,
            max_connections: 128,
        }
    }
}

/// Producer session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Client id (empty: generated)
    pub client_id: String,
    /// Key serialization strategy
    pub key_format: SerdeFormat,
    /// Value serialization strategy
    pub value_format: SerdeFormat,
    /// Maximum records per produce request
    pub batch_size: usize,
    /// Time to wait for more records before sending a partial batch
    pub linger_ms: u64,
    /// Retries for retriable produce errors
    pub retries: u32,
    /// Pause between retries
    pub retry_backoff_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            key_format: SerdeFormat::String,
            value_format: SerdeFormat::String,
            batch_size: 500,
            linger_ms: 5,
            retries: 20,
            retry_backoff_ms: 100,
        }
    }
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
        }
    }
}

impl std::str::FromStr for OffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(ConfigError::InvalidValue {
                field: "auto_offset_reset".to_owned(),
                reason: format!("unknown policy '{other}', expected earliest or latest"),
            }),
        }
    }
}

/// Consumer session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer group id
    pub group_id: String,
    /// Start position without a committed offset
    pub auto_offset_reset: OffsetReset,
    /// Commit positions after every poll
    pub enable_auto_commit: bool,
    /// Key deserialization strategy
    pub key_format: SerdeFormat,
    /// Value deserialization strategy
    pub value_format: SerdeFormat,
    /// Maximum records returned per fetch
    pub max_poll_records: usize,
    /// Pause between empty fetches inside `poll`
    pub fetch_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "kafka-harness".to_owned(),
            auto_offset_reset: OffsetReset::Earliest,
            enable_auto_commit: true,
            key_format: SerdeFormat::String,
            value_format: SerdeFormat::String,
            max_poll_records: 500,
            fetch_backoff_ms: 20,
        }
    }
}

/// Readiness-poll windows (milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub coordination_startup_ms: u64,
    pub coordination_poll_ms: u64,
    pub broker_startup_ms: u64,
    pub broker_poll_ms: u64,
    pub propagation_ms: u64,
    pub propagation_poll_ms: u64,
    /// Wait for `is_running` after a lazy start in `server()`
    pub server_access_ms: u64,
}

impl TimeoutsConfig {
    pub fn coordination_startup(&self) -> PollSpec {
        PollSpec::from_millis(self.coordination_startup_ms, self.coordination_poll_ms)
    }

    pub fn broker_startup(&self) -> PollSpec {
        PollSpec::from_millis(self.broker_startup_ms, self.broker_poll_ms)
    }

    pub fn propagation(&self) -> PollSpec {
        PollSpec::from_millis(self.propagation_ms, self.propagation_poll_ms)
    }

    pub fn server_access(&self) -> PollSpec {
        PollSpec::from_millis(self.server_access_ms, self.broker_poll_ms)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            coordination_startup_ms: 5_000,
            coordination_poll_ms: 500,
            broker_startup_ms: 5_000,
            broker_poll_ms: 100,
            propagation_ms: 10_000,
            propagation_poll_ms: 100,
            server_access_ms: 5_000,
        }
    }
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse value from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
