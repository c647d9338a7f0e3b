//! Broker server configuration.
//!
//! Derived from the shared harness settings plus the live coordination
//! endpoint, which is only known once the coordination service has bound its
//! port.
//!
//! ```
//! use harness_broker::config::ServerConfig;
//! use harness_core::config::HarnessConfig;
//!
//! let settings = HarnessConfig::default().resolve_directories();
//! let config = ServerConfig::from_core(&settings, "127.0.0.1:2181");
//! assert_eq!(config.coordination_connect, "127.0.0.1:2181");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use harness_core::config::HarnessConfig;

use crate::error::BrokerError;

/// Settings of one embedded broker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub broker_id: i32,
    pub host: String,
    /// `0` picks an ephemeral port
    pub port: u16,
    pub log_dirs: Vec<PathBuf>,
    /// `host:port` of the coordination service
    pub coordination_connect: String,
    pub coordination_connection_timeout: Duration,
    pub coordination_session_timeout: Duration,
    pub num_partitions: i32,
    pub default_replication_factor: i16,
    pub auto_create_topics: bool,
    pub controller_poll_interval: Duration,
    pub controlled_shutdown: bool,
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn from_core(settings: &HarnessConfig, coordination_connect: &str) -> Self {
        let broker = &settings.broker;
        Self {
            broker_id: broker.broker_id,
            host: broker.host.clone(),
            port: broker.port,
            log_dirs: broker.log_dir_paths(),
            coordination_connect: coordination_connect.to_owned(),
            coordination_connection_timeout: settings.coordination.connection_timeout(),
            coordination_session_timeout: settings.coordination.session_timeout(),
            num_partitions: broker.num_partitions,
            default_replication_factor: broker.default_replication_factor,
            auto_create_topics: broker.auto_create_topics,
            controller_poll_interval: Duration::from_millis(broker.controller_poll_interval_ms),
            controlled_shutdown: broker.controlled_shutdown,
            max_connections: broker.max_connections,
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.broker_id < 0 {
            return Err(config_error("broker_id", "must be >= 0"));
        }
        if self.log_dirs.is_empty() {
            return Err(config_error("log_dirs", "at least one log directory is required"));
        }
        if self.coordination_connect.is_empty() {
            return Err(config_error("coordination_connect", "must not be empty"));
        }
        if self.controller_poll_interval.is_zero() {
            return Err(config_error("controller_poll_interval", "must be positive"));
        }
        if self.max_connections == 0 {
            return Err(config_error("max_connections", "must be positive"));
        }
        Ok(())
    }
}

fn config_error(field: &str, reason: &str) -> BrokerError {
    BrokerError::Config {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}
