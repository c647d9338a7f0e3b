//! Broker error types.

use harness_coordination::error::CoordinationError;
use harness_core::error::{CodecError, HarnessError};
use harness_core::wire::WireError;

use crate::protocol::ErrorCode;

/// Broker, admin and client-session errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("config error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("invalid topic name '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("topic '{topic}' already exists")]
    TopicExists { topic: String },

    #[error("unknown topic '{topic}'")]
    UnknownTopic { topic: String },

    #[error("invalid partition count {partitions} for topic '{topic}': must be > 0")]
    InvalidPartitions { topic: String, partitions: i32 },

    #[error(
        "invalid replication factor {replication_factor} for topic '{topic}': \
         must be in 1..={live_brokers} (live brokers)"
    )]
    InvalidReplicationFactor {
        topic: String,
        replication_factor: i16,
        live_brokers: usize,
    },

    #[error("corrupt log segment {path}: {reason}")]
    CorruptLog { path: String, reason: String },

    /// Error code returned by the broker
    #[error("broker returned {code}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("could not connect to broker at {addr} within {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("broker request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("broker connection closed")]
    ConnectionClosed,

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("broker already started")]
    AlreadyStarted,

    #[error("broker not running")]
    NotRunning,

    #[error("session closed")]
    SessionClosed,
}

impl BrokerError {
    pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Error code carried by a [`BrokerError::Server`].
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<WireError> for BrokerError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => Self::ConnectionClosed,
            WireError::Timeout { timeout_ms } => Self::RequestTimeout { timeout_ms },
            WireError::Encode(reason) => Self::Protocol(reason),
        }
    }
}

impl From<BrokerError> for HarnessError {
    fn from(err: BrokerError) -> Self {
        HarnessError::Broker(Box::new(err))
    }
}
