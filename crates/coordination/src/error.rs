//! Coordination service error types.
//!
//! [`NodeError`] is the znode-level error that travels over the wire;
//! [`CoordinationError`] adds transport and lifecycle failures on top.

use harness_core::error::HarnessError;
use harness_core::wire::WireError;
use serde::{Deserialize, Serialize};

/// Znode operation failure, serialized in responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum NodeError {
    #[error("no node: {path}")]
    NoNode { path: String },

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("node has children: {path}")]
    NotEmpty { path: String },

    #[error("bad version for {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("ephemeral node cannot have children: {path}")]
    NoChildrenForEphemerals { path: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("session required: send connect first")]
    SessionRequired,

    #[error("malformed request: {reason}")]
    Malformed { reason: String },
}

/// Coordination service or client error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not connect to {addr} within {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("coordination service already started")]
    AlreadyStarted,

    #[error("coordination service not running")]
    NotRunning,
}

impl CoordinationError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::Node(NodeError::NoNode { .. }))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Self::Node(NodeError::NodeExists { .. }))
    }
}

impl From<WireError> for CoordinationError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => Self::ConnectionClosed,
            WireError::Timeout { timeout_ms } => Self::RequestTimeout { timeout_ms },
            WireError::Encode(reason) => Self::Protocol(reason),
        }
    }
}

impl From<CoordinationError> for HarnessError {
    fn from(err: CoordinationError) -> Self {
        HarnessError::Coordination(Box::new(err))
    }
}
