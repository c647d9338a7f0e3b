//! Wire format between [`CoordinationClient`](crate::client::CoordinationClient)
//! and the server: one JSON object per line in each direction.
//!
//! ```text
//! → {"xid":3,"request":{"op":"get_data","path":"/controller"}}
//! ← {"xid":3,"zxid":12,"result":{"Ok":{"type":"data","data":"{...}","stat":{...}}}}
//! ```
//!
//! The first request on a connection must be `connect`; it opens the session
//! that owns any ephemeral nodes created over the connection.

use harness_core::wire::Correlated;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::tree::{CreateMode, Stat};

/// Largest accepted request line.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// `xid` used for responses to lines that could not be parsed.
pub const UNPARSEABLE_XID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub xid: i64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Connect {
        session_timeout_ms: u64,
    },
    Ping,
    Create {
        path: String,
        #[serde(default)]
        data: String,
        #[serde(default)]
        mode: CreateMode,
    },
    GetData {
        path: String,
    },
    SetData {
        path: String,
        data: String,
        #[serde(default)]
        version: Option<i32>,
    },
    Exists {
        path: String,
    },
    GetChildren {
        path: String,
    },
    Delete {
        path: String,
        #[serde(default)]
        version: Option<i32>,
    },
    Close,
}

impl Request {
    /// Operation name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Ping => "ping",
            Self::Create { .. } => "create",
            Self::GetData { .. } => "get_data",
            Self::SetData { .. } => "set_data",
            Self::Exists { .. } => "exists",
            Self::GetChildren { .. } => "get_children",
            Self::Delete { .. } => "delete",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Echo of the request `xid`
    pub xid: i64,
    /// Last zxid applied when the response was produced
    pub zxid: i64,
    pub result: Result<Reply, NodeError>,
}

impl Correlated for ResponseFrame {
    fn correlation_id(&self) -> i64 {
        self.xid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Connected { session_id: i64, timeout_ms: u64 },
    Pong,
    Created { path: String },
    Data { data: String, stat: Stat },
    Exists { stat: Option<Stat> },
    Children { children: Vec<String> },
    Done,
}
