//! Embedded single-node coordination service.
//!
//! A ZooKeeper-style hierarchical key space served over loopback TCP:
//!
//! - [`tree`]: znodes, versions, ephemeral and sequential nodes
//! - [`txn_log`]: append-only JSON-lines transaction log in the data dir
//! - [`protocol`]: newline-delimited JSON request/response frames
//! - [`server`]: [`CoordinationServer`], the listener and per-connection sessions
//! - [`client`]: [`CoordinationClient`], one session used for administration
//!   and metadata queries

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tree;
pub mod txn_log;

pub use client::CoordinationClient;
pub use error::{CoordinationError, NodeError};
pub use server::CoordinationServer;
pub use tree::{CreateMode, Stat, ZNodeTree};
