//! Embedded single-node broker.
//!
//! The broker keeps its cluster metadata in the coordination service using
//! Kafka's layout (`/brokers/ids`, `/brokers/topics`, `/controller`) and
//! serves a small newline-delimited JSON protocol over loopback TCP.
//!
//! - [`server`]: [`Broker`], startup, controlled shutdown and the listener
//! - [`controller`]: leader election for newly created partitions
//! - [`admin`]: [`AdminClient`], topic creation and metadata queries
//! - [`log`] / [`replica`]: per-partition record logs
//! - [`producer`] / [`consumer`]: client sessions used by tests

pub mod admin;
pub mod client;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod handler;
pub mod log;
pub mod metadata;
pub mod offsets;
pub mod partitioner;
pub mod producer;
pub mod protocol;
pub mod replica;
pub mod server;

#[cfg(test)]
mod test_support;

pub use admin::{AdminClient, TopicDescriptor};
pub use client::BrokerConnection;
pub use config::ServerConfig;
pub use consumer::{ConsumedRecord, ConsumerCounter, ConsumerSession};
pub use error::BrokerError;
pub use protocol::ErrorCode;
pub use producer::ProducerSession;
pub use server::{Broker, BrokerState};
