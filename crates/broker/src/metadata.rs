//! Broker metadata layout in the coordination service.
//!
//! ```text
//! /brokers/ids/{id}                               BrokerRegistration (ephemeral)
//! /brokers/topics/{topic}                         TopicAssignment
//! /brokers/topics/{topic}/partitions/{p}/state    LeaderAndIsr
//! /controller                                     ControllerInfo (ephemeral)
//! /controller_epoch                               epoch as a decimal string
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const BROKERS_PATH: &str = "/brokers";
pub const BROKER_IDS_PATH: &str = "/brokers/ids";
pub const TOPICS_PATH: &str = "/brokers/topics";
pub const CONTROLLER_PATH: &str = "/controller";
pub const CONTROLLER_EPOCH_PATH: &str = "/controller_epoch";

/// Persistent paths every broker expects to exist.
pub const BASE_PATHS: [&str; 3] = [BROKERS_PATH, BROKER_IDS_PATH, TOPICS_PATH];

/// Leader id used while no leader is known.
pub const NO_LEADER: i32 = -1;

pub fn broker_path(broker_id: i32) -> String {
    format!("{BROKER_IDS_PATH}/{broker_id}")
}

pub fn topic_path(topic: &str) -> String {
    format!("{TOPICS_PATH}/{topic}")
}

pub fn partitions_path(topic: &str) -> String {
    format!("{TOPICS_PATH}/{topic}/partitions")
}

pub fn partition_state_path(topic: &str, partition: i32) -> String {
    format!("{TOPICS_PATH}/{topic}/partitions/{partition}/state")
}

/// Registration written by a broker at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRegistration {
    pub version: i32,
    pub host: String,
    pub port: u16,
    pub endpoints: Vec<String>,
    pub timestamp: String,
}

impl BrokerRegistration {
    pub fn new(host: &str, port: u16, timestamp_ms: i64) -> Self {
        Self {
            version: 4,
            host: host.to_owned(),
            port,
            endpoints: vec![format!("PLAINTEXT://{host}:{port}")],
            timestamp: timestamp_ms.to_string(),
        }
    }
}

/// Replica assignment of a topic: partition id → broker ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicAssignment {
    pub version: i32,
    /// Keys are partition ids rendered as strings
    pub partitions: BTreeMap<String, Vec<i32>>,
}

impl TopicAssignment {
    pub fn new(assignment: impl IntoIterator<Item = (i32, Vec<i32>)>) -> Self {
        Self {
            version: 1,
            partitions: assignment
                .into_iter()
                .map(|(partition, replicas)| (partition.to_string(), replicas))
                .collect(),
        }
    }

    pub fn partition_count(&self) -> i32 {
        i32::try_from(self.partitions.len()).unwrap_or(i32::MAX)
    }

    /// `(partition, replicas)` in ascending partition order. Entries whose
    /// key is not a number are skipped.
    pub fn replicas(&self) -> Vec<(i32, Vec<i32>)> {
        let mut parsed: Vec<(i32, Vec<i32>)> = self
            .partitions
            .iter()
            .filter_map(|(key, replicas)| key.parse().ok().map(|p| (p, replicas.clone())))
            .collect();
        parsed.sort_by_key(|(partition, _)| *partition);
        parsed
    }

    pub fn replicas_of(&self, partition: i32) -> Option<&[i32]> {
        self.partitions
            .get(&partition.to_string())
            .map(Vec::as_slice)
    }
}

/// Partition leadership state written by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAndIsr {
    pub controller_epoch: i32,
    pub leader: i32,
    pub version: i32,
    pub leader_epoch: i32,
    pub isr: Vec<i32>,
}

impl LeaderAndIsr {
    /// A leader id that can name a real broker.
    pub fn has_valid_leader(&self) -> bool {
        self.leader >= 0
    }

    pub fn has_isr(&self) -> bool {
        !self.isr.is_empty()
    }
}

/// Content of the `/controller` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub version: i32,
    pub brokerid: i32,
    pub timestamp: String,
}

impl ControllerInfo {
    pub fn new(broker_id: i32, timestamp_ms: i64) -> Self {
        Self {
            version: 1,
            brokerid: broker_id,
            timestamp: timestamp_ms.to_string(),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
