//! Topic administration over the coordination service.
//!
//! Topics are created the way a Kafka admin tool does it: validate, compute a
//! replica assignment over the live brokers, and write it to
//! `/brokers/topics/{topic}`. Leadership is then picked up asynchronously by
//! the controller, so a created topic is not immediately usable.

use std::sync::Arc;

use harness_coordination::client::CoordinationClient;
use harness_coordination::tree::CreateMode;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::BrokerError;
use crate::metadata::{
    self, BROKER_IDS_PATH, BrokerRegistration, CONTROLLER_PATH, ControllerInfo, LeaderAndIsr,
    TOPICS_PATH, TopicAssignment,
};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 249;

/// Requested topic layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl TopicDescriptor {
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Validate a topic name: `[A-Za-z0-9._-]`, 1..=249 chars, not `.` or `..`.
pub fn validate_topic_name(name: &str) -> Result<(), BrokerError> {
    let invalid = |reason: String| BrokerError::InvalidTopic {
        topic: name.to_owned(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty".to_owned()));
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err(invalid(format!(
            "name is {} chars, max {MAX_TOPIC_NAME_LENGTH}",
            name.len()
        )));
    }
    if name == "." || name == ".." {
        return Err(invalid("'.' and '..' are reserved".to_owned()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(invalid(format!(
            "illegal character '{}'; only ASCII letters, digits, '.', '_' and '-' are allowed",
            bad.escape_default()
        )));
    }
    Ok(())
}

/// Round-robin replica assignment: partition `p` gets brokers
/// `live[(p + r) % live.len()]` for `r` in `0..replication_factor`.
pub fn assign_replicas(
    live_brokers: &[i32],
    partitions: i32,
    replication_factor: i16,
) -> TopicAssignment {
    let n = live_brokers.len();
    let rf = usize::try_from(replication_factor).unwrap_or(0);
    TopicAssignment::new((0..partitions).map(|p| {
        let start = usize::try_from(p).unwrap_or(0);
        let replicas = if n == 0 {
            Vec::new()
        } else {
            (0..rf).map(|r| live_brokers[(start + r) % n]).collect()
        };
        (p, replicas)
    }))
}

/// Administrative view of the cluster metadata.
#[derive(Debug, Clone)]
pub struct AdminClient {
    coordination: Arc<CoordinationClient>,
}

impl AdminClient {
    pub fn new(coordination: Arc<CoordinationClient>) -> Self {
        Self { coordination }
    }

    pub fn coordination(&self) -> &Arc<CoordinationClient> {
        &self.coordination
    }

    /// Validate and register a topic. Returns the written assignment.
    pub async fn create_topic(
        &self,
        topic: &TopicDescriptor,
    ) -> Result<TopicAssignment, BrokerError> {
        validate_topic_name(&topic.name)?;
        if topic.partitions <= 0 {
            return Err(BrokerError::InvalidPartitions {
                topic: topic.name.clone(),
                partitions: topic.partitions,
            });
        }

        let live = self.live_brokers().await?;
        let rf_fits = usize::try_from(topic.replication_factor)
            .is_ok_and(|rf| rf > 0 && rf <= live.len());
        if !rf_fits {
            return Err(BrokerError::InvalidReplicationFactor {
                topic: topic.name.clone(),
                replication_factor: topic.replication_factor,
                live_brokers: live.len(),
            });
        }
        if self.topic_exists(&topic.name).await? {
            return Err(BrokerError::TopicExists {
                topic: topic.name.clone(),
            });
        }

        let assignment = assign_replicas(&live, topic.partitions, topic.replication_factor);
        let data = to_json(&assignment)?;
        match self
            .coordination
            .create_recursive(&metadata::topic_path(&topic.name), &data, CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_node_exists() => {
                return Err(BrokerError::TopicExists {
                    topic: topic.name.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!(harness_core::metrics::HARNESS_TOPICS_CREATED_TOTAL).increment(1);
        info!(
            topic = %topic.name,
            partitions = topic.partitions,
            replication_factor = topic.replication_factor,
            "topic created"
        );
        Ok(assignment)
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool, BrokerError> {
        Ok(self
            .coordination
            .exists(&metadata::topic_path(name))
            .await?
            .is_some())
    }

    /// Registered topics in lexicographic order.
    pub async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        self.children_or_empty(TOPICS_PATH).await
    }

    /// Ids of registered brokers, ascending.
    pub async fn live_brokers(&self) -> Result<Vec<i32>, BrokerError> {
        let mut ids: Vec<i32> = self
            .children_or_empty(BROKER_IDS_PATH)
            .await?
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn broker_registration(
        &self,
        broker_id: i32,
    ) -> Result<Option<BrokerRegistration>, BrokerError> {
        self.read_json(&metadata::broker_path(broker_id)).await
    }

    pub async fn topic_assignment(
        &self,
        name: &str,
    ) -> Result<Option<TopicAssignment>, BrokerError> {
        self.read_json(&metadata::topic_path(name)).await
    }

    /// Leadership state of one partition. `None` while the state node is
    /// missing or still empty.
    pub async fn partition_state(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<LeaderAndIsr>, BrokerError> {
        self.read_json(&metadata::partition_state_path(topic, partition))
            .await
    }

    pub async fn controller(&self) -> Result<Option<ControllerInfo>, BrokerError> {
        self.read_json(CONTROLLER_PATH).await
    }

    async fn children_or_empty(&self, path: &str) -> Result<Vec<String>, BrokerError> {
        match self.coordination.get_children(path).await {
            Ok(children) => Ok(children),
            Err(e) if e.is_no_node() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, BrokerError> {
        let Some((data, _)) = self.coordination.get_data_opt(path).await? else {
            return Ok(None);
        };
        if data.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| BrokerError::Protocol(format!("invalid metadata at {path}: {e}")))
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, BrokerError> {
    serde_json::to_string(value).map_err(|e| BrokerError::Protocol(e.to_string()))
}
