//! Controller: elects partition leaders for newly registered topics.
//!
//! The controller periodically lists `/brokers/topics`; for every partition
//! without a state node it picks the first live replica as leader, lets the
//! replica manager open the log if that leader is this broker, and then
//! writes `LeaderAndIsr`. The scan period is what makes a freshly created
//! topic take a moment to become usable.

use std::sync::Arc;
use std::time::Duration;

use harness_coordination::tree::CreateMode;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::{AdminClient, to_json};
use crate::error::BrokerError;
use crate::log::TopicPartition;
use crate::metadata::{
    self, CONTROLLER_EPOCH_PATH, CONTROLLER_PATH, ControllerInfo, LeaderAndIsr, now_ms,
};
use crate::replica::ReplicaManager;

/// The elected controller of this broker.
#[derive(Debug)]
pub struct Controller {
    broker_id: i32,
    epoch: i32,
    admin: AdminClient,
    replicas: Arc<ReplicaManager>,
    interval: Duration,
}

impl Controller {
    /// Try to become controller. `Ok(None)` when another broker holds the role.
    pub async fn elect(
        admin: AdminClient,
        broker_id: i32,
        replicas: Arc<ReplicaManager>,
        interval: Duration,
    ) -> Result<Option<Self>, BrokerError> {
        let zk = admin.coordination();
        let info = to_json(&ControllerInfo::new(broker_id, now_ms()))?;
        match zk.create(CONTROLLER_PATH, &info, CreateMode::Ephemeral).await {
            Ok(_) => {}
            Err(e) if e.is_node_exists() => {
                debug!(broker_id, "controller already elected elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let epoch = match zk.get_data_opt(CONTROLLER_EPOCH_PATH).await? {
            Some((data, stat)) => {
                let epoch = data.trim().parse::<i32>().unwrap_or(0) + 1;
                zk.set_data(CONTROLLER_EPOCH_PATH, &epoch.to_string(), Some(stat.version))
                    .await?;
                epoch
            }
            None => {
                zk.create(CONTROLLER_EPOCH_PATH, "1", CreateMode::Persistent)
                    .await?;
                1
            }
        };

        info!(broker_id, epoch, "elected controller");
        Ok(Some(Self {
            broker_id,
            epoch,
            admin,
            replicas,
            interval,
        }))
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    /// Scan for unelected partitions until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.elect_leaders().await {
                        warn!(broker_id = self.broker_id, error = %e, "controller scan failed");
                    }
                }
            }
        }
        debug!(broker_id = self.broker_id, "controller loop stopped");
    }

    /// One scan. Returns how many partitions got a leader.
    pub async fn elect_leaders(&self) -> Result<usize, BrokerError> {
        let live = self.admin.live_brokers().await?;
        let mut elected = 0;

        for topic in self.admin.list_topics().await? {
            let Some(assignment) = self.admin.topic_assignment(&topic).await? else {
                continue;
            };
            for (partition, replicas) in assignment.replicas() {
                let tp = TopicPartition::new(topic.as_str(), partition);
                if let Some(state) = self.admin.partition_state(&topic, partition).await? {
                    // Leader recorded earlier but the log is not open here yet.
                    if state.leader == self.broker_id && !self.replicas.is_leader(&tp) {
                        self.replicas.become_leader(&tp)?;
                    }
                    continue;
                }

                let Some(&leader) = replicas.iter().find(|id| live.contains(id)) else {
                    debug!(partition = %tp, "no live replica, leader not available");
                    continue;
                };
                if leader == self.broker_id {
                    self.replicas.become_leader(&tp)?;
                }

                let state = LeaderAndIsr {
                    controller_epoch: self.epoch,
                    leader,
                    version: 1,
                    leader_epoch: 0,
                    isr: replicas
                        .iter()
                        .copied()
                        .filter(|id| live.contains(id))
                        .collect(),
                };
                match self
                    .admin
                    .coordination()
                    .create_recursive(
                        &metadata::partition_state_path(&topic, partition),
                        &to_json(&state)?,
                        CreateMode::Persistent,
                    )
                    .await
                {
                    Ok(_) => {
                        debug!(partition = %tp, leader, "partition leader elected");
                        elected += 1;
                    }
                    Err(e) if e.is_node_exists() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(elected)
    }
}

/// Delete `/controller` if `broker_id` holds it. Returns whether it did.
pub async fn resign(admin: &AdminClient, broker_id: i32) -> Result<bool, BrokerError> {
    match admin.controller().await? {
        Some(info) if info.brokerid == broker_id => {
            match admin.coordination().delete(CONTROLLER_PATH, None).await {
                Ok(()) => {}
                Err(e) if e.is_no_node() => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            info!(broker_id, "resigned as controller");
            Ok(true)
        }
        _ => Ok(false),
    }
}
