//! Partition propagation wait.
//!
//! After a topic is registered, the controller elects a leader per partition
//! and writes its state node. A partition counts as propagated only when the
//! state node exists and is non-empty, its leader is a valid broker id
//! (`>= 0`) and its ISR is non-empty.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use harness_broker::AdminClient;
use harness_broker::metadata::LeaderAndIsr;
use harness_core::metrics::{HARNESS_PROPAGATION_WAIT_SECONDS, LABEL_TOPIC};
use harness_core::{HarnessError, PollSpec, RetryPoller};

/// Source of partition leadership state.
pub trait PartitionStateSource: Send + Sync {
    /// Current leadership state, `None` while the state node is missing or
    /// empty.
    fn partition_state(
        &self,
        topic: &str,
        partition: i32,
    ) -> impl Future<Output = Result<Option<LeaderAndIsr>, HarnessError>> + Send;
}

impl PartitionStateSource for AdminClient {
    async fn partition_state(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<LeaderAndIsr>, HarnessError> {
        Ok(AdminClient::partition_state(self, topic, partition).await?)
    }
}

/// `true` when the partition has a structurally valid leader and a
/// non-empty ISR.
pub fn is_propagated(state: Option<&LeaderAndIsr>) -> bool {
    state.is_some_and(|s| s.has_valid_leader() && s.has_isr())
}

/// Poll `source` until `topic`/`partition` is propagated. Returns how long
/// the wait took.
///
/// # Errors
///
/// [`HarnessError::PreconditionTimeout`] when the window elapses first.
/// Errors reading the state count as "not yet".
pub async fn await_partition<S: PartitionStateSource>(
    source: &S,
    topic: &str,
    partition: i32,
    spec: PollSpec,
) -> Result<Duration, HarnessError> {
    let started = Instant::now();
    let message = format!("partition {topic}-{partition} did not propagate");

    RetryPoller::new(spec)
        .await_condition(&message, move || async move {
            match source.partition_state(topic, partition).await {
                Ok(state) => is_propagated(state.as_ref()),
                Err(e) => {
                    debug!(topic, partition, error = %e, "partition state read failed");
                    false
                }
            }
        })
        .await?;

    let waited = started.elapsed();
    metrics::histogram!(HARNESS_PROPAGATION_WAIT_SECONDS, LABEL_TOPIC => topic.to_owned())
        .record(waited.as_secs_f64());
    info!(
        topic,
        partition,
        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        "partition propagated"
    );
    Ok(waited)
}
