//! Consumer session.
//!
//! A [`ConsumerSession`] follows every partition of one topic on behalf of a
//! consumer group. Starting positions come from the group's committed offsets,
//! falling back to `auto_offset_reset`. Partitions whose leader is not elected
//! yet are resolved lazily on the next poll.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use harness_core::config::{ConsumerConfig, OffsetReset};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BrokerConnection, check};
use crate::error::BrokerError;
use crate::protocol::{
    BrokerRequest, BrokerResponse, ErrorCode, OffsetSpec, PartitionOffset, StoredRecord,
};

/// Poll window used by [`ConsumerSession::spawn_counter`].
const COUNTER_POLL: Duration = Duration::from_millis(100);

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<String>,
    pub value: String,
}

#[derive(Debug)]
struct Subscription {
    topic: String,
    /// `None` until the start position could be resolved
    positions: BTreeMap<i32, Option<i64>>,
}

/// Group consumer bound to one broker.
#[derive(Debug)]
pub struct ConsumerSession {
    conn: BrokerConnection,
    group_id: String,
    member_id: String,
    config: ConsumerConfig,
    subscription: Option<Subscription>,
    received: Arc<AtomicU64>,
}

impl ConsumerSession {
    pub async fn connect(
        bootstrap: &str,
        group_id: &str,
        config: &ConsumerConfig,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        if group_id.is_empty() {
            return Err(BrokerError::Config {
                field: "group_id".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        let member_id = format!("{group_id}-{}", uuid::Uuid::new_v4());
        let conn = BrokerConnection::connect(bootstrap, timeout, &member_id).await?;
        debug!(group_id, member_id, "consumer session opened");
        Ok(Self {
            conn,
            group_id: group_id.to_owned(),
            member_id,
            config: config.clone(),
            subscription: None,
            received: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn topic(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.topic.as_str())
    }

    /// Follow every partition of `topic`, replacing any earlier subscription.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let topics = match self
            .conn
            .send(BrokerRequest::Metadata {
                topics: Some(vec![topic.to_owned()]),
                allow_auto_topic_creation: false,
            })
            .await?
        {
            BrokerResponse::Metadata { topics, .. } => topics,
            other => return Err(unexpected(&other)),
        };
        let metadata = topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| BrokerError::UnknownTopic {
                topic: topic.to_owned(),
            })?;
        if metadata.error_code == ErrorCode::UnknownTopicOrPartition {
            return Err(BrokerError::UnknownTopic {
                topic: topic.to_owned(),
            });
        }
        check(metadata.error_code, topic)?;

        self.subscription = Some(Subscription {
            topic: topic.to_owned(),
            positions: metadata
                .partitions
                .iter()
                .map(|p| (p.partition, None))
                .collect(),
        });
        self.resolve_positions().await?;
        info!(
            group_id = %self.group_id,
            topic,
            partitions = metadata.partitions.len(),
            "consumer subscribed"
        );
        Ok(())
    }

    /// Fetch records until at least one arrives or `timeout` elapses.
    ///
    /// Positions advance past every fetched record, including ones that
    /// fail to decode; the first decode failure is returned as an error.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, BrokerError> {
        if self.subscription.is_none() {
            return Err(BrokerError::Protocol("poll before subscribe".to_owned()));
        }
        let deadline = Instant::now() + timeout;
        let backoff = Duration::from_millis(self.config.fetch_backoff_ms);

        let (records, decode_error) = loop {
            self.resolve_positions().await?;
            let (records, decode_error) = self.fetch_once().await?;
            if !records.is_empty() || decode_error.is_some() {
                break (records, decode_error);
            }
            let now = Instant::now();
            if now >= deadline {
                break (records, None);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
        };

        self.received
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        if self.config.enable_auto_commit && !records.is_empty() {
            self.commit().await?;
        }
        match decode_error {
            Some(e) => Err(e),
            None => Ok(records),
        }
    }

    /// Records returned by `poll` so far.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Resolved next-fetch offsets per partition.
    pub fn positions(&self) -> BTreeMap<i32, i64> {
        self.subscription
            .as_ref()
            .map(|s| {
                s.positions
                    .iter()
                    .filter_map(|(p, pos)| pos.map(|pos| (*p, pos)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store the current positions as the group's committed offsets.
    pub async fn commit(&mut self) -> Result<(), BrokerError> {
        let Some(topic) = self.topic().map(str::to_owned) else {
            return Ok(());
        };
        let offsets = self
            .positions()
            .into_iter()
            .map(|(partition, offset)| PartitionOffset { partition, offset })
            .collect();
        let response = self
            .conn
            .send(BrokerRequest::OffsetCommit {
                group_id: self.group_id.clone(),
                topic,
                offsets,
            })
            .await?;
        match response {
            BrokerResponse::OffsetCommit { error_code } => check(error_code, "offset commit"),
            other => Err(unexpected(&other)),
        }
    }

    /// Commit (when auto-commit is on) and disconnect.
    pub async fn close(mut self) -> Result<(), BrokerError> {
        let committed = if self.config.enable_auto_commit {
            self.commit().await
        } else {
            Ok(())
        };
        self.conn.close();
        debug!(member_id = %self.member_id, received = self.received_count(), "consumer session closed");
        committed
    }

    /// Poll in the background, counting records, until the counter is stopped.
    pub fn spawn_counter(self) -> ConsumerCounter {
        let count = Arc::clone(&self.received);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut session = self;
        let handle = tokio::spawn(async move {
            // Stop is only observed between polls: a poll in flight finishes,
            // so every counted record is also in the positions close() commits.
            while !token.is_cancelled() {
                if let Err(e) = session.poll(COUNTER_POLL).await {
                    warn!(member_id = %session.member_id, error = %e, "background poll failed");
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(COUNTER_POLL) => {}
                    }
                }
            }
            session
        });
        ConsumerCounter {
            count,
            cancel,
            handle,
        }
    }

    /// Give every unresolved partition a start position when possible.
    async fn resolve_positions(&mut self) -> Result<(), BrokerError> {
        let Some(subscription) = self.subscription.as_ref() else {
            return Ok(());
        };
        let topic = subscription.topic.clone();
        let pending: Vec<i32> = subscription
            .positions
            .iter()
            .filter(|(_, pos)| pos.is_none())
            .map(|(p, _)| *p)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let committed = match self
            .conn
            .send(BrokerRequest::OffsetFetch {
                group_id: self.group_id.clone(),
                topic: topic.clone(),
                partitions: pending.clone(),
            })
            .await?
        {
            BrokerResponse::OffsetFetch {
                error_code: ErrorCode::None,
                offsets,
            } => offsets,
            BrokerResponse::OffsetFetch { error_code, .. } => {
                return check(error_code, "offset fetch");
            }
            other => return Err(unexpected(&other)),
        };

        for partition in pending {
            let position = match committed.iter().find(|o| o.partition == partition) {
                Some(o) if o.offset >= 0 => Some(o.offset),
                _ => self.reset_offset(&topic, partition).await?,
            };
            if let Some(position) = position {
                debug!(topic, partition, position, "consumer position resolved");
            }
            self.set_position(partition, position);
        }
        Ok(())
    }

    /// Offset given by `auto_offset_reset`, `None` while the partition has
    /// no leader.
    async fn reset_offset(&self, topic: &str, partition: i32) -> Result<Option<i64>, BrokerError> {
        let spec = match self.config.auto_offset_reset {
            OffsetReset::Earliest => OffsetSpec::Earliest,
            OffsetReset::Latest => OffsetSpec::Latest,
        };
        let response = self
            .conn
            .send(BrokerRequest::ListOffsets {
                topic: topic.to_owned(),
                partition,
                spec,
            })
            .await?;
        match response {
            BrokerResponse::ListOffsets {
                error_code: ErrorCode::None,
                offset,
                ..
            } => Ok(Some(offset)),
            BrokerResponse::ListOffsets { error_code, .. } if error_code.is_retriable() => Ok(None),
            BrokerResponse::ListOffsets { error_code, .. } => {
                check(error_code, "list offsets").map(|()| None)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_once(
        &mut self,
    ) -> Result<(Vec<ConsumedRecord>, Option<BrokerError>), BrokerError> {
        let Some(subscription) = self.subscription.as_ref() else {
            return Ok((Vec::new(), None));
        };
        let topic = subscription.topic.clone();
        let positions: Vec<(i32, i64)> = subscription
            .positions
            .iter()
            .filter_map(|(p, pos)| pos.map(|pos| (*p, pos)))
            .collect();

        let mut consumed = Vec::new();
        let mut decode_error = None;
        for (partition, offset) in positions {
            let budget = self.config.max_poll_records.saturating_sub(consumed.len());
            if budget == 0 {
                break;
            }
            let (error_code, records) = match self
                .conn
                .send(BrokerRequest::Fetch {
                    topic: topic.clone(),
                    partition,
                    offset,
                    max_records: budget,
                })
                .await?
            {
                BrokerResponse::Fetch {
                    error_code,
                    records,
                    ..
                } => (error_code, records),
                other => return Err(unexpected(&other)),
            };

            match error_code {
                ErrorCode::None => {
                    if let Some(last) = records.last() {
                        self.set_position(partition, Some(last.offset + 1));
                    }
                    for record in records {
                        match self.decode(&topic, partition, record) {
                            Ok(decoded) => consumed.push(decoded),
                            Err(e) => {
                                decode_error.get_or_insert(e);
                            }
                        }
                    }
                }
                ErrorCode::OffsetOutOfRange => {
                    warn!(topic, partition, offset, "fetch offset out of range, resetting");
                    let reset = self.reset_offset(&topic, partition).await?;
                    self.set_position(partition, reset);
                }
                code if code.is_retriable() => {
                    debug!(topic, partition, %code, "partition not ready");
                }
                code => return Err(BrokerError::server(code, format!("fetch {topic}-{partition}"))),
            }
        }
        Ok((consumed, decode_error))
    }

    fn decode(
        &self,
        topic: &str,
        partition: i32,
        record: StoredRecord,
    ) -> Result<ConsumedRecord, BrokerError> {
        let key = record
            .key
            .as_deref()
            .map(|k| self.config.key_format.decode(k))
            .transpose()?;
        Ok(ConsumedRecord {
            topic: topic.to_owned(),
            partition,
            offset: record.offset,
            timestamp_ms: record.timestamp_ms,
            key,
            value: self.config.value_format.decode(&record.value)?,
        })
    }

    fn set_position(&mut self, partition: i32, position: Option<i64>) {
        if let Some(subscription) = self.subscription.as_mut() {
            subscription.positions.insert(partition, position);
        }
    }
}

/// Background poller started by [`ConsumerSession::spawn_counter`].
#[derive(Debug)]
pub struct ConsumerCounter {
    count: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: JoinHandle<ConsumerSession>,
}

impl ConsumerCounter {
    /// Records received so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Stop polling and close the session. Returns the final count.
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        match self.handle.await {
            Ok(session) => {
                if let Err(e) = session.close().await {
                    warn!(error = %e, "closing counted consumer failed");
                }
            }
            Err(e) => warn!(error = %e, "consumer counter task failed"),
        }
        self.count.load(Ordering::Relaxed)
    }
}

fn unexpected(response: &BrokerResponse) -> BrokerError {
    BrokerError::Protocol(format!("unexpected response: {response:?}"))
}
