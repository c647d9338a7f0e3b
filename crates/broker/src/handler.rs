//! Request handling.
//!
//! [`RequestHandler`] turns one decoded [`BrokerRequest`] into a
//! [`BrokerResponse`]. Partition-level problems are reported as
//! [`ErrorCode`]s inside the response; only coordination failures surface as
//! a top-level `Error` response.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use harness_core::metrics as m;
use tracing::{debug, warn};

use crate::admin::{AdminClient, TopicDescriptor};
use crate::error::BrokerError;
use crate::log::TopicPartition;
use crate::offsets::OffsetStore;
use crate::partitioner::Partitioner;
use crate::protocol::{
    BrokerMetadata, BrokerRequest, BrokerResponse, ErrorCode, OffsetSpec, PartitionMetadata,
    PartitionOffset, ProducePartitionResult, SUPPORTED_APIS, TopicMetadata, WireRecord,
};
use crate::replica::ReplicaManager;

/// Everything a connection needs to answer requests.
#[derive(Debug)]
pub struct RequestHandler {
    broker_id: i32,
    admin: AdminClient,
    replicas: Arc<ReplicaManager>,
    offsets: Arc<OffsetStore>,
    partitioner: Partitioner,
    auto_create: Option<(i32, i16)>,
    partition_counts: Mutex<HashMap<String, i32>>,
}

impl RequestHandler {
    /// `auto_create` holds `(partitions, replication_factor)` for topics
    /// created on demand; `None` disables auto-creation.
    pub fn new(
        broker_id: i32,
        admin: AdminClient,
        replicas: Arc<ReplicaManager>,
        offsets: Arc<OffsetStore>,
        auto_create: Option<(i32, i16)>,
    ) -> Self {
        Self {
            broker_id,
            admin,
            replicas,
            offsets,
            partitioner: Partitioner::new(),
            auto_create,
            partition_counts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, request: BrokerRequest) -> BrokerResponse {
        let api = request.api_name();
        let result = match request {
            BrokerRequest::ApiVersions => Ok(BrokerResponse::ApiVersions {
                apis: SUPPORTED_APIS.iter().map(|api| (*api).to_owned()).collect(),
            }),
            BrokerRequest::Metadata {
                topics,
                allow_auto_topic_creation,
            } => self.metadata(topics, allow_auto_topic_creation).await,
            BrokerRequest::Produce {
                topic,
                partition,
                records,
            } => self.produce(topic, partition, records).await,
            BrokerRequest::Fetch {
                topic,
                partition,
                offset,
                max_records,
            } => Ok(self.fetch(topic, partition, offset, max_records).await),
            BrokerRequest::ListOffsets {
                topic,
                partition,
                spec,
            } => Ok(self.list_offsets(topic, partition, spec).await),
            BrokerRequest::OffsetCommit {
                group_id,
                topic,
                offsets,
            } => Ok(self.offset_commit(&group_id, &topic, &offsets)),
            BrokerRequest::OffsetFetch {
                group_id,
                topic,
                partitions,
            } => Ok(self.offset_fetch(&group_id, &topic, &partitions)),
        };

        result.unwrap_or_else(|e| {
            warn!(api, error = %e, "request failed");
            BrokerResponse::Error {
                error_code: ErrorCode::BrokerNotAvailable,
                message: e.to_string(),
            }
        })
    }

    async fn metadata(
        &self,
        topics: Option<Vec<String>>,
        allow_auto_topic_creation: bool,
    ) -> Result<BrokerResponse, BrokerError> {
        let mut brokers = Vec::new();
        for id in self.admin.live_brokers().await? {
            if let Some(registration) = self.admin.broker_registration(id).await? {
                brokers.push(BrokerMetadata {
                    node_id: id,
                    host: registration.host,
                    port: registration.port,
                });
            }
        }
        let controller_id = self
            .admin
            .controller()
            .await?
            .map_or(-1, |info| info.brokerid);

        let names = match topics {
            Some(names) => names,
            None => self.admin.list_topics().await?,
        };
        let mut topics = Vec::with_capacity(names.len());
        for name in names {
            topics.push(self.topic_metadata(name, allow_auto_topic_creation).await?);
        }

        Ok(BrokerResponse::Metadata {
            brokers,
            controller_id,
            topics,
        })
    }

    async fn topic_metadata(
        &self,
        name: String,
        allow_auto_topic_creation: bool,
    ) -> Result<TopicMetadata, BrokerError> {
        let Some(assignment) = self.admin.topic_assignment(&name).await? else {
            let error_code = if allow_auto_topic_creation {
                self.auto_create_topic(&name).await
            } else {
                ErrorCode::UnknownTopicOrPartition
            };
            return Ok(TopicMetadata {
                error_code,
                name,
                partitions: Vec::new(),
            });
        };

        let mut partitions = Vec::new();
        for (partition, replicas) in assignment.replicas() {
            let metadata = match self.admin.partition_state(&name, partition).await? {
                Some(state) if state.has_valid_leader() => PartitionMetadata {
                    error_code: ErrorCode::None,
                    partition,
                    leader: state.leader,
                    replicas,
                    isr: state.isr,
                },
                _ => PartitionMetadata {
                    error_code: ErrorCode::LeaderNotAvailable,
                    partition,
                    leader: crate::metadata::NO_LEADER,
                    replicas,
                    isr: Vec::new(),
                },
            };
            partitions.push(metadata);
        }
        Ok(TopicMetadata {
            error_code: ErrorCode::None,
            name,
            partitions,
        })
    }

    /// Create a missing topic with the broker defaults. The topic is not
    /// led yet, so callers see `LeaderNotAvailable` and retry.
    async fn auto_create_topic(&self, name: &str) -> ErrorCode {
        let Some((partitions, replication_factor)) = self.auto_create else {
            return ErrorCode::UnknownTopicOrPartition;
        };
        let descriptor = TopicDescriptor::new(name, partitions, replication_factor);
        match self.admin.create_topic(&descriptor).await {
            Ok(_) | Err(BrokerError::TopicExists { .. }) => {
                debug!(topic = name, "auto-created topic");
                ErrorCode::LeaderNotAvailable
            }
            Err(BrokerError::InvalidTopic { .. }) => ErrorCode::InvalidRequest,
            Err(e) => {
                warn!(topic = name, error = %e, "auto-create failed");
                ErrorCode::LeaderNotAvailable
            }
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<Option<i32>, BrokerError> {
        if let Some(count) = self.counts().get(topic) {
            return Ok(Some(*count));
        }
        let Some(assignment) = self.admin.topic_assignment(topic).await? else {
            return Ok(None);
        };
        let count = assignment.partition_count();
        self.counts().insert(topic.to_owned(), count);
        Ok(Some(count))
    }

    async fn produce(
        &self,
        topic: String,
        partition: Option<i32>,
        records: Vec<WireRecord>,
    ) -> Result<BrokerResponse, BrokerError> {
        let failed = |error_code: ErrorCode, topic: String| BrokerResponse::Produce {
            topic,
            error_code,
            partitions: Vec::new(),
        };

        let Some(count) = self.partition_count(&topic).await? else {
            let error_code = if self.auto_create.is_some() {
                self.auto_create_topic(&topic).await
            } else {
                ErrorCode::UnknownTopicOrPartition
            };
            return Ok(failed(error_code, topic));
        };

        // Group by target partition, keeping per-partition order.
        let mut batches: BTreeMap<i32, Vec<WireRecord>> = BTreeMap::new();
        for record in records {
            let target = match partition {
                Some(explicit) => explicit,
                None => self.partitioner.partition(record.key.as_deref(), count),
            };
            batches.entry(target).or_default().push(record);
        }

        // All-or-nothing: refuse the whole request unless every target
        // partition is led here.
        for target in batches.keys() {
            let tp = TopicPartition::new(topic.as_str(), *target);
            if *target < 0 || *target >= count {
                return Ok(failed(ErrorCode::UnknownTopicOrPartition, topic));
            }
            if !self.replicas.is_leader(&tp) {
                let code = self.leadership_error(&tp).await?;
                return Ok(failed(code, topic));
            }
        }

        let mut partitions = Vec::with_capacity(batches.len());
        for (target, batch) in batches {
            let tp = TopicPartition::new(topic.as_str(), target);
            let Some(log) = self.replicas.partition(&tp) else {
                return Ok(failed(ErrorCode::NotLeaderForPartition, topic));
            };
            let bytes: usize = batch.iter().map(|r| r.value.len()).sum();
            let base_offset = log.append(&batch)?;
            metrics::counter!(m::BROKER_RECORDS_IN_TOTAL, m::LABEL_TOPIC => topic.clone())
                .increment(batch.len() as u64);
            metrics::counter!(m::BROKER_BYTES_IN_TOTAL).increment(bytes as u64);
            partitions.push(ProducePartitionResult {
                partition: target,
                error_code: ErrorCode::None,
                base_offset,
                record_count: batch.len(),
            });
        }

        Ok(BrokerResponse::Produce {
            topic,
            error_code: ErrorCode::None,
            partitions,
        })
    }

    async fn fetch(
        &self,
        topic: String,
        partition: i32,
        offset: i64,
        max_records: usize,
    ) -> BrokerResponse {
        let tp = TopicPartition::new(topic.as_str(), partition);
        let respond = |error_code, high_watermark, records| BrokerResponse::Fetch {
            topic: topic.clone(),
            partition,
            error_code,
            high_watermark,
            records,
        };

        let Some(log) = self.replicas.partition(&tp) else {
            let code = self
                .leadership_error(&tp)
                .await
                .unwrap_or(ErrorCode::BrokerNotAvailable);
            return respond(code, -1, Vec::new());
        };
        match log.read(offset, max_records) {
            Some(read) => {
                metrics::counter!(m::BROKER_RECORDS_OUT_TOTAL).increment(read.records.len() as u64);
                respond(ErrorCode::None, read.high_watermark, read.records)
            }
            None => respond(ErrorCode::OffsetOutOfRange, log.high_watermark(), Vec::new()),
        }
    }

    async fn list_offsets(&self, topic: String, partition: i32, spec: OffsetSpec) -> BrokerResponse {
        let tp = TopicPartition::new(topic.as_str(), partition);
        let (error_code, offset) = match self.replicas.partition(&tp) {
            Some(log) => match spec {
                OffsetSpec::Earliest => (ErrorCode::None, log.log_start_offset()),
                OffsetSpec::Latest => (ErrorCode::None, log.high_watermark()),
            },
            None => (
                self.leadership_error(&tp)
                    .await
                    .unwrap_or(ErrorCode::BrokerNotAvailable),
                -1,
            ),
        };
        BrokerResponse::ListOffsets {
            topic,
            partition,
            error_code,
            offset,
        }
    }

    fn offset_commit(
        &self,
        group_id: &str,
        topic: &str,
        offsets: &[PartitionOffset],
    ) -> BrokerResponse {
        if group_id.is_empty() || topic.is_empty() {
            return BrokerResponse::OffsetCommit {
                error_code: ErrorCode::InvalidRequest,
            };
        }
        for entry in offsets {
            self.offsets
                .commit(group_id, TopicPartition::new(topic, entry.partition), entry.offset);
        }
        BrokerResponse::OffsetCommit {
            error_code: ErrorCode::None,
        }
    }

    fn offset_fetch(&self, group_id: &str, topic: &str, partitions: &[i32]) -> BrokerResponse {
        if group_id.is_empty() || topic.is_empty() {
            return BrokerResponse::OffsetFetch {
                error_code: ErrorCode::InvalidRequest,
                offsets: Vec::new(),
            };
        }
        let offsets = partitions
            .iter()
            .map(|&partition| PartitionOffset {
                partition,
                offset: self
                    .offsets
                    .fetch(group_id, &TopicPartition::new(topic, partition)),
            })
            .collect();
        BrokerResponse::OffsetFetch {
            error_code: ErrorCode::None,
            offsets,
        }
    }

    /// Why this broker cannot serve `tp`.
    async fn leadership_error(&self, tp: &TopicPartition) -> Result<ErrorCode, BrokerError> {
        let Some(count) = self.partition_count(&tp.topic).await? else {
            return Ok(ErrorCode::UnknownTopicOrPartition);
        };
        if tp.partition < 0 || tp.partition >= count {
            return Ok(ErrorCode::UnknownTopicOrPartition);
        }
        Ok(match self.admin.partition_state(&tp.topic, tp.partition).await? {
            Some(state) if state.has_valid_leader() && state.leader != self.broker_id => {
                ErrorCode::NotLeaderForPartition
            }
            _ => ErrorCode::LeaderNotAvailable,
        })
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, i32>> {
        self.partition_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::test_support::CoordinationFixture;
    use bytes::Bytes;
    use std::time::Duration;

    struct Setup {
        fixture: CoordinationFixture,
        handler: RequestHandler,
        controller: Controller,
    }

    async fn setup(auto_create: Option<(i32, i16)>) -> Setup {
        let fixture = CoordinationFixture::with_brokers(&[0]).await;
        let admin = AdminClient::new(fixture.client());
        let replicas = Arc::new(ReplicaManager::new(vec![fixture.dir.path().join("logs")]));
        let controller = Controller::elect(
            admin.clone(),
            0,
            Arc::clone(&replicas),
            Duration::from_millis(20),
        )
        .await
        .unwrap()
        .unwrap();
        let handler = RequestHandler::new(
            0,
            admin,
            replicas,
            Arc::new(OffsetStore::new()),
            auto_create,
        );
        Setup {
            fixture,
            handler,
            controller,
        }
    }

    fn records(values: &[&'static str]) -> Vec<WireRecord> {
        values
            .iter()
            .map(|v| WireRecord {
                key: Some(Bytes::from_static(v.as_bytes())),
                value: Bytes::from_static(v.as_bytes()),
                timestamp_ms: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn produce_to_unknown_topic_without_auto_create() {
        let s = setup(None).await;
        let response = s
            .handler
            .handle(BrokerRequest::Produce {
                topic: "missing".to_owned(),
                partition: None,
                records: records(&["a"]),
            })
            .await;
        assert!(matches!(
            response,
            BrokerResponse::Produce {
                error_code: ErrorCode::UnknownTopicOrPartition,
                ..
            }
        ));
        s.fixture.stop().await;
    }

    #[tokio::test]
    async fn metadata_auto_creates_then_reports_leaders() {
        let s = setup(Some((2, 1))).await;
        let request = BrokerRequest::Metadata {
            topics: Some(vec!["events".to_owned()]),
            allow_auto_topic_creation: true,
        };

        let BrokerResponse::Metadata { topics, brokers, .. } = s.handler.handle(request.clone()).await
        else {
            panic!("expected metadata response");
        };
        assert_eq!(topics[0].error_code, ErrorCode::LeaderNotAvailable);
        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0].port, 9092);

        s.controller.elect_leaders().await.unwrap();
        let BrokerResponse::Metadata {
            topics,
            controller_id,
            ..
        } = s.handler.handle(request).await
        else {
            panic!("expected metadata response");
        };
        assert_eq!(controller_id, 0);
        assert!(topics[0].is_ready());
        assert_eq!(topics[0].partitions.len(), 2);
        s.fixture.stop().await;
    }

    #[tokio::test]
    async fn produce_waits_for_leadership_then_appends() {
        let s = setup(None).await;
        s.handler
            .admin
            .create_topic(&TopicDescriptor::new("orders", 1, 1))
            .await
            .unwrap();

        let produce = BrokerRequest::Produce {
            topic: "orders".to_owned(),
            partition: None,
            records: records(&["a", "b"]),
        };
        assert!(matches!(
            s.handler.handle(produce.clone()).await,
            BrokerResponse::Produce {
                error_code: ErrorCode::LeaderNotAvailable,
                ..
            }
        ));

        s.controller.elect_leaders().await.unwrap();
        let BrokerResponse::Produce {
            error_code,
            partitions,
            ..
        } = s.handler.handle(produce).await
        else {
            panic!("expected produce response");
        };
        assert_eq!(error_code, ErrorCode::None);
        assert_eq!(partitions[0].base_offset, 0);
        assert_eq!(partitions[0].record_count, 2);

        let BrokerResponse::Fetch {
            error_code,
            high_watermark,
            records,
            ..
        } = s
            .handler
            .handle(BrokerRequest::Fetch {
                topic: "orders".to_owned(),
                partition: 0,
                offset: 0,
                max_records: 10,
            })
            .await
        else {
            panic!("expected fetch response");
        };
        assert_eq!(error_code, ErrorCode::None);
        assert_eq!(high_watermark, 2);
        assert_eq!(records.len(), 2);
        s.fixture.stop().await;
    }

    #[tokio::test]
    async fn fetch_and_list_offsets_edges() {
        let s = setup(None).await;
        s.handler
            .admin
            .create_topic(&TopicDescriptor::new("orders", 1, 1))
            .await
            .unwrap();
        s.controller.elect_leaders().await.unwrap();

        let fetch = |offset| BrokerRequest::Fetch {
            topic: "orders".to_owned(),
            partition: 0,
            offset,
            max_records: 10,
        };
        assert!(matches!(
            s.handler.handle(fetch(5)).await,
            BrokerResponse::Fetch {
                error_code: ErrorCode::OffsetOutOfRange,
                ..
            }
        ));
        assert!(matches!(
            s.handler
                .handle(BrokerRequest::Fetch {
                    topic: "orders".to_owned(),
                    partition: 3,
                    offset: 0,
                    max_records: 1,
                })
                .await,
            BrokerResponse::Fetch {
                error_code: ErrorCode::UnknownTopicOrPartition,
                ..
            }
        ));
        assert!(matches!(
            s.handler
                .handle(BrokerRequest::ListOffsets {
                    topic: "orders".to_owned(),
                    partition: 0,
                    spec: OffsetSpec::Latest,
                })
                .await,
            BrokerResponse::ListOffsets {
                error_code: ErrorCode::None,
                offset: 0,
                ..
            }
        ));
        s.fixture.stop().await;
    }

    #[tokio::test]
    async fn group_offsets_round_trip() {
        let s = setup(None).await;
        let commit = s
            .handler
            .handle(BrokerRequest::OffsetCommit {
                group_id: "g".to_owned(),
                topic: "orders".to_owned(),
                offsets: vec![PartitionOffset {
                    partition: 0,
                    offset: 12,
                }],
            })
            .await;
        assert_eq!(
            commit,
            BrokerResponse::OffsetCommit {
                error_code: ErrorCode::None
            }
        );

        let fetched = s
            .handler
            .handle(BrokerRequest::OffsetFetch {
                group_id: "g".to_owned(),
                topic: "orders".to_owned(),
                partitions: vec![0, 1],
            })
            .await;
        assert_eq!(
            fetched,
            BrokerResponse::OffsetFetch {
                error_code: ErrorCode::None,
                offsets: vec![
                    PartitionOffset {
                        partition: 0,
                        offset: 12
                    },
                    PartitionOffset {
                        partition: 1,
                        offset: -1
                    },
                ],
            }
        );

        let rejected = s
            .handler
            .handle(BrokerRequest::OffsetCommit {
                group_id: String::new(),
                topic: "orders".to_owned(),
                offsets: Vec::new(),
            })
            .await;
        assert_eq!(
            rejected,
            BrokerResponse::OffsetCommit {
                error_code: ErrorCode::InvalidRequest
            }
        );
        s.fixture.stop().await;
    }

    #[tokio::test]
    async fn api_versions_lists_supported_apis() {
        let s = setup(None).await;
        let BrokerResponse::ApiVersions { apis } = s.handler.handle(BrokerRequest::ApiVersions).await
        else {
            panic!("expected api versions response");
        };
        assert_eq!(apis.len(), SUPPORTED_APIS.len());
        s.fixture.stop().await;
    }
}
