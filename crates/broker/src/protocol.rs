//! Broker wire protocol: one JSON request/response object per line.
//!
//! Record keys and values travel as byte arrays so every [`SerdeFormat`]
//! (including raw bytes) survives the trip unchanged.
//!
//! [`SerdeFormat`]: harness_core::codec::SerdeFormat

use std::fmt;

use bytes::Bytes;
use harness_core::wire::Correlated;
use serde::{Deserialize, Serialize};

/// Largest accepted request line.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Partition-level and request-level result codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    None,
    UnknownTopicOrPartition,
    LeaderNotAvailable,
    NotLeaderForPartition,
    OffsetOutOfRange,
    InvalidRequest,
    BrokerNotAvailable,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == Self::None
    }

    /// Errors a client may retry after refreshing metadata.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::UnknownTopicOrPartition
                | Self::LeaderNotAvailable
                | Self::NotLeaderForPartition
                | Self::BrokerNotAvailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::UnknownTopicOrPartition => "unknown_topic_or_partition",
            Self::LeaderNotAvailable => "leader_not_available",
            Self::NotLeaderForPartition => "not_leader_for_partition",
            Self::OffsetOutOfRange => "offset_out_of_range",
            Self::InvalidRequest => "invalid_request",
            Self::BrokerNotAvailable => "broker_not_available",
        };
        f.write_str(name)
    }
}

/// Record as sent by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(default)]
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Producer timestamp; the broker stamps append time when absent
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

/// Record as stored and fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetSpec {
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub partition: i32,
    /// `-1` when a group has no committed offset
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub correlation_id: i32,
    #[serde(default)]
    pub client_id: String,
    pub request: BrokerRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "api", rename_all = "snake_case")]
pub enum BrokerRequest {
    ApiVersions,
    Metadata {
        /// `None` lists every topic
        #[serde(default)]
        topics: Option<Vec<String>>,
        #[serde(default)]
        allow_auto_topic_creation: bool,
    },
    Produce {
        topic: String,
        /// `None` lets the broker pick per record (key hash or round-robin)
        #[serde(default)]
        partition: Option<i32>,
        records: Vec<WireRecord>,
    },
    Fetch {
        topic: String,
        partition: i32,
        offset: i64,
        max_records: usize,
    },
    ListOffsets {
        topic: String,
        partition: i32,
        spec: OffsetSpec,
    },
    OffsetCommit {
        group_id: String,
        topic: String,
        offsets: Vec<PartitionOffset>,
    },
    OffsetFetch {
        group_id: String,
        topic: String,
        partitions: Vec<i32>,
    },
}

impl BrokerRequest {
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::ApiVersions => "api_versions",
            Self::Metadata { .. } => "metadata",
            Self::Produce { .. } => "produce",
            Self::Fetch { .. } => "fetch",
            Self::ListOffsets { .. } => "list_offsets",
            Self::OffsetCommit { .. } => "offset_commit",
            Self::OffsetFetch { .. } => "offset_fetch",
        }
    }
}

/// Every API the broker answers.
pub const SUPPORTED_APIS: [&str; 7] = [
    "api_versions",
    "metadata",
    "produce",
    "fetch",
    "list_offsets",
    "offset_commit",
    "offset_fetch",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub correlation_id: i32,
    pub response: BrokerResponse,
}

impl Correlated for ResponseFrame {
    fn correlation_id(&self) -> i64 {
        i64::from(self.correlation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub error_code: ErrorCode,
    pub partition: i32,
    /// `-1` while no leader is elected
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub error_code: ErrorCode,
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    /// `true` when the topic exists and every partition has a leader.
    pub fn is_ready(&self) -> bool {
        self.error_code.is_ok()
            && !self.partitions.is_empty()
            && self
                .partitions
                .iter()
                .all(|p| p.error_code.is_ok() && p.leader >= 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducePartitionResult {
    pub partition: i32,
    pub error_code: ErrorCode,
    /// Offset of the first appended record, `-1` on error
    pub base_offset: i64,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "api", rename_all = "snake_case")]
pub enum BrokerResponse {
    ApiVersions {
        apis: Vec<String>,
    },
    Metadata {
        brokers: Vec<BrokerMetadata>,
        controller_id: i32,
        topics: Vec<TopicMetadata>,
    },
    Produce {
        topic: String,
        error_code: ErrorCode,
        partitions: Vec<ProducePartitionResult>,
    },
    Fetch {
        topic: String,
        partition: i32,
        error_code: ErrorCode,
        high_watermark: i64,
        records: Vec<StoredRecord>,
    },
    ListOffsets {
        topic: String,
        partition: i32,
        error_code: ErrorCode,
        offset: i64,
    },
    OffsetCommit {
        error_code: ErrorCode,
    },
    OffsetFetch {
        error_code: ErrorCode,
        offsets: Vec<PartitionOffset>,
    },
    /// Request could not be parsed or the broker is not serving
    Error {
        error_code: ErrorCode,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_codes() {
        assert!(ErrorCode::LeaderNotAvailable.is_retriable());
        assert!(ErrorCode::UnknownTopicOrPartition.is_retriable());
        assert!(!ErrorCode::OffsetOutOfRange.is_retriable());
        assert!(!ErrorCode::None.is_retriable());
        assert!(ErrorCode::None.is_ok());
    }

    #[test]
    fn produce_request_wire_shape() {
        let frame = RequestFrame {
            correlation_id: 7,
            client_id: "p-1".to_owned(),
            request: BrokerRequest::Produce {
                topic: "orders".to_owned(),
                partition: None,
                records: vec![WireRecord {
                    key: Some(Bytes::from_static(b"k")),
                    value: Bytes::from_static(b"v"),
                    timestamp_ms: None,
                }],
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""api":"produce""#));
        assert!(json.contains(r#""key":[107]"#));
        let back: RequestFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn metadata_request_defaults() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"correlation_id":1,"request":{"api":"metadata"}}"#).unwrap();
        assert_eq!(
            frame.request,
            BrokerRequest::Metadata {
                topics: None,
                allow_auto_topic_creation: false
            }
        );
        assert_eq!(frame.client_id, "");
    }

    #[test]
    fn topic_ready_requires_leaders_everywhere() {
        let partition = |leader| PartitionMetadata {
            error_code: if leader >= 0 {
                ErrorCode::None
            } else {
                ErrorCode::LeaderNotAvailable
            },
            partition: 0,
            leader,
            replicas: vec![0],
            isr: vec![0],
        };
        let mut topic = TopicMetadata {
            error_code: ErrorCode::None,
            name: "t".to_owned(),
            partitions: vec![partition(0), partition(-1)],
        };
        assert!(!topic.is_ready());
        topic.partitions.pop();
        assert!(topic.is_ready());
    }

    #[test]
    fn every_api_is_listed() {
        assert_eq!(SUPPORTED_APIS.len(), 7);
        assert!(SUPPORTED_APIS.contains(&BrokerRequest::ApiVersions.api_name()));
    }
}
