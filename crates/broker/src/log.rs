//! Partition logs.
//!
//! Each partition keeps its records in memory and mirrors every append to a
//! single segment file, `{log_dir}/{topic}-{partition}/00000000000000000000.log`.
//!
//! Segment frame layout (big-endian):
//! ```text
//! u32 frame_len | i64 offset | i64 timestamp_ms | i32 key_len (-1 = none) | key | i32 value_len | value
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::BrokerError;
use crate::metadata::now_ms;
use crate::protocol::{StoredRecord, WireRecord};

/// Name of the only segment of a partition.
pub const SEGMENT_FILE_NAME: &str = "00000000000000000000.log";

/// Topic and partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Directory name of the partition inside a log dir.
    pub fn dir_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Result of a fetch against one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub records: Vec<StoredRecord>,
    pub high_watermark: i64,
}

#[derive(Debug)]
struct LogInner {
    records: Vec<StoredRecord>,
    segment: BufWriter<File>,
}

/// Append-only log of one partition.
#[derive(Debug)]
pub struct PartitionLog {
    tp: TopicPartition,
    dir: PathBuf,
    inner: Mutex<LogInner>,
}

impl PartitionLog {
    /// Create the partition directory and an empty segment under `log_dir`.
    pub fn create(log_dir: &Path, tp: TopicPartition) -> Result<Self, BrokerError> {
        let dir = log_dir.join(tp.dir_name());
        std::fs::create_dir_all(&dir)?;
        let segment = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join(SEGMENT_FILE_NAME))?;
        debug!(partition = %tp, dir = %dir.display(), "partition log created");
        Ok(Self {
            tp,
            dir,
            inner: Mutex::new(LogInner {
                records: Vec::new(),
                segment: BufWriter::new(segment),
            }),
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_path(&self) -> PathBuf {
        self.dir.join(SEGMENT_FILE_NAME)
    }

    /// First offset in the log; always `0` since nothing is ever deleted.
    pub fn log_start_offset(&self) -> i64 {
        0
    }

    /// Offset the next appended record will get.
    pub fn high_watermark(&self) -> i64 {
        offset_of(self.lock().records.len())
    }

    /// Append records; returns the offset of the first one.
    pub fn append(&self, records: &[WireRecord]) -> Result<i64, BrokerError> {
        let mut inner = self.lock();
        let base_offset = offset_of(inner.records.len());
        let now = now_ms();

        let mut frames = BytesMut::new();
        let mut stored = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let record = StoredRecord {
                offset: base_offset + offset_of(idx),
                timestamp_ms: record.timestamp_ms.unwrap_or(now),
                key: record.key.clone(),
                value: record.value.clone(),
            };
            encode_frame(&record, &mut frames);
            stored.push(record);
        }

        // Disk first, so memory never holds records the segment lacks.
        inner.segment.write_all(&frames)?;
        inner.segment.flush()?;
        inner.records.extend(stored);
        Ok(base_offset)
    }

    /// Up to `max_records` records starting at `offset`.
    ///
    /// `offset == high_watermark` yields an empty result; anything outside
    /// `[log_start_offset, high_watermark]` is `None`.
    pub fn read(&self, offset: i64, max_records: usize) -> Option<ReadResult> {
        let inner = self.lock();
        let high_watermark = offset_of(inner.records.len());
        if offset < 0 || offset > high_watermark {
            return None;
        }
        let start = usize::try_from(offset).ok()?;
        let end = start.saturating_add(max_records).min(inner.records.len());
        Some(ReadResult {
            records: inner.records[start..end].to_vec(),
            high_watermark,
        })
    }

    /// Flush and fsync the segment.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.lock();
        inner.segment.flush()?;
        inner.segment.get_ref().sync_all()
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn offset_of(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn length_of(bytes: &[u8]) -> i32 {
    i32::try_from(bytes.len()).unwrap_or(i32::MAX)
}

fn encode_frame(record: &StoredRecord, out: &mut BytesMut) {
    let key_len = record.key.as_ref().map_or(0, |k| k.len());
    let body_len = 8 + 8 + 4 + key_len + 4 + record.value.len();
    out.reserve(4 + body_len);
    out.put_u32(u32::try_from(body_len).unwrap_or(u32::MAX));
    out.put_i64(record.offset);
    out.put_i64(record.timestamp_ms);
    match &record.key {
        Some(key) => {
            out.put_i32(length_of(key));
            out.put_slice(key);
        }
        None => out.put_i32(-1),
    }
    out.put_i32(length_of(&record.value));
    out.put_slice(&record.value);
}

/// Decode every frame of a segment file.
pub fn read_segment(path: &Path) -> Result<Vec<StoredRecord>, BrokerError> {
    let corrupt = |reason: &str| BrokerError::CorruptLog {
        path: path.display().to_string(),
        reason: reason.to_owned(),
    };

    let mut buf = Bytes::from(std::fs::read(path)?);
    let mut records = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(corrupt("truncated frame header"));
        }
        let frame_len = buf.get_u32() as usize;
        if buf.remaining() < frame_len || frame_len < 24 {
            return Err(corrupt("truncated frame"));
        }
        let mut frame = buf.split_to(frame_len);
        let offset = frame.get_i64();
        let timestamp_ms = frame.get_i64();
        let key = match frame.get_i32() {
            -1 => None,
            len => Some(take_bytes(&mut frame, len).ok_or_else(|| corrupt("bad key length"))?),
        };
        let value_len = frame.get_i32();
        let value = take_bytes(&mut frame, value_len).ok_or_else(|| corrupt("bad value length"))?;
        records.push(StoredRecord {
            offset,
            timestamp_ms,
            key,
            value,
        });
    }
    Ok(records)
}

fn take_bytes(frame: &mut Bytes, len: i32) -> Option<Bytes> {
    let len = usize::try_from(len).ok()?;
    if frame.remaining() < len {
        return None;
    }
    Some(frame.split_to(len))
}
