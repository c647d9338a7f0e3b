//! Committed consumer-group offsets.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::log::TopicPartition;

/// Offset reported for a partition the group never committed.
pub const NO_OFFSET: i64 = -1;

/// In-memory `(group, topic-partition) → offset` store.
#[derive(Debug, Default)]
pub struct OffsetStore {
    offsets: Mutex<HashMap<(String, TopicPartition), i64>>,
}

impl OffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self, group_id: &str, tp: TopicPartition, offset: i64) {
        self.lock().insert((group_id.to_owned(), tp), offset);
    }

    /// Committed offset, or [`NO_OFFSET`].
    pub fn fetch(&self, group_id: &str, tp: &TopicPartition) -> i64 {
        self.lock()
            .get(&(group_id.to_owned(), tp.clone()))
            .copied()
            .unwrap_or(NO_OFFSET)
    }

    /// Number of committed `(group, partition)` pairs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, TopicPartition), i64>> {
        self.offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
