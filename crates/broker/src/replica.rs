//! Partitions led by this broker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use harness_core::metrics as m;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::log::{PartitionLog, TopicPartition};

/// Owns the partition logs of every partition this broker leads.
#[derive(Debug)]
pub struct ReplicaManager {
    log_dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
    partitions: RwLock<HashMap<TopicPartition, Arc<PartitionLog>>>,
}

impl ReplicaManager {
    pub fn new(log_dirs: Vec<PathBuf>) -> Self {
        Self {
            log_dirs,
            next_dir: AtomicUsize::new(0),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn log_dirs(&self) -> &[PathBuf] {
        &self.log_dirs
    }

    /// Make this broker the leader of `tp`, creating its log if needed.
    ///
    /// Logs are spread over the log dirs round-robin.
    pub fn become_leader(&self, tp: &TopicPartition) -> Result<Arc<PartitionLog>, BrokerError> {
        if let Some(existing) = self.read().get(tp) {
            return Ok(Arc::clone(existing));
        }

        let mut partitions = self.write();
        if let Some(existing) = partitions.get(tp) {
            return Ok(Arc::clone(existing));
        }
        let log_dir = self.pick_log_dir()?;
        let log = Arc::new(PartitionLog::create(log_dir, tp.clone())?);
        partitions.insert(tp.clone(), Arc::clone(&log));
        metrics::gauge!(m::BROKER_LEADER_PARTITIONS).set(partitions.len() as f64);
        info!(partition = %tp, log_dir = %log_dir.display(), "became leader");
        Ok(log)
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<Arc<PartitionLog>> {
        self.read().get(tp).cloned()
    }

    pub fn is_leader(&self, tp: &TopicPartition) -> bool {
        self.read().contains_key(tp)
    }

    pub fn leader_count(&self) -> usize {
        self.read().len()
    }

    /// Led partitions in sorted order.
    pub fn led_partitions(&self) -> Vec<TopicPartition> {
        let mut led: Vec<_> = self.read().keys().cloned().collect();
        led.sort();
        led
    }

    /// Flush every partition log; failures are logged and counted.
    pub fn flush_all(&self) -> usize {
        let logs: Vec<_> = self.read().values().cloned().collect();
        let mut failures = 0;
        for log in logs {
            if let Err(e) = log.flush() {
                warn!(partition = %log.topic_partition(), error = %e, "failed to flush partition log");
                failures += 1;
            }
        }
        failures
    }

    /// Forget every partition (logs stay on disk).
    pub fn clear(&self) {
        self.write().clear();
        metrics::gauge!(m::BROKER_LEADER_PARTITIONS).set(0.0);
    }

    fn pick_log_dir(&self) -> Result<&Path, BrokerError> {
        if self.log_dirs.is_empty() {
            return Err(BrokerError::Config {
                field: "log_dirs".to_owned(),
                reason: "no log directory configured".to_owned(),
            });
        }
        let idx = self.next_dir.fetch_add(1, Ordering::Relaxed) % self.log_dirs.len();
        Ok(&self.log_dirs[idx])
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TopicPartition, Arc<PartitionLog>>> {
        self.partitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TopicPartition, Arc<PartitionLog>>> {
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
