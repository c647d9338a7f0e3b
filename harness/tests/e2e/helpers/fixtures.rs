//! Harness fixtures.

use std::path::PathBuf;

use harness_core::HarnessConfig;
use kafka_harness::EmbeddedKafka;
use kafka_harness::logging::init_test_tracing;

/// Defaults with ephemeral ports and fresh temp directories.
#[allow(dead_code)]
pub fn test_settings() -> HarnessConfig {
    HarnessConfig::default()
}

/// A harness that has not been started.
#[allow(dead_code)]
pub fn new_harness() -> EmbeddedKafka {
    init_test_tracing();
    EmbeddedKafka::new(test_settings()).expect("default settings are valid")
}

/// A started harness.
#[allow(dead_code)]
pub async fn started_harness() -> EmbeddedKafka {
    let kafka = new_harness();
    kafka.start().await.expect("harness should start");
    assert!(kafka.is_running());
    kafka
}

/// A started harness with `topic` created.
#[allow(dead_code)]
pub async fn harness_with_topic(topic: &str, partitions: i32) -> EmbeddedKafka {
    let kafka = started_harness().await;
    kafka
        .create_topic(topic, partitions, 1)
        .await
        .expect("topic should be created");
    kafka
}

/// Every directory the harness writes to.
#[allow(dead_code)]
pub fn state_dirs(kafka: &EmbeddedKafka) -> Vec<PathBuf> {
    let mut dirs = kafka.settings().broker.log_dir_paths();
    dirs.push(kafka.settings().coordination.data_dir_path());
    dirs
}

/// Messages `msg-0` .. `msg-{count-1}`.
#[allow(dead_code)]
pub fn distinct_messages(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("msg-{i}")).collect()
}
