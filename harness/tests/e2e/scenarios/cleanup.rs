//! On-disk state and resource slots after shutdown.

use crate::helpers::assertions::assert_dirs_removed;
use crate::helpers::fixtures::{harness_with_topic, new_harness, started_harness, state_dirs};

#[tokio::test]
async fn shutdown_removes_directories_and_clears_slots() {
    let kafka = harness_with_topic("cleanup", 2).await;
    kafka.send_messages("cleanup", &["x", "y"]).await.unwrap();
    let dirs = state_dirs(&kafka);
    for dir in &dirs {
        assert!(dir.exists(), "{} should exist while running", dir.display());
    }

    let report = kafka.shutdown().await;
    assert!(report.is_clean(), "{:?}", report.failures());
    assert_dirs_removed(&dirs);
    assert!(kafka.resources().is_empty());
    assert!(kafka.broker().is_none());
    assert!(kafka.bootstrap_servers().is_none());
}

#[tokio::test]
async fn drop_without_shutdown_removes_directories() {
    let kafka = started_harness().await;
    let dirs = state_dirs(&kafka);
    drop(kafka);
    assert_dirs_removed(&dirs);
}

#[tokio::test]
async fn drop_of_unstarted_harness_leaves_nothing() {
    let kafka = new_harness();
    let dirs = state_dirs(&kafka);
    drop(kafka);
    assert_dirs_removed(&dirs);
}

#[tokio::test]
async fn explicit_directories_are_removed_on_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = crate::helpers::fixtures::test_settings();
    settings.coordination.data_dir = tmp.path().join("zk").display().to_string();
    settings.broker.log_dirs = vec![
        tmp.path().join("logs-a").display().to_string(),
        tmp.path().join("logs-b").display().to_string(),
    ];
    let kafka = kafka_harness::EmbeddedKafka::new(settings).unwrap();
    kafka.start().await.unwrap();
    kafka.create_topic("spread", 4, 1).await.unwrap();
    let dirs = state_dirs(&kafka);

    assert!(kafka.shutdown().await.is_clean());
    assert_dirs_removed(&dirs);
    assert!(tmp.path().exists());
}

#[tokio::test]
async fn failed_cleanup_step_does_not_stop_later_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let mut settings = crate::helpers::fixtures::test_settings();
    let data_dir = tmp.path().join("zk");
    let log_dir = tmp.path().join("logs");
    settings.coordination.data_dir = data_dir.display().to_string();
    settings.broker.log_dirs = vec![log_dir.display().to_string()];
    let kafka = kafka_harness::EmbeddedKafka::new(settings).unwrap();
    kafka.start().await.unwrap();
    assert!(data_dir.exists());

    // A regular file where the log directory was cannot be removed as a
    // directory.
    std::fs::remove_dir_all(&log_dir).unwrap();
    std::fs::write(&log_dir, b"not a directory").unwrap();

    let report = kafka.shutdown().await;
    assert!(!report.is_clean());
    assert!(
        report.failures().iter().any(|f| f.step == "broker-logs"),
        "{:?}",
        report.failures()
    );
    assert!(log_dir.is_file());
    assert!(!data_dir.exists(), "coordination data dir should be removed");
    assert!(kafka.resources().is_empty());
    assert!(!kafka.is_running());
    assert_eq!(kafka.state(), harness_core::LifecycleState::Stopped);
}
