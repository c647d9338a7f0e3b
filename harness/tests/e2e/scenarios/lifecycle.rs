//! Start/stop state machine.

use std::sync::Arc;

use harness_core::{HarnessError, LifecycleState};
use kafka_harness::EmbeddedKafka;

use crate::helpers::fixtures::{new_harness, started_harness, test_settings};

#[tokio::test]
async fn shutdown_on_never_started_harness_is_noop() {
    let kafka = new_harness();
    assert!(kafka.shutdown().await.is_clean());
    assert!(kafka.shutdown().await.is_clean());
    assert!(!kafka.is_running());
    assert_eq!(kafka.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn start_then_running_shutdown_then_stopped() {
    let kafka = started_harness().await;
    assert_eq!(kafka.state(), LifecycleState::Running);
    assert!(kafka.bootstrap_servers().is_some());
    assert!(kafka.coordination_connect().is_some());

    let report = kafka.shutdown().await;
    assert!(report.is_clean(), "{:?}", report.failures());
    assert!(!kafka.is_running());
    assert_eq!(kafka.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn shutdown_twice_in_succession() {
    let kafka = started_harness().await;
    assert!(kafka.shutdown().await.is_clean());
    assert!(kafka.shutdown().await.is_clean());
    assert!(!kafka.is_running());
}

#[tokio::test]
async fn second_start_is_noop() {
    let kafka = started_harness().await;
    let bootstrap = kafka.bootstrap_servers();
    let broker = kafka.broker().expect("broker present");

    kafka.start().await.unwrap();
    assert_eq!(kafka.bootstrap_servers(), bootstrap);
    assert!(Arc::ptr_eq(&broker, &kafka.broker().unwrap()));

    kafka.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_launch_one_broker() {
    let kafka = Arc::new(new_harness());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let kafka = Arc::clone(&kafka);
            tokio::spawn(async move { kafka.ensure_started().await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert!(kafka.is_running());
    assert!(kafka.resources().broker);

    kafka.shutdown().await;
}

#[tokio::test]
async fn restart_after_shutdown() {
    let kafka = started_harness().await;
    kafka.shutdown().await;

    kafka.start().await.unwrap();
    assert!(kafka.is_running());
    kafka.create_topic("after-restart", 1, 1).await.unwrap();
    assert!(kafka.shutdown().await.is_clean());
}

#[tokio::test]
async fn failed_start_rolls_back() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut settings = test_settings();
    settings.broker.port = occupied.local_addr().unwrap().port();
    let kafka = EmbeddedKafka::new(settings).unwrap();

    let err = kafka.start().await.unwrap_err();
    assert!(matches!(err, HarnessError::Broker(_)), "{err}");
    assert!(!kafka.is_running());
    assert_eq!(kafka.state(), LifecycleState::Stopped);
    assert!(kafka.resources().is_empty());
    assert!(!kafka.settings().coordination.data_dir_path().exists());
}

#[tokio::test]
async fn health_follows_lifecycle() {
    let kafka = new_harness();
    assert!(kafka.health().status.is_unhealthy());

    kafka.start().await.unwrap();
    let health = kafka.health();
    assert!(health.status.is_healthy(), "{:?}", health.status);
    assert_eq!(health.state, "running");

    kafka.shutdown().await;
    assert!(kafka.health().status.is_unhealthy());
}
