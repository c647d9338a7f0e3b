//! Topic creation and propagation.

use harness_broker::BrokerError;
use harness_core::HarnessError;

use crate::helpers::fixtures::{harness_with_topic, started_harness};

#[tokio::test]
async fn created_topic_has_leader_for_every_partition() {
    let kafka = harness_with_topic("orders", 3).await;
    let admin = kafka.broker().unwrap().admin().unwrap();

    for partition in 0..3 {
        let state = admin
            .partition_state("orders", partition)
            .await
            .unwrap()
            .expect("state node written");
        assert_eq!(state.leader, 0);
        assert_eq!(state.isr, vec![0]);
    }
    assert_eq!(kafka.broker().unwrap().leader_count(), 3);

    kafka.shutdown().await;
}

#[tokio::test]
async fn await_propagation_on_existing_partition() {
    let kafka = harness_with_topic("events", 1).await;
    kafka.await_propagation("events", 0).await.unwrap();
    kafka.shutdown().await;
}

#[tokio::test]
async fn duplicate_topic_is_reported_unmodified() {
    let kafka = harness_with_topic("orders", 1).await;

    let err = kafka.create_topic("orders", 1, 1).await.unwrap_err();
    assert!(matches!(
        err.domain_error::<BrokerError>(),
        Some(BrokerError::TopicExists { topic }) if topic == "orders"
    ));

    kafka.shutdown().await;
}

#[tokio::test]
async fn replication_beyond_live_brokers_is_rejected() {
    let kafka = started_harness().await;

    let err = kafka.create_topic("orders", 1, 3).await.unwrap_err();
    assert!(matches!(
        err.domain_error::<BrokerError>(),
        Some(BrokerError::InvalidReplicationFactor {
            live_brokers: 1,
            ..
        })
    ));

    kafka.shutdown().await;
}

#[tokio::test]
async fn invalid_topic_name_is_rejected() {
    let kafka = started_harness().await;

    let err = kafka.create_topic("bad/name", 1, 1).await.unwrap_err();
    assert!(matches!(
        err.domain_error::<BrokerError>(),
        Some(BrokerError::InvalidTopic { .. })
    ));

    kafka.shutdown().await;
}

#[tokio::test]
async fn propagation_of_missing_partition_times_out() {
    let mut settings = crate::helpers::fixtures::test_settings();
    settings.timeouts.propagation_ms = 1_000;
    settings.timeouts.propagation_poll_ms = 50;
    let kafka = kafka_harness::EmbeddedKafka::new(settings).unwrap();
    kafka.start().await.unwrap();
    kafka.create_topic("orders", 1, 1).await.unwrap();

    let err = kafka.await_propagation("orders", 7).await.unwrap_err();
    assert!(matches!(err, HarnessError::PreconditionTimeout { .. }));

    kafka.shutdown().await;
}

#[tokio::test]
async fn abandoned_topic_creation_leaves_sessions_usable() {
    let kafka = started_harness().await;

    for i in 0..50u64 {
        let window = std::time::Duration::from_micros(30 + i * 10);
        let topic = format!("abandoned-{i}");
        // Some of these finish inside the window; the rest are dropped mid-request.
        let _ = tokio::time::timeout(window, kafka.create_topic(&topic, 1, 1)).await;
    }

    kafka.create_topic("after-abandon", 1, 1).await.unwrap();
    kafka.await_propagation("after-abandon", 0).await.unwrap();
    assert_eq!(
        kafka.coordination_client().map(|client| client.is_connected()),
        Some(true)
    );
    assert!(kafka.is_running());

    assert!(kafka.shutdown().await.is_clean());
}
