//! Lazy accessors: `server()`, `producer()`, `consumer()`.

use std::sync::Arc;

use harness_core::HarnessError;

use crate::helpers::fixtures::{new_harness, started_harness};

#[tokio::test]
async fn producer_before_start_is_illegal_state() {
    let kafka = new_harness();
    let err = kafka.producer().await.unwrap_err();
    assert!(matches!(err, HarnessError::IllegalState(_)), "{err}");
    assert!(err.to_string().contains("start the harness first"));
    assert!(!kafka.resources().producer);
}

#[tokio::test]
async fn producer_is_cached() {
    let kafka = started_harness().await;
    let first = kafka.producer().await.unwrap();
    let second = kafka.producer().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(kafka.resources().producer);

    kafka.shutdown().await;
    assert!(first.is_closed());
}

#[tokio::test]
async fn concurrent_producer_calls_share_one_session() {
    let kafka = Arc::new(started_harness().await);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let kafka = Arc::clone(&kafka);
            tokio::spawn(async move { kafka.producer().await })
        })
        .collect();
    let mut producers = Vec::new();
    for handle in handles {
        producers.push(handle.await.unwrap().unwrap());
    }
    for producer in &producers[1..] {
        assert!(Arc::ptr_eq(&producers[0], producer));
    }

    kafka.shutdown().await;
}

#[tokio::test]
async fn server_starts_lazily() {
    let kafka = new_harness();
    assert!(kafka.broker().is_none());

    let broker = kafka.server().await.unwrap();
    assert!(kafka.is_running());
    assert!(Arc::ptr_eq(&broker, &kafka.broker().unwrap()));
    assert_eq!(broker.bootstrap_servers(), kafka.bootstrap_servers());

    kafka.shutdown().await;
}

#[tokio::test]
async fn server_on_running_harness_does_not_restart() {
    let kafka = started_harness().await;
    let before = kafka.broker().unwrap();
    let after = kafka.server().await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    kafka.shutdown().await;
}

#[tokio::test]
async fn coordination_client_sees_broker_registration() {
    let kafka = started_harness().await;
    let client = kafka.coordination_client().expect("client connected");
    let ids = client.get_children("/brokers/ids").await.unwrap();
    assert_eq!(ids, vec!["0".to_owned()]);

    kafka.shutdown().await;
    assert!(kafka.coordination_client().is_none());
}

#[tokio::test]
async fn consumer_requires_non_empty_group() {
    let kafka = started_harness().await;
    assert!(kafka.consumer("").await.is_err());
    let consumer = kafka.consumer("group").await.unwrap();
    assert_eq!(consumer.group_id(), "group");
    consumer.close().await.unwrap();

    kafka.shutdown().await;
}

#[tokio::test]
async fn subscribe_to_unknown_topic_fails() {
    let kafka = started_harness().await;
    let mut consumer = kafka.consumer("group").await.unwrap();
    assert!(consumer.subscribe("missing").await.is_err());

    kafka.shutdown().await;
}
