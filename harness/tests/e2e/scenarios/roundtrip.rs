//! Produce through the harness, consume through a session.

use std::collections::{HashMap, HashSet};

use crate::helpers::assertions::{DELIVERY, POLL_TIMEOUT, assert_count_reaches};
use crate::helpers::fixtures::{distinct_messages, harness_with_topic};

#[tokio::test]
async fn thousand_messages_reach_consumer() {
    let kafka = harness_with_topic("roundtrip", 3).await;
    let mut consumer = kafka.consumer("roundtrip-group").await.unwrap();
    consumer.subscribe("roundtrip").await.unwrap();
    let counter = consumer.spawn_counter();

    kafka
        .send_messages("roundtrip", &distinct_messages(1000))
        .await
        .unwrap();

    assert_count_reaches(&counter, 1000, DELIVERY).await;
    assert!(counter.stop().await >= 1000);
    kafka.shutdown().await;
}

#[tokio::test]
async fn records_are_keyed_by_message_text() {
    let kafka = harness_with_topic("keyed", 1).await;
    kafka
        .send_messages("keyed", &["alpha", "beta", "gamma"])
        .await
        .unwrap();

    let mut consumer = kafka.consumer("keyed-group").await.unwrap();
    consumer.subscribe("keyed").await.unwrap();
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let records = consumer.poll(POLL_TIMEOUT).await.unwrap();
        assert!(!records.is_empty(), "poll timed out after {} records", seen.len());
        seen.extend(records);
    }

    for record in &seen {
        assert_eq!(record.key.as_deref(), Some(record.value.as_str()));
    }
    let offsets: Vec<i64> = seen.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);

    consumer.close().await.unwrap();
    kafka.shutdown().await;
}

#[tokio::test]
async fn frequency_map_expands_to_counts() {
    let kafka = harness_with_topic("counts", 2).await;
    let counts = HashMap::from([("a".to_owned(), 3), ("b".to_owned(), 2), ("c".to_owned(), 0)]);
    kafka.send_message_counts("counts", &counts).await.unwrap();

    let mut consumer = kafka.consumer("counts-group").await.unwrap();
    consumer.subscribe("counts").await.unwrap();
    let mut received: HashMap<String, usize> = HashMap::new();
    for _ in 0..20 {
        for record in consumer.poll(POLL_TIMEOUT).await.unwrap() {
            *received.entry(record.value).or_default() += 1;
        }
        if received.values().sum::<usize>() >= 5 {
            break;
        }
    }

    assert_eq!(received.get("a"), Some(&3));
    assert_eq!(received.get("b"), Some(&2));
    assert!(!received.contains_key("c"));
    kafka.shutdown().await;
}

#[tokio::test]
async fn same_key_lands_on_same_partition() {
    let kafka = harness_with_topic("sticky", 4).await;
    kafka
        .send_messages("sticky", &["k", "k", "k", "k"])
        .await
        .unwrap();

    let mut consumer = kafka.consumer("sticky-group").await.unwrap();
    consumer.subscribe("sticky").await.unwrap();
    let mut partitions = HashSet::new();
    let mut total = 0;
    for _ in 0..20 {
        for record in consumer.poll(POLL_TIMEOUT).await.unwrap() {
            partitions.insert(record.partition);
            total += 1;
        }
        if total >= 4 {
            break;
        }
    }

    assert_eq!(total, 4);
    assert_eq!(partitions.len(), 1);
    kafka.shutdown().await;
}

#[tokio::test]
async fn committed_offsets_resume_group() {
    let kafka = harness_with_topic("resume", 1).await;
    kafka
        .send_messages("resume", &distinct_messages(5))
        .await
        .unwrap();

    let mut first = kafka.consumer("resume-group").await.unwrap();
    first.subscribe("resume").await.unwrap();
    let mut consumed = 0;
    for _ in 0..20 {
        consumed += first.poll(POLL_TIMEOUT).await.unwrap().len();
        if consumed >= 5 {
            break;
        }
    }
    assert_eq!(consumed, 5);
    first.close().await.unwrap();

    kafka.send_messages("resume", &["late"]).await.unwrap();
    let mut second = kafka.consumer("resume-group").await.unwrap();
    second.subscribe("resume").await.unwrap();
    let records = second.poll(POLL_TIMEOUT).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, "late");
    assert_eq!(records[0].offset, 5);

    second.close().await.unwrap();
    kafka.shutdown().await;
}
