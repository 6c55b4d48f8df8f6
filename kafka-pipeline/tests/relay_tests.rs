use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::Message;

use kafka_pipeline::relay::{Relay, RelayMode};
use kafka_pipeline::test_utils::MemoryBroker;
use kafka_pipeline::types::OffsetReset;
use kafka_pipeline::{Partition, Receiver, ReceiverOptions, Sender, SenderOptions, Subscription};

const GROUP: &str = "relay-tests";

fn seeded_broker(records: i32) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_topic("in", 3);
    broker.create_topic("out", 3);
    for i in 0..records {
        broker.produce("in", i % 3, format!("m{i}"));
    }
    broker
}

fn receiver(broker: &MemoryBroker) -> Receiver {
    let consumer = broker.subscribe(
        GROUP,
        Subscription::Topics(vec!["in".to_string()]),
        OffsetReset::Earliest,
    );
    Receiver::new(
        Arc::new(consumer),
        ReceiverOptions::default()
            .with_commit_interval(Duration::from_millis(20))
            .with_poll_timeout(Duration::from_millis(20)),
    )
}

async fn until_output_has(broker: MemoryBroker, count: usize) {
    while broker.records("out").len() < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn output_payloads(broker: &MemoryBroker) -> BTreeSet<Vec<u8>> {
    broker
        .records("out")
        .iter()
        .filter_map(|m| m.payload().map(<[u8]>::to_vec))
        .collect()
}

fn input_payloads(records: i32) -> BTreeSet<Vec<u8>> {
    (0..records).map(|i| format!("m{i}").into_bytes()).collect()
}

#[tokio::test]
async fn test_at_least_once_relay_copies_and_commits() {
    let broker = seeded_broker(30);
    let sender = Sender::new(Arc::new(broker.producer()), SenderOptions::default());
    let relay = Relay::new(receiver(&broker), sender, "out", RelayMode::AtLeastOnce);

    tokio::time::timeout(
        Duration::from_secs(5),
        relay.run(until_output_has(broker.clone(), 30)),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(output_payloads(&broker), input_payloads(30));
    for number in 0..3 {
        assert_eq!(
            broker.committed_offset(GROUP, &Partition::new("in", number)),
            Some(10)
        );
    }
}

#[tokio::test]
async fn test_at_most_once_relay_copies_records() {
    let broker = seeded_broker(12);
    let sender = Sender::new(Arc::new(broker.producer()), SenderOptions::default());
    let relay = Relay::new(receiver(&broker), sender, "out", RelayMode::AtMostOnce);

    tokio::time::timeout(
        Duration::from_secs(5),
        relay.run(until_output_has(broker.clone(), 12)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(output_payloads(&broker), input_payloads(12));
    for number in 0..3 {
        assert_eq!(
            broker.committed_offset(GROUP, &Partition::new("in", number)),
            Some(4)
        );
    }
}

#[tokio::test]
async fn test_exactly_once_relay_commits_offsets_with_output() {
    let broker = seeded_broker(30);
    let sender = Sender::transactional(
        Arc::new(broker.transactional_producer("relay-tx")),
        SenderOptions::default(),
    );
    let relay = Relay::new(receiver(&broker), sender, "out", RelayMode::ExactlyOnce);

    tokio::time::timeout(
        Duration::from_secs(5),
        relay.run(until_output_has(broker.clone(), 30)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(broker.records("out").len(), 30);
    assert_eq!(output_payloads(&broker), input_payloads(30));
    for number in 0..3 {
        assert_eq!(
            broker.committed_offset(GROUP, &Partition::new("in", number)),
            Some(10)
        );
    }
}

#[tokio::test]
async fn test_exactly_once_relay_retries_failed_batch() {
    let broker = seeded_broker(6);
    broker.fail_transaction_commits(1);
    let sender = Sender::transactional(
        Arc::new(broker.transactional_producer("relay-tx")),
        SenderOptions::default(),
    );
    let relay = Relay::new(receiver(&broker), sender, "out", RelayMode::ExactlyOnce);

    tokio::time::timeout(
        Duration::from_secs(5),
        relay.run(until_output_has(broker.clone(), 6)),
    )
    .await
    .unwrap()
    .unwrap();

    // The aborted attempt left nothing behind
    assert_eq!(broker.records("out").len(), 6);
    assert_eq!(output_payloads(&broker), input_payloads(6));
}

#[tokio::test]
async fn test_exactly_once_relay_requires_transactional_sender() {
    let broker = seeded_broker(1);
    let sender = Sender::new(Arc::new(broker.producer()), SenderOptions::default());
    let relay = Relay::new(receiver(&broker), sender, "out", RelayMode::ExactlyOnce);

    assert!(relay.run(std::future::pending()).await.is_err());
}
