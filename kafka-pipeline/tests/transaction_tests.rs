use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use rdkafka::Message;

use kafka_pipeline::test_utils::MemoryBroker;
use kafka_pipeline::types::OffsetReset;
use kafka_pipeline::{
    ConsumedRecord, OutboundRecord, Partition, ProducerRecord, Receiver, ReceiverOptions,
    ReceiverStream, Sender, SenderOptions, Subscription, TransactionError, TransactionState,
};

const GROUP: &str = "transaction-tests";

struct Pipeline {
    broker: MemoryBroker,
    sender: Sender,
    batches: ReceiverStream<Vec<ConsumedRecord>>,
}

fn pipeline(records: usize) -> Pipeline {
    let broker = MemoryBroker::new();
    broker.create_topic("in", 1);
    broker.create_topic("out", 1);
    for i in 0..records {
        broker.produce("in", 0, format!("m{i}"));
    }

    let sender = Sender::transactional(
        Arc::new(broker.transactional_producer("relay-tx")),
        SenderOptions::default(),
    );
    let consumer = broker.subscribe(
        GROUP,
        Subscription::Topics(vec!["in".to_string()]),
        OffsetReset::Earliest,
    );
    let receiver = Receiver::new(
        Arc::new(consumer),
        ReceiverOptions::default().with_poll_timeout(Duration::from_millis(20)),
    );
    let batches = receiver.receive_exactly_once(sender.transaction_coordinator().unwrap());

    Pipeline {
        broker,
        sender,
        batches,
    }
}

fn offsets_and_payloads(batch: &[ConsumedRecord]) -> Vec<(i64, Vec<u8>)> {
    batch
        .iter()
        .map(|r| (r.offset(), r.payload().unwrap_or_default().to_vec()))
        .collect()
}

async fn forward(sender: &Sender, batch: &[ConsumedRecord]) {
    let outbound: Vec<_> = batch
        .iter()
        .map(|r| {
            OutboundRecord::new(
                ProducerRecord::to("out").payload(r.payload().unwrap_or_default()),
                r.offset(),
            )
        })
        .collect();
    let results: Vec<_> = sender.send(stream::iter(outbound)).collect().await;
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.is_ok())));
}

#[tokio::test]
async fn test_abort_redelivers_identical_range() {
    let mut pipeline = pipeline(5);
    let coordinator = pipeline.sender.transaction_coordinator().unwrap();

    let first = pipeline.batches.next().await.unwrap().unwrap();
    assert_eq!(coordinator.state(), TransactionState::Begun);
    forward(&pipeline.sender, &first).await;
    coordinator.abort().await.unwrap();

    let second = pipeline.batches.next().await.unwrap().unwrap();
    assert_eq!(offsets_and_payloads(&first), offsets_and_payloads(&second));
    assert!(pipeline.broker.records("out").is_empty());
    assert_eq!(
        pipeline
            .broker
            .committed_offset(GROUP, &Partition::new("in", 0)),
        None
    );
}

#[tokio::test]
async fn test_commit_publishes_records_and_offsets_together() {
    let mut pipeline = pipeline(5);
    let coordinator = pipeline.sender.transaction_coordinator().unwrap();

    let batch = pipeline.batches.next().await.unwrap().unwrap();
    assert_eq!(batch.len(), 5);
    forward(&pipeline.sender, &batch).await;
    assert_eq!(coordinator.state(), TransactionState::Sending);

    // Nothing is visible before the commit
    assert!(pipeline.broker.records("out").is_empty());
    assert_eq!(
        pipeline
            .broker
            .committed_offset(GROUP, &Partition::new("in", 0)),
        None
    );

    coordinator.commit().await.unwrap();
    let out = pipeline.broker.records("out");
    assert_eq!(out.len(), 5);
    assert_eq!(out[4].payload(), Some("m4".as_bytes()));
    assert_eq!(
        pipeline
            .broker
            .committed_offset(GROUP, &Partition::new("in", 0)),
        Some(5)
    );
}

#[tokio::test]
async fn test_failed_commit_aborts_and_redelivers() {
    let mut pipeline = pipeline(3);
    let coordinator = pipeline.sender.transaction_coordinator().unwrap();
    pipeline.broker.fail_transaction_commits(1);

    let first = pipeline.batches.next().await.unwrap().unwrap();
    forward(&pipeline.sender, &first).await;
    let err = coordinator.commit().await.unwrap_err();
    assert!(matches!(err, TransactionError::CommitFailed(_)));
    assert_eq!(coordinator.state(), TransactionState::Idle);
    assert!(pipeline.broker.records("out").is_empty());

    let second = pipeline.batches.next().await.unwrap().unwrap();
    assert_eq!(offsets_and_payloads(&first), offsets_and_payloads(&second));
    forward(&pipeline.sender, &second).await;
    coordinator.commit().await.unwrap();

    assert_eq!(pipeline.broker.records("out").len(), 3);
    assert_eq!(
        pipeline
            .broker
            .committed_offset(GROUP, &Partition::new("in", 0)),
        Some(3)
    );
}

#[tokio::test]
async fn test_next_batch_waits_for_transaction_outcome() {
    let mut pipeline = pipeline(2);
    let coordinator = pipeline.sender.transaction_coordinator().unwrap();

    let first = pipeline.batches.next().await.unwrap().unwrap();
    pipeline.broker.produce("in", 0, "m2");

    // The transaction is still open, so no further batch is polled
    let pending = tokio::time::timeout(Duration::from_millis(100), pipeline.batches.next()).await;
    assert!(pending.is_err());

    forward(&pipeline.sender, &first).await;
    coordinator.commit().await.unwrap();

    let next = pipeline.batches.next().await.unwrap().unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].offset(), 2);
}
