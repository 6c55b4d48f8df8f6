use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use rdkafka::Message;

use kafka_pipeline::test_utils::MemoryBroker;
use kafka_pipeline::{OutboundRecord, ProducerRecord, Sender, SenderOptions};

fn numbered_records(topic: &str, count: usize) -> Vec<OutboundRecord<usize>> {
    (1..=count)
        .map(|i| OutboundRecord::new(ProducerRecord::to(topic).payload(format!("record-{i}")), i))
        .collect()
}

#[tokio::test]
async fn test_in_flight_cap_holds_back_dispatch() {
    let broker = MemoryBroker::new();
    broker.create_topic("out", 1);
    broker.hold("record-1");
    broker.hold("record-2");

    let sender = Sender::new(
        Arc::new(broker.producer()),
        SenderOptions::default().with_max_in_flight(2),
    );
    let results = tokio::spawn(
        sender
            .send(stream::iter(numbered_records("out", 5)))
            .collect::<Vec<_>>(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.dispatched_count(), 2);
    assert_eq!(sender.limiter().in_flight(), 2);

    broker.release("record-1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Records 3 to 5 go through the freed slot while record 2 still holds the other
    assert_eq!(broker.dispatched_count(), 5);
    assert_eq!(sender.limiter().in_flight(), 1);

    broker.release("record-2");
    let results = results.await.unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.is_ok())));
    assert_eq!(broker.dispatched_count(), 5);
    assert!(sender.limiter().high_water_mark() <= 2);
    assert_eq!(sender.limiter().in_flight(), 0);
}

#[tokio::test]
async fn test_skip_and_report_completes_stream() {
    let broker = MemoryBroker::new();
    broker.create_topic("out", 1);
    broker.fail_permanently("record-3");

    let sender = Sender::new(
        Arc::new(broker.producer()),
        SenderOptions::default().with_stop_on_error(false),
    );
    let results: Vec<_> = sender
        .send(stream::iter(numbered_records("out", 5)))
        .collect()
        .await;

    assert_eq!(results.len(), 5);
    let outcomes: HashMap<usize, bool> = results
        .into_iter()
        .map(|r| {
            let r = r.unwrap();
            let ok = r.is_ok();
            (r.correlation, ok)
        })
        .collect();
    assert_eq!(
        outcomes,
        HashMap::from([(1, true), (2, true), (3, false), (4, true), (5, true)])
    );
    assert_eq!(broker.records("out").len(), 4);
}

#[tokio::test]
async fn test_correlation_tokens_match_their_records() {
    let broker = MemoryBroker::new();
    broker.create_topic("out", 4);

    let sender = Sender::new(
        Arc::new(broker.producer()),
        SenderOptions::default().with_max_in_flight(16),
    );
    let records: Vec<_> = (0..16)
        .map(|i| {
            OutboundRecord::new(
                ProducerRecord::to("out")
                    .key(format!("key-{i}"))
                    .payload(format!("payload-{i}")),
                format!("payload-{i}"),
            )
        })
        .collect();

    let results: Vec<_> = sender.send(stream::iter(records)).collect().await;
    assert_eq!(results.len(), 16);

    let stored = broker.records("out");
    for result in results {
        let result = result.unwrap();
        let metadata = result.result.as_ref().unwrap();
        let record = stored
            .iter()
            .find(|m| {
                m.partition() == metadata.partition.partition_number()
                    && m.offset() == metadata.offset
            })
            .unwrap();
        assert_eq!(record.payload(), Some(result.correlation.as_bytes()));
    }
}

#[tokio::test]
async fn test_high_water_mark_never_exceeds_cap() {
    let broker = MemoryBroker::new();
    broker.create_topic("out", 3);

    let sender = Sender::new(
        Arc::new(broker.producer()),
        SenderOptions::default().with_max_in_flight(4),
    );
    let results: Vec<_> = sender
        .send(stream::iter(numbered_records("out", 200)))
        .collect()
        .await;

    assert_eq!(results.len(), 200);
    let high_water_mark = sender.limiter().high_water_mark();
    assert!(high_water_mark >= 1);
    assert!(high_water_mark <= 4);
}

#[tokio::test]
async fn test_close_after_all_results() {
    let broker = MemoryBroker::new();
    broker.create_topic("out", 1);
    let sender = Sender::new(Arc::new(broker.producer()), SenderOptions::default());

    let results: Vec<_> = sender
        .send(stream::iter(numbered_records("out", 3)))
        .collect()
        .await;
    assert_eq!(results.len(), 3);
    sender.close().await.unwrap();
    assert_eq!(sender.limiter().in_flight(), 0);
}
