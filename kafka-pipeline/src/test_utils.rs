//! In-memory broker for exercising senders, receivers and transactions without Kafka.
//!
//! `MemoryBroker` keeps topic logs and group commits behind a shared lock. Consumers
//! and producers created from it implement the client traits, and a few switches
//! inject failures into the next calls.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;
use rdkafka::Timestamp;
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::client::{ConsumerClient, GroupMetadata, ProducerClient};
use crate::error::BrokerError;
use crate::receiver::{ConsumedRecord, ReceiverOffset};
use crate::types::{
    OffsetReset, Partition, PartitionOffset, ProducerRecord, RecordMetadata, Subscription,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<Vec<StoredRecord>>>,
    commits: HashMap<(String, Partition), Vec<i64>>,
    commit_failures: usize,
    transaction_commit_failures: usize,
    transaction_abort_failures: usize,
    poll_failures: VecDeque<BrokerError>,
    transient_failures: HashMap<Vec<u8>, usize>,
    permanent_failures: HashSet<Vec<u8>>,
    held: HashMap<Vec<u8>, Arc<Notify>>,
    dispatched: usize,
    round_robin: usize,
}

impl BrokerState {
    fn partitions_of(&mut self, topic: &str) -> &mut Vec<Vec<StoredRecord>> {
        // Unknown topics are auto-created with a single partition
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new()])
    }

    fn choose_partition(&mut self, record: &ProducerRecord) -> i32 {
        let count = self.partitions_of(&record.topic).len();
        if let Some(partition) = record.partition {
            return partition;
        }
        let slot = match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                hasher.finish() as usize
            }
            None => {
                self.round_robin += 1;
                self.round_robin
            }
        };
        (slot % count) as i32
    }

    fn append(&mut self, partition: &Partition, record: StoredRecord) -> Result<i64, BrokerError> {
        let log = self
            .partitions_of(partition.topic())
            .get_mut(partition.partition_number() as usize)
            .ok_or(BrokerError::Kafka(KafkaError::MessageProduction(
                RDKafkaErrorCode::UnknownPartition,
            )))?;
        log.push(record);
        Ok(log.len() as i64 - 1)
    }

    fn committed(&self, group: &str, partition: &Partition) -> Option<i64> {
        self.commits
            .get(&(group.to_string(), partition.clone()))
            .and_then(|history| history.last().copied())
    }

    fn commit(&mut self, group: &str, offsets: &[PartitionOffset]) {
        for offset in offsets {
            self.commits
                .entry((group.to_string(), offset.partition().clone()))
                .or_default()
                .push(offset.offset());
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    produced: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A broker whose topics and group offsets live in memory. Clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                produced: Notify::new(),
            }),
        }
    }

    pub fn create_topic(&self, name: &str, partitions: usize) {
        self.shared
            .lock()
            .topics
            .insert(name.to_string(), vec![Vec::new(); partitions.max(1)]);
    }

    /// Append a record directly to a partition log, returning its offset
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = self
            .shared
            .lock()
            .append(
                &Partition::new(topic, partition),
                StoredRecord {
                    key: None,
                    payload: Some(payload.into()),
                },
            )
            .expect("partition exists");
        self.shared.produced.notify_waiters();
        offset
    }

    /// Records visible to consumers, ordered by partition then offset.
    /// Records of open or aborted transactions are not included.
    pub fn records(&self, topic: &str) -> Vec<OwnedMessage> {
        let state = self.shared.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, record)| {
                    message(topic, partition as i32, offset as i64, record)
                })
            })
            .collect()
    }

    /// A group member with no subscription, for driving commits and seeks
    pub fn consumer(&self, group: &str) -> MemoryConsumer {
        MemoryConsumer {
            shared: self.shared.clone(),
            group: group.to_string(),
            subscription: None,
            reset: OffsetReset::Earliest,
            positions: Mutex::new(HashMap::new()),
            revoked: Mutex::new(Vec::new()),
        }
    }

    /// A group member assigned every partition of the topics matching `subscription`
    pub fn subscribe(
        &self,
        group: &str,
        subscription: Subscription,
        reset: OffsetReset,
    ) -> MemoryConsumer {
        let matcher = match subscription {
            Subscription::Topics(topics) => TopicMatcher::Names(topics),
            Subscription::Pattern(pattern) => {
                TopicMatcher::Pattern(Regex::new(&pattern).expect("valid subscription pattern"))
            }
        };
        MemoryConsumer {
            subscription: Some(matcher),
            reset,
            ..self.consumer(group)
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            shared: self.shared.clone(),
            transactional_id: None,
            transaction: Mutex::new(None),
        }
    }

    pub fn transactional_producer(&self, transactional_id: &str) -> MemoryProducer {
        MemoryProducer {
            transactional_id: Some(transactional_id.to_string()),
            ..self.producer()
        }
    }

    /// Every offset committed for the partition by the group, oldest first
    pub fn commit_history(&self, group: &str, partition: &Partition) -> Vec<i64> {
        self.shared
            .lock()
            .commits
            .get(&(group.to_string(), partition.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, partition: &Partition) -> Option<i64> {
        self.shared.lock().committed(group, partition)
    }

    /// Fail the next `count` consumer offset commits with a retriable error
    pub fn fail_commits(&self, count: usize) {
        self.shared.lock().commit_failures = count;
    }

    /// Fail the next `count` transaction commits
    pub fn fail_transaction_commits(&self, count: usize) {
        self.shared.lock().transaction_commit_failures = count;
    }

    /// Fail the next `count` transaction aborts after discarding the transaction
    pub fn fail_transaction_aborts(&self, count: usize) {
        self.shared.lock().transaction_abort_failures = count;
    }

    /// Return `error` from the next consumer poll
    pub fn fail_next_poll(&self, error: BrokerError) {
        self.shared.lock().poll_failures.push_back(error);
    }

    /// Reject the next `attempts` sends of the payload with a retriable error
    pub fn fail_transiently(&self, payload: impl Into<Vec<u8>>, attempts: usize) {
        self.shared
            .lock()
            .transient_failures
            .insert(payload.into(), attempts);
    }

    /// Reject every send of the payload with a non-retriable error
    pub fn fail_permanently(&self, payload: impl Into<Vec<u8>>) {
        self.shared.lock().permanent_failures.insert(payload.into());
    }

    /// Leave sends of the payload unacknowledged until `release` is called
    pub fn hold(&self, payload: impl Into<Vec<u8>>) {
        self.shared
            .lock()
            .held
            .insert(payload.into(), Arc::new(Notify::new()));
    }

    pub fn release(&self, payload: impl AsRef<[u8]>) {
        if let Some(gate) = self.shared.lock().held.remove(payload.as_ref()) {
            gate.notify_one();
        }
    }

    /// Number of send attempts that reached the broker, failed ones included
    pub fn dispatched_count(&self) -> usize {
        self.shared.lock().dispatched
    }
}

fn message(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> OwnedMessage {
    OwnedMessage::new(
        record.payload.clone(),
        record.key.clone(),
        topic.to_string(),
        Timestamp::NotAvailable,
        partition,
        offset,
        None,
    )
}

enum TopicMatcher {
    Names(Vec<String>),
    Pattern(Regex),
}

impl TopicMatcher {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatcher::Names(names) => names.iter().any(|name| name == topic),
            TopicMatcher::Pattern(pattern) => pattern.is_match(topic),
        }
    }
}

pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group: String,
    subscription: Option<TopicMatcher>,
    reset: OffsetReset,
    positions: Mutex<HashMap<Partition, i64>>,
    revoked: Mutex<Vec<Partition>>,
}

impl MemoryConsumer {
    /// Next offset this member will fetch from the partition
    pub fn position(&self, partition: &Partition) -> Option<i64> {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .copied()
    }

    /// Report the partition as revoked. The member keeps fetching from its
    /// current position, as if the partition was assigned straight back.
    pub fn revoke(&self, partition: Partition) {
        self.revoked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(partition);
    }

    fn fetch(&self, max_records: usize) -> Result<Vec<OwnedMessage>, BrokerError> {
        let mut state = self.shared.lock();
        if let Some(error) = state.poll_failures.pop_front() {
            return Err(error);
        }
        let Some(subscription) = &self.subscription else {
            return Ok(Vec::new());
        };

        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = Vec::new();
        for (topic, partitions) in &state.topics {
            if !subscription.matches(topic) {
                continue;
            }
            for (number, log) in partitions.iter().enumerate() {
                let partition = Partition::new(topic.as_str(), number as i32);
                let position = positions.entry(partition.clone()).or_insert_with(|| {
                    state.committed(&self.group, &partition).unwrap_or(match self.reset {
                        OffsetReset::Earliest => 0,
                        OffsetReset::Latest => log.len() as i64,
                    })
                });
                while batch.len() < max_records {
                    let Some(record) = log.get(*position as usize) else {
                        break;
                    };
                    batch.push(message(topic, number as i32, *position, record));
                    *position += 1;
                }
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl ConsumerClient for MemoryConsumer {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<OwnedMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let produced = self.shared.produced.notified();
            let batch = self.fetch(max_records)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, produced).await.is_err() {
                return Ok(batch);
            }
        }
    }

    async fn commit(&self, offsets: Vec<PartitionOffset>) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(BrokerError::Kafka(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RequestTimedOut,
            )));
        }
        state.commit(&self.group, &offsets);
        Ok(())
    }

    async fn seek(&self, offsets: Vec<PartitionOffset>) -> Result<(), BrokerError> {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        for offset in offsets {
            positions.insert(offset.partition().clone(), offset.offset());
        }
        Ok(())
    }

    fn group_metadata(&self) -> Option<GroupMetadata> {
        Some(GroupMetadata::new(self.group.as_str()))
    }

    fn take_revoked(&self) -> Vec<Partition> {
        std::mem::take(&mut *self.revoked.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Default)]
struct OpenTransaction {
    records: Vec<(Partition, StoredRecord)>,
    offsets: Vec<(String, Vec<PartitionOffset>)>,
}

pub struct MemoryProducer {
    shared: Arc<Shared>,
    transactional_id: Option<String>,
    transaction: Mutex<Option<OpenTransaction>>,
}

impl MemoryProducer {
    pub fn transactional_id(&self) -> Option<&str> {
        self.transactional_id.as_deref()
    }

    fn open_transaction(&self) -> MutexGuard<'_, Option<OpenTransaction>> {
        self.transaction.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_transactional(&self) -> Result<(), BrokerError> {
        match self.transactional_id {
            Some(_) => Ok(()),
            None => Err(BrokerError::Unsupported(
                "transactions require a transactional id",
            )),
        }
    }
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn send(&self, record: &ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        let payload = record.payload.clone().unwrap_or_default();
        let gate = {
            let mut state = self.shared.lock();
            state.dispatched += 1;
            state.held.get(&payload).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.shared.lock();
        if state.permanent_failures.contains(&payload) {
            return Err(BrokerError::Kafka(KafkaError::MessageProduction(
                RDKafkaErrorCode::MessageSizeTooLarge,
            )));
        }
        if let Some(remaining) = state.transient_failures.get_mut(&payload) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrokerError::Kafka(KafkaError::MessageProduction(
                    RDKafkaErrorCode::QueueFull,
                )));
            }
        }

        let partition = Partition::new(record.topic.as_str(), state.choose_partition(record));
        let stored = StoredRecord {
            key: record.key.clone(),
            payload: record.payload.clone(),
        };

        if self.transactional_id.is_some() {
            let mut transaction = self.open_transaction();
            let open = transaction
                .as_mut()
                .ok_or(BrokerError::Unsupported("send outside of a transaction"))?;
            // Offsets are final only once the transaction commits
            let log_len = state
                .partitions_of(partition.topic())
                .get(partition.partition_number() as usize)
                .map_or(0, Vec::len);
            let buffered = open.records.iter().filter(|(p, _)| *p == partition).count();
            open.records.push((partition.clone(), stored));
            return Ok(RecordMetadata {
                partition,
                offset: (log_len + buffered) as i64,
            });
        }

        let offset = state.append(&partition, stored)?;
        drop(state);
        self.shared.produced.notify_waiters();
        Ok(RecordMetadata { partition, offset })
    }

    async fn begin_transaction(&self) -> Result<(), BrokerError> {
        self.require_transactional()?;
        let mut transaction = self.open_transaction();
        if transaction.is_some() {
            return Err(BrokerError::Unsupported("transaction already open"));
        }
        *transaction = Some(OpenTransaction::default());
        Ok(())
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: Vec<PartitionOffset>,
        group: GroupMetadata,
    ) -> Result<(), BrokerError> {
        self.require_transactional()?;
        self.open_transaction()
            .as_mut()
            .ok_or(BrokerError::Unsupported("no open transaction"))?
            .offsets
            .push((group.group_id().to_string(), offsets));
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), BrokerError> {
        self.require_transactional()?;
        let mut state = self.shared.lock();
        if state.transaction_commit_failures > 0 {
            state.transaction_commit_failures -= 1;
            return Err(BrokerError::Timeout(Duration::from_secs(10)));
        }

        let open = self
            .open_transaction()
            .take()
            .ok_or(BrokerError::Unsupported("no open transaction"))?;
        for (partition, record) in open.records {
            state.append(&partition, record)?;
        }
        for (group, offsets) in &open.offsets {
            state.commit(group, offsets);
        }
        drop(state);
        self.shared.produced.notify_waiters();
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<(), BrokerError> {
        self.require_transactional()?;
        *self.open_transaction() = None;
        let mut state = self.shared.lock();
        if state.transaction_abort_failures > 0 {
            state.transaction_abort_failures -= 1;
            return Err(BrokerError::Timeout(Duration::from_secs(10)));
        }
        Ok(())
    }
}

/// A received record whose offset needs no acknowledgment tracking
pub fn consumed_record(partition: &Partition, offset: i64, payload: &str) -> ConsumedRecord {
    let message = OwnedMessage::new(
        Some(payload.as_bytes().to_vec()),
        None,
        partition.topic().to_string(),
        Timestamp::NotAvailable,
        partition.partition_number(),
        offset,
        None,
    );
    ConsumedRecord::new(
        message,
        ReceiverOffset::settled(PartitionOffset::new(partition.clone(), offset)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Message;

    #[tokio::test]
    async fn test_transactional_records_visible_after_commit() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        let producer = broker.transactional_producer("tx");

        producer.begin_transaction().await.unwrap();
        producer
            .send(&ProducerRecord::to("out").payload("a"))
            .await
            .unwrap();
        producer
            .send_offsets_to_transaction(
                vec![PartitionOffset::new(Partition::new("in", 0), 4)],
                GroupMetadata::new("group"),
            )
            .await
            .unwrap();
        assert!(broker.records("out").is_empty());
        assert_eq!(broker.committed_offset("group", &Partition::new("in", 0)), None);

        producer.commit_transaction().await.unwrap();
        let records = broker.records("out");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload(), Some("a".as_bytes()));
        assert_eq!(broker.committed_offset("group", &Partition::new("in", 0)), Some(4));
    }

    #[tokio::test]
    async fn test_consumer_resumes_from_committed_offset() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 2);
        for i in 0..4 {
            broker.produce("events", 0, format!("m{i}"));
        }
        broker
            .consumer("group")
            .commit(vec![PartitionOffset::new(Partition::new("events", 0), 2)])
            .await
            .unwrap();

        let consumer = broker.subscribe(
            "group",
            Subscription::Pattern("^ev.*".to_string()),
            OffsetReset::Earliest,
        );
        let batch = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<_> = batch.iter().map(Message::offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(consumer.position(&Partition::new("events", 0)), Some(4));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_produce() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1);
        let consumer = broker.subscribe(
            "group",
            Subscription::Topics(vec!["events".to_string()]),
            OffsetReset::Latest,
        );
        assert!(consumer
            .poll(10, Duration::from_millis(5))
            .await
            .unwrap()
            .is_empty());

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.produce("events", 0, "late");
        });
        let batch = consumer.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
