//! rdkafka-backed broker clients.
//!
//! librdkafka's commit, seek and transaction calls block the calling thread, so they
//! are pushed onto tokio's blocking pool. The caller's task suspends on them without
//! tying up the poll task or a runtime worker.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::OwnedMessage;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::client::{ConsumerClient, GroupMetadata, ProducerClient};
use crate::error::BrokerError;
use crate::types::{Partition, PartitionOffset, ProducerRecord, RecordMetadata, Subscription};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

fn to_topic_partition_list(offsets: &[PartitionOffset]) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    for offset in offsets {
        list.add_partition_offset(
            offset.topic(),
            offset.partition_number(),
            Offset::Offset(offset.offset()),
        )?;
    }
    Ok(list)
}

/// Consumer context that logs group rebalances and remembers revoked partitions
/// until the receiver drains them.
#[derive(Default)]
pub struct ReceiverContext {
    revoked: Mutex<Vec<Partition>>,
}

impl ReceiverContext {
    fn take_revoked(&self) -> Vec<Partition> {
        let mut revoked = self.revoked.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *revoked)
    }
}

impl ClientContext for ReceiverContext {}

impl ConsumerContext for ReceiverContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends empty revocations on every membership change
                if partitions.count() == 0 {
                    return;
                }
                info!("Partitions revoked: {}", partitions.count());
                let mut revoked = self.revoked.lock().unwrap_or_else(PoisonError::into_inner);
                revoked.extend(partitions.elements().into_iter().map(Partition::from));
            }
            Rebalance::Assign(partitions) => {
                info!("Partitions assigned: {}", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e:#}");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Offset commit callback reported failure: {e:#}"),
        }
    }
}

pub struct KafkaConsumerClient {
    consumer: Arc<StreamConsumer<ReceiverContext>>,
    group_id: String,
    timeout: Duration,
}

impl KafkaConsumerClient {
    pub fn new(config: &ClientConfig, subscription: &Subscription) -> Result<Self, BrokerError> {
        let group_id = config.get("group.id").unwrap_or_default().to_string();

        debug!("rdkafka consumer configuration: {:?}", config);
        let consumer: StreamConsumer<ReceiverContext> =
            config.create_with_context(ReceiverContext::default())?;

        // "Ping" the Kafka brokers by requesting metadata
        match consumer.fetch_metadata(None, METADATA_TIMEOUT) {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        let topics = subscription.to_topic_list();
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(group_id = %group_id, topics = ?topics, "Subscribed consumer");

        Ok(Self {
            consumer: Arc::new(consumer),
            group_id,
            timeout: Duration::from_secs(30),
        })
    }

    /// Timeout for blocking seek calls
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<OwnedMessage>, BrokerError> {
        let mut batch = Vec::with_capacity(max_records.min(1024));

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(batch),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(message)) => batch.push(message.detach()),
        }

        // Drain whatever librdkafka has already fetched, without waiting again
        while batch.len() < max_records {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => batch.push(message.detach()),
                Some(Err(e)) => {
                    // Return what we have; the error resurfaces on the next poll
                    warn!("Kafka error while draining poll batch: {e:#}");
                    break;
                }
                None => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&self, offsets: Vec<PartitionOffset>) -> Result<(), BrokerError> {
        let list = to_topic_partition_list(&offsets)?;
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync)).await??;
        Ok(())
    }

    async fn seek(&self, offsets: Vec<PartitionOffset>) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || -> Result<(), KafkaError> {
            for offset in &offsets {
                consumer.seek(
                    offset.topic(),
                    offset.partition_number(),
                    Offset::Offset(offset.offset()),
                    timeout,
                )?;
            }
            Ok(())
        })
        .await??;
        Ok(())
    }

    fn group_metadata(&self) -> Option<GroupMetadata> {
        self.consumer
            .group_metadata()
            .map(|native| GroupMetadata::from_native(&self.group_id, native))
    }

    fn take_revoked(&self) -> Vec<Partition> {
        self.consumer.context().take_revoked()
    }
}

type DeliverySender = oneshot::Sender<Result<RecordMetadata, KafkaError>>;

/// Producer context that completes one oneshot per record from librdkafka's
/// delivery report callback.
pub struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliverySender>;

    fn delivery(
        &self,
        delivery_result: &DeliveryResult<'_>,
        delivery_opaque: Self::DeliveryOpaque,
    ) {
        let result = match delivery_result {
            Ok(message) => Ok(RecordMetadata {
                partition: Partition::new(message.topic(), message.partition()),
                offset: message.offset(),
            }),
            Err((error, _)) => Err(error.clone()),
        };

        if delivery_opaque.send(result).is_err() {
            // The send future was dropped, nobody is waiting for this report
            debug!("Delivery report for cancelled send discarded");
        }
    }
}

pub struct KafkaProducerClient {
    producer: Arc<ThreadedProducer<DeliveryContext>>,
    transactional: bool,
    timeout: Duration,
}

impl KafkaProducerClient {
    /// Create the producer. If the config carries a `transactional.id`, transactions
    /// are initialised before this returns.
    pub fn new(config: &ClientConfig, transaction_timeout: Duration) -> Result<Self, BrokerError> {
        debug!("rdkafka producer configuration: {:?}", config);
        let producer: ThreadedProducer<DeliveryContext> =
            config.create_with_context(DeliveryContext)?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer.client().fetch_metadata(None, METADATA_TIMEOUT) {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        let transactional = config.get("transactional.id").is_some();
        if transactional {
            producer.init_transactions(transaction_timeout)?;
            info!("Initialised transactional producer");
        }

        Ok(Self {
            producer: Arc::new(producer),
            transactional,
            timeout: transaction_timeout,
        })
    }

    fn require_transactional(&self) -> Result<(), BrokerError> {
        if self.transactional {
            Ok(())
        } else {
            Err(BrokerError::Unsupported(
                "transactions need a transactional.id",
            ))
        }
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn send(&self, record: &ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        let (tx, rx) = oneshot::channel();

        let mut base: BaseRecord<'_, [u8], [u8], Box<DeliverySender>> =
            BaseRecord::with_opaque_to(&record.topic, Box::new(tx));
        if let Some(key) = &record.key {
            base = base.key(key.as_slice());
        }
        if let Some(payload) = &record.payload {
            base = base.payload(payload.as_slice());
        }
        if let Some(partition) = record.partition {
            base = base.partition(partition);
        }
        if let Some(headers) = &record.headers {
            base = base.headers(headers.clone());
        }

        self.producer
            .send(base)
            .map_err(|(e, _)| BrokerError::from(e))?;

        match rx.await {
            Ok(result) => result.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::Closed),
        }
    }

    async fn begin_transaction(&self) -> Result<(), BrokerError> {
        self.require_transactional()?;
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.begin_transaction()).await??;
        Ok(())
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: Vec<PartitionOffset>,
        group: GroupMetadata,
    ) -> Result<(), BrokerError> {
        self.require_transactional()?;
        let native = group.into_native().ok_or(BrokerError::Unsupported(
            "transactional offset commit needs native group metadata",
        ))?;
        let list = to_topic_partition_list(&offsets)?;
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            producer.send_offsets_to_transaction(&list, &native, timeout)
        })
        .await??;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), BrokerError> {
        self.require_transactional()?;
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.commit_transaction(timeout)).await??;
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<(), BrokerError> {
        self.require_transactional()?;
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.abort_transaction(timeout)).await??;
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout)).await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_list_carries_offsets() {
        let offsets = vec![
            PartitionOffset::new(Partition::new("events", 0), 11),
            PartitionOffset::new(Partition::new("events", 3), 42),
        ];
        let list = to_topic_partition_list(&offsets).unwrap();

        assert_eq!(list.count(), 2);
        let elem = list.find_partition("events", 3).unwrap();
        assert_eq!(elem.offset(), Offset::Offset(42));
    }

    #[test]
    fn test_receiver_context_drains_revoked() {
        let context = ReceiverContext::default();
        context
            .revoked
            .lock()
            .unwrap()
            .push(Partition::new("events", 1));

        assert_eq!(context.take_revoked(), vec![Partition::new("events", 1)]);
        assert!(context.take_revoked().is_empty());
    }
}
