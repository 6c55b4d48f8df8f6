//! Broker client seams.
//!
//! The pipeline never talks to the wire protocol itself. It drives a consumer and a
//! producer through these traits. `kafka` holds the rdkafka-backed implementations,
//! and `crate::test_utils` holds an in-memory broker for tests.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::message::OwnedMessage;

use crate::error::BrokerError;
use crate::types::{Partition, PartitionOffset, ProducerRecord, RecordMetadata};

pub mod kafka;

pub use kafka::{KafkaConsumerClient, KafkaProducerClient};

/// Consumer group identity handed from the consumer to a transactional producer
pub struct GroupMetadata {
    group_id: String,
    native: Option<ConsumerGroupMetadata>,
}

impl GroupMetadata {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            native: None,
        }
    }

    pub fn from_native(group_id: impl Into<String>, native: ConsumerGroupMetadata) -> Self {
        Self {
            group_id: group_id.into(),
            native: Some(native),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn native(&self) -> Option<&ConsumerGroupMetadata> {
        self.native.as_ref()
    }

    pub fn into_native(self) -> Option<ConsumerGroupMetadata> {
        self.native
    }
}

impl std::fmt::Debug for GroupMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMetadata")
            .field("group_id", &self.group_id)
            .field("native", &self.native.is_some())
            .finish()
    }
}

#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Fetch up to `max_records` records, waiting at most `timeout` for the first one.
    /// An empty batch is not an error.
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<OwnedMessage>, BrokerError>;

    /// Commit the given next-offsets-to-consume for the group
    async fn commit(&self, offsets: Vec<PartitionOffset>) -> Result<(), BrokerError>;

    /// Move the fetch position of each partition
    async fn seek(&self, offsets: Vec<PartitionOffset>) -> Result<(), BrokerError>;

    fn group_metadata(&self) -> Option<GroupMetadata>;

    /// Partitions revoked from this member since the last call
    fn take_revoked(&self) -> Vec<Partition> {
        Vec::new()
    }
}

#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn send(&self, record: &ProducerRecord) -> Result<RecordMetadata, BrokerError>;

    async fn begin_transaction(&self) -> Result<(), BrokerError>;

    async fn send_offsets_to_transaction(
        &self,
        offsets: Vec<PartitionOffset>,
        group: GroupMetadata,
    ) -> Result<(), BrokerError>;

    async fn commit_transaction(&self) -> Result<(), BrokerError>;

    async fn abort_transaction(&self) -> Result<(), BrokerError>;

    /// Wait for queued records to be delivered
    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}
