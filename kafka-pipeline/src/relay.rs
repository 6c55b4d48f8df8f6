//! Relay - Copies records from a subscription to an output topic
//!
//! The consume-transform-produce loop behind the `kafka-relay` binary. In the
//! at-least-once and at-most-once modes records fan out over a `PartitionRouter`
//! and each lane forwards its records one at a time, so output order follows input
//! order per partition. In exactly-once mode every poll batch is forwarded inside
//! one transaction that also commits the batch's offsets.

use std::fmt;
use std::future::{ready, Future};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use tracing::{error, info, warn};

use crate::partition_router::{shutdown_workers, PartitionRouter, PartitionRouterConfig};
use crate::partition_worker::RecordProcessor;
use crate::receiver::{ConsumedRecord, Receiver};
use crate::sender::{Sender, SenderResult};
use crate::transaction::{TransactionCoordinator, TransactionState};
use crate::types::{OutboundRecord, ProducerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayMode {
    #[default]
    AtLeastOnce,
    AtMostOnce,
    ExactlyOnce,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::AtLeastOnce => "at-least-once",
            RelayMode::AtMostOnce => "at-most-once",
            RelayMode::ExactlyOnce => "exactly-once",
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The output copy of a consumed record: same key, payload and headers
pub fn forward(record: &ConsumedRecord, output_topic: &str) -> ProducerRecord {
    let message = record.message();
    let mut forwarded = ProducerRecord::to(output_topic);
    if let Some(key) = record.key() {
        forwarded = forwarded.key(key);
    }
    if let Some(payload) = record.payload() {
        forwarded = forwarded.payload(payload);
    }
    if let Some(headers) = rdkafka::Message::headers(message) {
        forwarded = forwarded.headers(headers.clone());
    }
    forwarded
}

/// Lane processor that sends each record to the output topic and waits for the
/// broker before the lane moves on
struct ForwardProcessor {
    sender: Arc<Sender>,
    output_topic: String,
}

#[async_trait]
impl RecordProcessor for ForwardProcessor {
    async fn process(&self, record: &ConsumedRecord) -> Result<()> {
        let outbound = OutboundRecord::new(forward(record, &self.output_topic), record.offset());
        let mut results = self.sender.send(stream::once(ready(outbound)));

        match results.next().await {
            Some(Ok(SenderResult { result: Ok(_), .. })) => Ok(()),
            Some(Ok(SenderResult {
                result: Err(error), ..
            })) => Err(error).with_context(|| format!("Failed to forward {}", record.partition())),
            Some(Err(error)) => {
                Err(error).with_context(|| format!("Failed to forward {}", record.partition()))
            }
            None => Err(anyhow!("Send stream ended without a result")),
        }
    }
}

pub struct Relay {
    receiver: Receiver,
    sender: Arc<Sender>,
    output_topic: String,
    mode: RelayMode,
    router_config: PartitionRouterConfig,
}

impl Relay {
    pub fn new(
        receiver: Receiver,
        sender: Sender,
        output_topic: impl Into<String>,
        mode: RelayMode,
    ) -> Self {
        Self {
            receiver,
            sender: Arc::new(sender),
            output_topic: output_topic.into(),
            mode,
            router_config: PartitionRouterConfig::default(),
        }
    }

    pub fn with_router_config(mut self, config: PartitionRouterConfig) -> Self {
        self.router_config = config;
        self
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Relay until the input ends, a fatal error occurs, or `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(mode = %self.mode, output_topic = %self.output_topic, "Starting relay");
        match self.mode {
            RelayMode::AtLeastOnce | RelayMode::AtMostOnce => self.run_routed(shutdown).await,
            RelayMode::ExactlyOnce => self.run_transactional(shutdown).await,
        }
    }

    async fn run_routed<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let processor = Arc::new(ForwardProcessor {
            sender: self.sender.clone(),
            output_topic: self.output_topic.clone(),
        });
        let router = PartitionRouter::new(processor, self.router_config.clone());

        let mut records = match self.mode {
            RelayMode::AtMostOnce => self.receiver.receive_at_most_once(),
            _ => self.receiver.receive(),
        };

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            result = router.run(&mut records) => result,
            () = &mut shutdown => {
                info!("Shutdown requested, draining partition workers");
                Ok(())
            }
        };

        // Lanes acknowledge what they finish before the final commit runs
        shutdown_workers(router.shutdown_all()).await;
        records.shutdown().await;

        if let Err(e) = self.sender.close().await {
            warn!(error = ?e, "Sender did not flush cleanly");
        }
        outcome
    }

    async fn run_transactional<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let coordinator = self
            .sender
            .transaction_coordinator()
            .ok_or_else(|| anyhow!("exactly-once relay requires a transactional producer"))?;
        let mut batches = self.receiver.receive_exactly_once(coordinator.clone());

        tokio::pin!(shutdown);
        loop {
            let batch = tokio::select! {
                batch = batches.next() => batch,
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping relay");
                    break;
                }
            };

            match batch {
                Some(Ok(records)) => {
                    relay_batch(&self.sender, &coordinator, &self.output_topic, records).await?;
                }
                Some(Err(e)) => return Err(e).context("Exactly-once receive failed"),
                None => break,
            }
        }

        if coordinator.state().is_open() {
            coordinator
                .abort()
                .await
                .context("Failed to abort transaction on shutdown")?;
        }
        batches.shutdown().await;
        Ok(())
    }
}

/// Forward one batch inside the transaction the receiver opened for it.
///
/// A failed send aborts, and the batch is received again. A failed commit has
/// already aborted. Only errors that leave the transaction state unknown are
/// returned.
async fn relay_batch(
    sender: &Sender,
    coordinator: &TransactionCoordinator,
    output_topic: &str,
    records: Vec<ConsumedRecord>,
) -> Result<()> {
    let count = records.len();
    let outbound: Vec<_> = records
        .iter()
        .map(|record| OutboundRecord::new(forward(record, output_topic), record.offset()))
        .collect();

    let mut results = sender.send(stream::iter(outbound));
    let mut failed = false;
    while let Some(result) = results.next().await {
        match result {
            Ok(SenderResult { result: Ok(_), .. }) => {}
            Ok(SenderResult {
                correlation,
                result: Err(e),
            }) => {
                error!(offset = correlation, error = ?e, "Failed to forward record in transaction");
                failed = true;
            }
            Err(e) => {
                error!(error = ?e, "Transactional send failed");
                failed = true;
            }
        }
    }

    if failed {
        coordinator
            .abort()
            .await
            .context("Failed to abort transaction after send failure")?;
        return Ok(());
    }

    match coordinator.commit().await {
        Ok(()) => {
            info!(records = count, "Relayed batch");
            Ok(())
        }
        Err(e) if coordinator.state() == TransactionState::Idle => {
            warn!(error = ?e, "Transaction commit failed, batch will be received again");
            Ok(())
        }
        Err(e) => Err(e).context("Transaction commit left the coordinator in an unknown state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::consumed_record;
    use crate::types::Partition;
    use rdkafka::message::{Header, Headers, OwnedHeaders};

    #[test]
    fn test_forward_copies_payload() {
        let record = consumed_record(&Partition::new("in", 3), 7, "hello");
        let forwarded = forward(&record, "out");

        assert_eq!(forwarded.topic, "out");
        assert_eq!(forwarded.payload.as_deref(), Some("hello".as_bytes()));
        assert_eq!(forwarded.key, None);
        assert_eq!(forwarded.partition, None);
        assert!(forwarded.headers.is_none());
    }

    #[test]
    fn test_forward_copies_headers() {
        let headers = OwnedHeaders::new().insert(Header {
            key: "trace",
            value: Some("abc"),
        });
        let message = rdkafka::message::OwnedMessage::new(
            Some(b"v".to_vec()),
            Some(b"k".to_vec()),
            "in".to_string(),
            rdkafka::Timestamp::NotAvailable,
            0,
            1,
            Some(headers),
        );
        let record = ConsumedRecord::new(
            message,
            crate::receiver::ReceiverOffset::settled(crate::types::PartitionOffset::new(
                Partition::new("in", 0),
                1,
            )),
        );

        let forwarded = forward(&record, "out");
        assert_eq!(forwarded.key.as_deref(), Some("k".as_bytes()));
        assert_eq!(forwarded.headers.map(|h| h.count()), Some(1));
    }
}
