//! Partition Worker - Dedicated lane for processing records of a single partition
//!
//! Each partition gets its own worker with a bounded channel, ensuring:
//! 1. Ordering is preserved within each partition
//! 2. Parallelism is achieved across partitions
//! 3. Backpressure is applied when processing falls behind

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::receiver::ConsumedRecord;
use crate::types::Partition;

/// Application processing applied to every record of a lane, in offset order
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &ConsumedRecord) -> Result<()>;
}

/// Configuration for partition workers
#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Size of the channel buffer per partition
    pub channel_buffer_size: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 100,
        }
    }
}

/// A worker that processes records for a single partition
pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<ConsumedRecord>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Create a worker and spawn its loop on `runtime`
    pub fn new<P>(
        partition: Partition,
        processor: Arc<P>,
        config: &PartitionWorkerConfig,
        runtime: &Handle,
    ) -> Self
    where
        P: RecordProcessor + ?Sized + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let partition_clone = partition.clone();

        let handle = runtime.spawn(async move {
            Self::run_worker(partition_clone, receiver, processor).await;
        });

        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// Send a record to this worker for processing
    /// Awaits until channel has capacity. Returns error only if channel is closed (receiver dropped)
    pub async fn send(
        &self,
        record: ConsumedRecord,
    ) -> Result<(), mpsc::error::SendError<ConsumedRecord>> {
        self.sender.send(record).await
    }

    /// Get a clone of the sender for use outside of DashMap guards
    pub fn sender(&self) -> mpsc::Sender<ConsumedRecord> {
        self.sender.clone()
    }

    /// Get the current capacity of the channel
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn has_capacity(&self) -> bool {
        self.sender.capacity() > 0
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Shutdown the worker once it has drained its queue
    pub async fn shutdown(mut self) {
        // Drop the sender to signal the worker to stop
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => {
                    debug!(
                        "Partition worker for {} shut down gracefully",
                        self.partition
                    );
                }
                Err(e) => {
                    warn!(
                        "Partition worker for {} panicked during shutdown: {e:#}",
                        self.partition
                    );
                }
            }
        }
    }

    async fn run_worker<P>(
        partition: Partition,
        mut receiver: mpsc::Receiver<ConsumedRecord>,
        processor: Arc<P>,
    ) where
        P: RecordProcessor + ?Sized + 'static,
    {
        info!("Starting partition worker for {}", partition);
        let mut last_offset: Option<i64> = None;

        while let Some(record) = receiver.recv().await {
            let offset = record.offset();
            if last_offset.is_some_and(|last| offset <= last) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    last_offset = ?last_offset,
                    "Record routed out of order"
                );
            }
            last_offset = Some(offset);

            match processor.process(&record).await {
                Ok(()) => {
                    record.acknowledge();
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = offset,
                        "Record processed"
                    );
                }
                Err(e) => {
                    // Left unacknowledged, the committed offset stays behind this record
                    error!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = offset,
                        error = %e,
                        error_chain = ?e,
                        "Error processing record - offset not acknowledged"
                    );
                }
            }
        }

        info!("Partition worker for {} shutting down", partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::consumed_record;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct RecordingProcessor {
        offsets: Mutex<Vec<i64>>,
        delay_ms: u64,
    }

    #[async_trait]
    impl RecordProcessor for RecordingProcessor {
        async fn process(&self, record: &ConsumedRecord) -> Result<()> {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.offsets.lock().unwrap().push(record.offset());
            Ok(())
        }
    }

    struct FailingProcessor {
        calls: AtomicUsize,
        max_failures: usize,
    }

    #[async_trait]
    impl RecordProcessor for FailingProcessor {
        async fn process(&self, _record: &ConsumedRecord) -> Result<()> {
            let count = self.calls.fetch_add(1, Ordering::SeqCst);
            if count < self.max_failures {
                Err(anyhow::anyhow!("Simulated processor error {}", count + 1))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_worker_processes_in_order() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(RecordingProcessor::default());
        let worker = PartitionWorker::new(
            partition.clone(),
            processor.clone(),
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        for offset in 0..10 {
            worker
                .send(consumed_record(&partition, offset, "payload"))
                .await
                .unwrap();
        }
        worker.shutdown().await;

        assert_eq!(*processor.offsets.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_worker_continues_after_processor_errors() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(FailingProcessor {
            calls: AtomicUsize::new(0),
            max_failures: 3,
        });
        let worker = PartitionWorker::new(
            partition.clone(),
            processor.clone(),
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        );

        for offset in 0..5 {
            worker
                .send(consumed_record(&partition, offset, "payload"))
                .await
                .unwrap();
        }
        worker.shutdown().await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_worker_backpressure() {
        let partition = Partition::new("test-topic", 0);
        let processor = Arc::new(RecordingProcessor {
            offsets: Mutex::new(Vec::new()),
            delay_ms: 100,
        });
        let config = PartitionWorkerConfig {
            channel_buffer_size: 2,
        };
        let worker = PartitionWorker::new(
            partition.clone(),
            processor.clone(),
            &config,
            &Handle::current(),
        );

        for offset in 0..2 {
            worker
                .send(consumed_record(&partition, offset, "payload"))
                .await
                .unwrap();
        }

        assert!(!worker.has_capacity() || worker.capacity() <= 1);
        worker.shutdown().await;
    }
}
