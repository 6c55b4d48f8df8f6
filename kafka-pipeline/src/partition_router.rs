//! Partition Router - Routes consumed records to partition-specific workers
//!
//! The router keeps one worker per partition. Workers are created the first time a
//! partition shows up in the stream, or ahead of time through `add_partition`, and
//! run on the router's worker runtime.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::ReceiverError;
use crate::metrics_consts::{
    PARTITION_LANE_BACKPRESSURE_TOTAL, PARTITION_LANE_BACKPRESSURE_WAIT_MS,
};
use crate::partition_worker::{PartitionWorker, PartitionWorkerConfig, RecordProcessor};
use crate::receiver::ConsumedRecord;
use crate::types::Partition;

/// Configuration for the partition router
#[derive(Debug, Clone, Default)]
pub struct PartitionRouterConfig {
    /// Configuration for individual partition workers
    pub worker_config: PartitionWorkerConfig,
    /// Runtime the workers are spawned on, defaults to the caller's
    pub worker_runtime: Option<Handle>,
}

pub struct PartitionRouter<P>
where
    P: RecordProcessor + ?Sized + 'static,
{
    workers: DashMap<Partition, PartitionWorker>,
    processor: Arc<P>,
    runtime: Handle,
    config: PartitionRouterConfig,
}

impl<P> PartitionRouter<P>
where
    P: RecordProcessor + ?Sized + 'static,
{
    /// Create a new partition router. Must be called from within a tokio runtime
    /// unless `worker_runtime` is set.
    pub fn new(processor: Arc<P>, config: PartitionRouterConfig) -> Self {
        let runtime = config
            .worker_runtime
            .clone()
            .unwrap_or_else(Handle::current);
        Self {
            workers: DashMap::new(),
            processor,
            runtime,
            config,
        }
    }

    /// Add a worker for a partition. An existing worker is reused.
    pub fn add_partition(&self, partition: Partition) {
        let key = partition.clone();
        self.workers.entry(key).or_insert_with(|| {
            info!("Creating partition worker for {}", partition);
            PartitionWorker::new(
                partition,
                self.processor.clone(),
                &self.config.worker_config,
                &self.runtime,
            )
        });
    }

    pub fn add_partitions(&self, partitions: &[Partition]) {
        for partition in partitions {
            self.add_partition(partition.clone());
        }
    }

    /// Remove a worker for a partition, returning it for async shutdown
    pub fn remove_partition(&self, partition: &Partition) -> Option<PartitionWorker> {
        let worker = self.workers.remove(partition).map(|(_, w)| w);
        if worker.is_some() {
            info!("Removed partition worker for {}", partition);
        }
        worker
    }

    /// Get the sender for a partition, releasing the DashMap guard immediately.
    ///
    /// This keeps one partition's backpressure from blocking router access for
    /// the others.
    fn partition_sender(&self, partition: &Partition) -> (mpsc::Sender<ConsumedRecord>, usize) {
        self.add_partition(partition.clone());
        match self.workers.get(partition) {
            Some(worker) => (worker.sender(), worker.capacity()),
            None => {
                // Removed between the insert and the lookup
                let worker = PartitionWorker::new(
                    partition.clone(),
                    self.processor.clone(),
                    &self.config.worker_config,
                    &self.runtime,
                );
                let sender = (worker.sender(), worker.capacity());
                self.workers.insert(partition.clone(), worker);
                sender
            }
        }
    }

    /// Route a record to the worker of its partition, waiting while that worker's
    /// queue is full.
    pub async fn route(&self, record: ConsumedRecord) -> Result<()> {
        let partition = record.partition().clone();
        let (sender, channel_capacity) = self.partition_sender(&partition);

        let send_start = if channel_capacity == 0 {
            metrics::counter!(
                PARTITION_LANE_BACKPRESSURE_TOTAL,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
            Some(Instant::now())
        } else {
            None
        };

        let result = sender.send(record).await.map_err(|_| {
            anyhow!("Failed to send record to worker for {partition}: channel closed")
        });

        if let Some(start) = send_start {
            metrics::histogram!(
                PARTITION_LANE_BACKPRESSURE_WAIT_MS,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .record(start.elapsed().as_millis() as f64);
        }

        result
    }

    /// Route every record of a receive stream until it ends, then drain all workers.
    ///
    /// A receiver error stops routing; the workers still finish what they were given.
    pub async fn run<S>(&self, mut stream: S) -> Result<()>
    where
        S: Stream<Item = Result<ConsumedRecord, ReceiverError>> + Unpin,
    {
        let mut outcome = Ok(());
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    if let Err(e) = self.route(record).await {
                        outcome = Err(e);
                        break;
                    }
                }
                Err(e) => {
                    outcome = Err(e).context("Receive stream failed");
                    break;
                }
            }
        }

        shutdown_workers(self.shutdown_all()).await;
        outcome
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn active_partitions(&self) -> Vec<Partition> {
        self.workers.iter().map(|r| r.key().clone()).collect()
    }

    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.workers.contains_key(partition)
    }

    /// Remove all workers and return them for async cleanup
    pub fn shutdown_all(&self) -> Vec<PartitionWorker> {
        info!(
            "Shutting down partition router with {} workers",
            self.workers.len()
        );

        let keys: Vec<Partition> = self.workers.iter().map(|r| r.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.workers.remove(&key).map(|(_, worker)| worker))
            .collect()
    }
}

/// Shut workers down concurrently, each after draining its queue
pub async fn shutdown_workers(workers: Vec<PartitionWorker>) {
    let shutdown_futures: Vec<_> = workers.into_iter().map(|w| w.shutdown()).collect();
    join_all(shutdown_futures).await;
}
