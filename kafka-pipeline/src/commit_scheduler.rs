//! Commit Scheduler - Turns acknowledged offsets into broker commits
//!
//! One scheduler task runs per receiver and owns every commit call, so commits for a
//! partition never overlap. Three triggers feed it:
//!
//! - the periodic interval tick, which cuts whatever is committable;
//! - batches cut synchronously by `CommitHandle::acknowledge` once the pending count
//!   reaches the configured batch size;
//! - manual commit requests from `ReceiverOffset::commit`.
//!
//! A failed commit puts its offsets back into the ledger for the next trigger and is
//! published as a non-fatal warning. Once a partition has failed
//! `max_commit_attempts` times in a row the scheduler reports a fatal error to the
//! receive stream and stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ConsumerClient;
use crate::error::{LedgerError, ReceiverError};
use crate::metrics_consts::{COMMITS_SKIPPED_TRANSACTIONAL, COMMITS_TOTAL};
use crate::offset_ledger::{CommitBatch, OffsetLedger};
use crate::types::{Partition, PartitionOffset};

enum CommitRequest {
    Batch(CommitBatch),
    Manual {
        partition: Partition,
        reply: oneshot::Sender<Result<(), ReceiverError>>,
    },
}

/// Acknowledgment side of the scheduler, shared by every offset handle of a receiver
#[derive(Clone)]
pub struct CommitHandle {
    ledger: Arc<OffsetLedger>,
    requests: mpsc::UnboundedSender<CommitRequest>,
    batch_size: usize,
}

impl CommitHandle {
    pub fn acknowledge(&self, offset: &PartitionOffset) {
        let Some(pending) = self.ledger.acknowledge(offset) else {
            return;
        };
        if self.batch_size == 0 || pending < self.batch_size {
            return;
        }

        match self.ledger.cut_batch() {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => {
                if let Err(mpsc::error::SendError(CommitRequest::Batch(batch))) =
                    self.requests.send(CommitRequest::Batch(batch))
                {
                    // Scheduler is gone, keep the offsets for whoever commits next
                    self.ledger.restore_batch(batch);
                }
            }
            Err(LedgerError::TransactionInProgress) => {
                metrics::counter!(COMMITS_SKIPPED_TRANSACTIONAL, "trigger" => "batch").increment(1);
            }
        }
    }

    /// Commit the committable offsets of `partition` and wait for the broker
    pub async fn commit(&self, partition: &Partition) -> Result<(), ReceiverError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(CommitRequest::Manual {
                partition: partition.clone(),
                reply,
            })
            .map_err(|_| ReceiverError::Closed)?;
        response.await.map_err(|_| ReceiverError::Closed)?
    }
}

pub struct CommitScheduler {
    ledger: Arc<OffsetLedger>,
    consumer: Arc<dyn ConsumerClient>,
    requests: mpsc::UnboundedReceiver<CommitRequest>,
    commit_interval: Duration,
    max_commit_attempts: u32,
    failure: Option<oneshot::Sender<ReceiverError>>,
    warnings: broadcast::Sender<ReceiverError>,
}

impl CommitScheduler {
    /// Create a scheduler and the handle that feeds it.
    ///
    /// `failure` receives the error that ends the receive stream if the commit retry
    /// budget runs out. Commit failures below the budget are sent to `warnings`.
    pub fn new(
        ledger: Arc<OffsetLedger>,
        consumer: Arc<dyn ConsumerClient>,
        commit_interval: Duration,
        commit_batch_size: usize,
        max_commit_attempts: u32,
        failure: oneshot::Sender<ReceiverError>,
        warnings: broadcast::Sender<ReceiverError>,
    ) -> (Self, CommitHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CommitHandle {
            ledger: ledger.clone(),
            requests: tx,
            batch_size: commit_batch_size,
        };
        let scheduler = Self {
            ledger,
            consumer,
            requests: rx,
            commit_interval,
            max_commit_attempts: max_commit_attempts.max(1),
            failure: Some(failure),
            warnings,
        };
        (scheduler, handle)
    }

    /// Run until `shutdown` is cancelled, then make a final best-effort commit.
    ///
    /// If the retry budget runs out, `shutdown` is cancelled from here so the poll
    /// task stops too.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = (!self.commit_interval.is_zero()).then(|| {
            let mut ticker = interval_at(
                Instant::now() + self.commit_interval,
                self.commit_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(
            commit_interval_ms = self.commit_interval.as_millis() as u64,
            max_commit_attempts = self.max_commit_attempts,
            "Starting commit scheduler"
        );

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,

                request = self.requests.recv() => match request {
                    Some(CommitRequest::Batch(batch)) => self.commit(batch, "batch").await,
                    Some(CommitRequest::Manual { partition, reply }) => {
                        self.manual_commit(&partition, reply).await
                    }
                    None => break,
                },

                _ = next_tick(&mut ticker) => match self.ledger.cut_batch() {
                    Ok(batch) => self.commit(batch, "interval").await,
                    Err(LedgerError::TransactionInProgress) => {
                        debug!("Skipping interval commit while a transaction owns the offsets");
                        metrics::counter!(COMMITS_SKIPPED_TRANSACTIONAL, "trigger" => "interval")
                            .increment(1);
                        Ok(())
                    }
                },
            };

            if let Err(exhausted) = outcome {
                error!(error = ?exhausted, "Offset commit retry budget exhausted");
                if let Some(failure) = self.failure.take() {
                    if failure.send(exhausted).is_err() {
                        debug!("Receive stream already dropped");
                    }
                }
                shutdown.cancel();
                return;
            }
        }

        self.final_commit().await;
        info!("Commit scheduler stopped");
    }

    async fn manual_commit(
        &mut self,
        partition: &Partition,
        reply: oneshot::Sender<Result<(), ReceiverError>>,
    ) -> Result<(), ReceiverError> {
        let batch = match self.ledger.cut_partition(partition) {
            Ok(batch) => batch,
            Err(LedgerError::TransactionInProgress) => {
                if reply.send(Err(ReceiverError::TransactionBound)).is_err() {
                    debug!("Manual commit caller went away");
                }
                return Ok(());
            }
        };

        let (answer, outcome) = match self.try_commit(batch, "manual").await {
            Ok(()) => (Ok(()), Ok(())),
            Err(CommitFailure::Retriable(error)) => (Err(ReceiverError::Commit(error)), Ok(())),
            Err(CommitFailure::Exhausted(error)) => (Err(error.clone()), Err(error)),
        };
        if reply.send(answer).is_err() {
            debug!("Manual commit caller went away");
        }
        outcome
    }

    /// Commit a batch from an automatic trigger. Only an exhausted retry budget is
    /// an error here, other failures wait for the next trigger.
    async fn commit(
        &mut self,
        batch: CommitBatch,
        trigger: &'static str,
    ) -> Result<(), ReceiverError> {
        match self.try_commit(batch, trigger).await {
            Ok(()) | Err(CommitFailure::Retriable(_)) => Ok(()),
            Err(CommitFailure::Exhausted(error)) => Err(error),
        }
    }

    async fn try_commit(
        &mut self,
        batch: CommitBatch,
        trigger: &'static str,
    ) -> Result<(), CommitFailure> {
        let batch = self.ledger.retain_uncommitted(batch);
        if batch.is_empty() {
            return Ok(());
        }

        let offsets = batch.commit_offsets();
        match self.consumer.commit(offsets.clone()).await {
            Ok(()) => {
                self.ledger.complete_batch(&batch);
                metrics::counter!(COMMITS_TOTAL, "trigger" => trigger, "status" => "success")
                    .increment(1);
                debug!(
                    trigger = trigger,
                    partitions = offsets.len(),
                    acknowledged = batch.len(),
                    "Committed offsets"
                );
                Ok(())
            }
            Err(error) => {
                metrics::counter!(COMMITS_TOTAL, "trigger" => trigger, "status" => "error")
                    .increment(1);
                let worst = self.ledger.record_failure(&batch);
                self.ledger.restore_batch(batch);

                match worst {
                    Some((partition, attempts)) if attempts >= self.max_commit_attempts => {
                        Err(CommitFailure::Exhausted(ReceiverError::CommitRetriesExhausted {
                            partition,
                            attempts,
                            error,
                        }))
                    }
                    worst => {
                        warn!(
                            trigger = trigger,
                            attempts = worst.map(|(_, attempts)| attempts).unwrap_or_default(),
                            error = %error,
                            "Offset commit failed, offsets kept for the next trigger"
                        );
                        if self.warnings.send(ReceiverError::Commit(error.clone())).is_err() {
                            debug!("No subscribers for commit warnings");
                        }
                        Err(CommitFailure::Retriable(error))
                    }
                }
            }
        }
    }

    async fn final_commit(&mut self) {
        // Batches cut after the last loop iteration are still queued
        while let Ok(request) = self.requests.try_recv() {
            match request {
                CommitRequest::Batch(batch) => self.ledger.restore_batch(batch),
                CommitRequest::Manual { reply, .. } => {
                    if reply.send(Err(ReceiverError::Closed)).is_err() {
                        debug!("Manual commit caller went away");
                    }
                }
            }
        }

        let batch = match self.ledger.cut_batch() {
            Ok(batch) => batch,
            Err(LedgerError::TransactionInProgress) => return,
        };
        if batch.is_empty() {
            return;
        }

        info!(
            acknowledged = batch.len(),
            "Committing acknowledged offsets before shutdown"
        );
        if let Err(failure) = self.try_commit(batch, "shutdown").await {
            warn!("Final offset commit failed: {}", failure.into_error());
        }
    }
}

enum CommitFailure {
    Retriable(crate::error::BrokerError),
    Exhausted(ReceiverError),
}

impl CommitFailure {
    fn into_error(self) -> ReceiverError {
        match self {
            CommitFailure::Retriable(error) => ReceiverError::Commit(error),
            CommitFailure::Exhausted(error) => error,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
