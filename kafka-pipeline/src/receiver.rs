//! Receiver - Poll loop and acknowledgment handles for consumed records
//!
//! The poll loop runs on its own task, on the runtime given by
//! `ReceiverOptions::poll_runtime`, and never waits on application processing
//! beyond the bounded hand-off channel. Each record comes with a `ReceiverOffset`
//! that the application acknowledges once it is done with the record. The
//! receiver's commit scheduler turns acknowledgments into broker commits.
//!
//! Three delivery modes are offered:
//!
//! - `receive`: at-least-once, offsets are committed after acknowledgment;
//! - `receive_at_most_once`: each offset is committed before its record is handed out;
//! - `receive_exactly_once`: each poll batch is consumed inside a transaction.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, Stream};
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ConsumerClient;
use crate::commit_scheduler::{CommitHandle, CommitScheduler};
use crate::error::{BrokerError, ReceiverError};
use crate::metrics_consts::{
    RECEIVER_POLL_ERRORS, RECEIVER_RECORDS_DELIVERED, RECEIVER_STALE_RECORDS_DROPPED,
};
use crate::offset_ledger::OffsetLedger;
use crate::transaction::{TransactionCoordinator, TransactionState};
use crate::types::{Partition, PartitionOffset};

const COMMIT_WARNING_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Periodic commit trigger, zero disables it
    pub commit_interval: Duration,
    /// Pending acknowledgment count that triggers a commit, zero disables it
    pub commit_batch_size: usize,
    /// Consecutive commit failures of a partition before the stream fails
    pub max_commit_attempts: u32,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    /// Records buffered between the poll loop and the application
    pub receive_buffer: usize,
    /// Base delay after a transient poll error
    pub poll_error_backoff: Duration,
    /// Runtime the poll and commit tasks are spawned on, defaults to the caller's
    pub poll_runtime: Option<Handle>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_secs(5),
            commit_batch_size: 0,
            max_commit_attempts: 5,
            max_poll_records: 500,
            poll_timeout: Duration::from_secs(1),
            receive_buffer: 1024,
            poll_error_backoff: Duration::from_millis(100),
            poll_runtime: None,
        }
    }
}

impl ReceiverOptions {
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_commit_batch_size(mut self, batch_size: usize) -> Self {
        self.commit_batch_size = batch_size;
        self
    }

    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_receive_buffer(mut self, receive_buffer: usize) -> Self {
        self.receive_buffer = receive_buffer;
        self
    }

    pub fn with_poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.poll_error_backoff = backoff;
        self
    }

    pub fn with_poll_runtime(mut self, runtime: Handle) -> Self {
        self.poll_runtime = Some(runtime);
        self
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.poll_runtime {
            Some(runtime) => runtime.spawn(future),
            None => tokio::spawn(future),
        }
    }
}

/// Acknowledgment handle of one consumed record
#[derive(Clone)]
pub struct ReceiverOffset {
    offset: PartitionOffset,
    commits: Option<CommitHandle>,
}

impl ReceiverOffset {
    pub(crate) fn tracked(offset: PartitionOffset, commits: CommitHandle) -> Self {
        Self {
            offset,
            commits: Some(commits),
        }
    }

    /// A handle whose offset is already taken care of elsewhere
    pub(crate) fn settled(offset: PartitionOffset) -> Self {
        Self {
            offset,
            commits: None,
        }
    }

    pub fn partition_offset(&self) -> &PartitionOffset {
        &self.offset
    }

    pub fn partition(&self) -> &Partition {
        self.offset.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset.offset()
    }

    /// Mark the record safe to commit
    pub fn acknowledge(&self) {
        if let Some(commits) = &self.commits {
            commits.acknowledge(&self.offset);
        }
    }

    /// Acknowledge, then commit this and every earlier acknowledged offset of the
    /// partition, waiting for the broker.
    ///
    /// Offsets behind a record that is still unacknowledged stay pending.
    pub async fn commit(&self) -> Result<(), ReceiverError> {
        match &self.commits {
            Some(commits) => {
                commits.acknowledge(&self.offset);
                commits.commit(self.offset.partition()).await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReceiverOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverOffset")
            .field("offset", &self.offset)
            .field("tracked", &self.commits.is_some())
            .finish()
    }
}

/// A record handed to the application together with its acknowledgment handle
#[derive(Debug)]
pub struct ConsumedRecord {
    message: OwnedMessage,
    offset: ReceiverOffset,
}

impl ConsumedRecord {
    pub(crate) fn new(message: OwnedMessage, offset: ReceiverOffset) -> Self {
        Self { message, offset }
    }

    pub fn message(&self) -> &OwnedMessage {
        &self.message
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.message.key()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }

    pub fn receiver_offset(&self) -> &ReceiverOffset {
        &self.offset
    }

    pub fn partition(&self) -> &Partition {
        self.offset.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset.offset()
    }

    pub fn acknowledge(&self) {
        self.offset.acknowledge();
    }

    pub fn into_parts(self) -> (OwnedMessage, ReceiverOffset) {
        (self.message, self.offset)
    }
}

/// Channel item tagged with the ledger generation it was registered under
struct Stamped<T> {
    generation: u64,
    item: Result<T, ReceiverError>,
}

pub struct Receiver {
    consumer: Arc<dyn ConsumerClient>,
    options: ReceiverOptions,
    ledger: Arc<OffsetLedger>,
}

impl Receiver {
    pub fn new(consumer: Arc<dyn ConsumerClient>, options: ReceiverOptions) -> Self {
        Self {
            consumer,
            options,
            ledger: Arc::new(OffsetLedger::new()),
        }
    }

    pub fn ledger(&self) -> Arc<OffsetLedger> {
        self.ledger.clone()
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    /// Commit this receiver's offsets through `coordinator` transactions instead of
    /// the commit scheduler.
    pub fn bind_transactions(&self, coordinator: &TransactionCoordinator) {
        coordinator.bind(self.ledger.clone(), self.consumer.clone());
    }

    /// At-least-once delivery. Offsets are committed once acknowledged.
    ///
    /// Must be called from within a tokio runtime unless `poll_runtime` is set.
    pub fn receive(self) -> ReceiverStream<ConsumedRecord> {
        let shutdown = CancellationToken::new();
        let (failure_tx, failure_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.options.receive_buffer.max(1));
        let (warnings, _) = broadcast::channel(COMMIT_WARNING_CAPACITY);

        let (scheduler, commits) = CommitScheduler::new(
            self.ledger.clone(),
            self.consumer.clone(),
            self.options.commit_interval,
            self.options.commit_batch_size,
            self.options.max_commit_attempts,
            failure_tx,
            warnings.clone(),
        );
        let tasks = vec![
            self.options.spawn(scheduler.run(shutdown.clone())),
            self.options.spawn(poll_loop(
                self.consumer.clone(),
                self.ledger.clone(),
                commits,
                self.options.clone(),
                tx,
                shutdown.clone(),
            )),
        ];

        ReceiverStream::new(rx, Some(failure_rx), self.ledger, shutdown, tasks)
            .with_commit_warnings(warnings)
    }

    /// At-most-once delivery. Each record's offset is committed before the record is
    /// handed out, so a crash loses the record instead of redelivering it.
    pub fn receive_at_most_once(self) -> ReceiverStream<ConsumedRecord> {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.options.receive_buffer.max(1));

        let task = self.options.spawn(at_most_once_loop(
            self.consumer.clone(),
            self.options.clone(),
            tx,
            shutdown.clone(),
        ));

        ReceiverStream::new(rx, None, self.ledger, shutdown, vec![task])
    }

    /// Exactly-once delivery. Each poll batch opens a transaction on `coordinator`
    /// and is handed out whole, already acknowledged. The next batch is polled only
    /// after the application has committed or aborted that transaction. Offsets are
    /// committed by the transaction.
    pub fn receive_exactly_once(
        self,
        coordinator: Arc<TransactionCoordinator>,
    ) -> ReceiverStream<Vec<ConsumedRecord>> {
        self.bind_transactions(&coordinator);

        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);

        let task = self.options.spawn(exactly_once_loop(
            self.consumer.clone(),
            self.ledger.clone(),
            coordinator,
            self.options.clone(),
            tx,
            shutdown.clone(),
        ));

        ReceiverStream::new(rx, None, self.ledger, shutdown, vec![task])
    }
}

/// Poll one batch, or `None` once shutdown is requested
async fn poll_batch(
    consumer: &dyn ConsumerClient,
    options: &ReceiverOptions,
    shutdown: &CancellationToken,
) -> Option<Result<Vec<OwnedMessage>, BrokerError>> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        polled = consumer.poll(options.max_poll_records, options.poll_timeout) => Some(polled),
    }
}

/// Classify a poll error. Returns the error if the stream must end.
async fn handle_poll_error(
    error: BrokerError,
    consecutive: &mut u32,
    options: &ReceiverOptions,
    shutdown: &CancellationToken,
) -> Option<ReceiverError> {
    if error.is_fatal() {
        error!(error = ?error, "Fatal Kafka consumer error");
        metrics::counter!(RECEIVER_POLL_ERRORS, "level" => "fatal").increment(1);
        return Some(ReceiverError::Fatal(error));
    }

    *consecutive += 1;
    warn!(consecutive = *consecutive, error = ?error, "Kafka consumer error");
    metrics::counter!(RECEIVER_POLL_ERRORS, "level" => "warn").increment(1);

    let backoff = options.poll_error_backoff * (*consecutive).min(10);
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(backoff) => {}
    }
    None
}

fn clear_revoked(consumer: &dyn ConsumerClient, ledger: &OffsetLedger) {
    for partition in consumer.take_revoked() {
        ledger.clear_partition(&partition);
    }
}

/// Hand an item to the stream. Returns false once nobody is listening.
async fn hand_off<T>(
    tx: &mpsc::Sender<Stamped<T>>,
    generation: u64,
    item: Result<T, ReceiverError>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = tx.send(Stamped { generation, item }) => sent.is_ok(),
    }
}

async fn poll_loop(
    consumer: Arc<dyn ConsumerClient>,
    ledger: Arc<OffsetLedger>,
    commits: CommitHandle,
    options: ReceiverOptions,
    tx: mpsc::Sender<Stamped<ConsumedRecord>>,
    shutdown: CancellationToken,
) {
    info!("Starting Kafka receive loop");
    let mut consecutive_errors = 0;

    'poll: loop {
        let generation = ledger.generation();
        let Some(polled) = poll_batch(consumer.as_ref(), &options, &shutdown).await else {
            break;
        };
        clear_revoked(consumer.as_ref(), &ledger);

        let messages = match polled {
            Ok(messages) => {
                consecutive_errors = 0;
                messages
            }
            Err(e) => {
                if let Some(fatal) =
                    handle_poll_error(e, &mut consecutive_errors, &options, &shutdown).await
                {
                    if !hand_off(&tx, generation, Err(fatal), &shutdown).await {
                        debug!("Receive stream dropped before fatal error was reported");
                    }
                    break;
                }
                continue;
            }
        };
        if messages.is_empty() {
            continue;
        }

        let offsets: Vec<PartitionOffset> =
            messages.iter().map(PartitionOffset::of_message).collect();
        if !ledger.register(&offsets, generation) {
            // Rolled back while polling, the consumer has been rewound past these
            metrics::counter!(RECEIVER_STALE_RECORDS_DROPPED).increment(messages.len() as u64);
            continue;
        }

        let count = messages.len();
        for (message, offset) in messages.into_iter().zip(offsets) {
            let record =
                ConsumedRecord::new(message, ReceiverOffset::tracked(offset, commits.clone()));
            if !hand_off(&tx, generation, Ok(record), &shutdown).await {
                break 'poll;
            }
        }
        metrics::counter!(RECEIVER_RECORDS_DELIVERED).increment(count as u64);
    }

    info!("Kafka receive loop stopped");
}

async fn at_most_once_loop(
    consumer: Arc<dyn ConsumerClient>,
    options: ReceiverOptions,
    tx: mpsc::Sender<Stamped<ConsumedRecord>>,
    shutdown: CancellationToken,
) {
    info!("Starting at-most-once Kafka receive loop");
    let mut consecutive_errors = 0;

    'poll: loop {
        let Some(polled) = poll_batch(consumer.as_ref(), &options, &shutdown).await else {
            break;
        };
        let messages = match polled {
            Ok(messages) => {
                consecutive_errors = 0;
                messages
            }
            Err(e) => {
                if let Some(fatal) =
                    handle_poll_error(e, &mut consecutive_errors, &options, &shutdown).await
                {
                    if !hand_off(&tx, 0, Err(fatal), &shutdown).await {
                        debug!("Receive stream dropped before fatal error was reported");
                    }
                    break;
                }
                continue;
            }
        };

        for message in messages {
            let offset = PartitionOffset::of_message(&message);
            let next = PartitionOffset::new(offset.partition().clone(), offset.offset() + 1);
            if let Err(e) = consumer.commit(vec![next]).await {
                error!(
                    topic = offset.topic(),
                    partition = offset.partition_number(),
                    offset = offset.offset(),
                    error = ?e,
                    "At-most-once commit failed"
                );
                if !hand_off(&tx, 0, Err(ReceiverError::Commit(e)), &shutdown).await {
                    debug!("Receive stream dropped before commit error was reported");
                }
                break 'poll;
            }

            let record = ConsumedRecord::new(message, ReceiverOffset::settled(offset));
            if !hand_off(&tx, 0, Ok(record), &shutdown).await {
                break 'poll;
            }
            metrics::counter!(RECEIVER_RECORDS_DELIVERED).increment(1);
        }
    }

    info!("At-most-once Kafka receive loop stopped");
}

async fn exactly_once_loop(
    consumer: Arc<dyn ConsumerClient>,
    ledger: Arc<OffsetLedger>,
    coordinator: Arc<TransactionCoordinator>,
    options: ReceiverOptions,
    tx: mpsc::Sender<Stamped<Vec<ConsumedRecord>>>,
    shutdown: CancellationToken,
) {
    info!("Starting exactly-once Kafka receive loop");
    let mut states = coordinator.subscribe();
    let mut consecutive_errors = 0;

    loop {
        // Never poll while the previous batch's transaction is still open
        let idle = tokio::select! {
            _ = shutdown.cancelled() => break,
            idle = states.wait_for(|state| *state == TransactionState::Idle) => idle.is_ok(),
        };
        if !idle {
            break;
        }

        let generation = ledger.generation();
        let Some(polled) = poll_batch(consumer.as_ref(), &options, &shutdown).await else {
            break;
        };
        clear_revoked(consumer.as_ref(), &ledger);

        let messages = match polled {
            Ok(messages) => {
                consecutive_errors = 0;
                messages
            }
            Err(e) => {
                if let Some(fatal) =
                    handle_poll_error(e, &mut consecutive_errors, &options, &shutdown).await
                {
                    if !hand_off(&tx, generation, Err(fatal), &shutdown).await {
                        debug!("Receive stream dropped before fatal error was reported");
                    }
                    break;
                }
                continue;
            }
        };
        if messages.is_empty() {
            continue;
        }

        if let Err(e) = coordinator.begin().await {
            error!(error = ?e, "Failed to begin transaction for polled batch");
            if !hand_off(&tx, generation, Err(e.into()), &shutdown).await {
                debug!("Receive stream dropped before transaction error was reported");
            }
            break;
        }

        let offsets: Vec<PartitionOffset> =
            messages.iter().map(PartitionOffset::of_message).collect();
        if !ledger.register(&offsets, generation) {
            metrics::counter!(RECEIVER_STALE_RECORDS_DROPPED).increment(messages.len() as u64);
            // The transaction opened for these records has nothing in it
            if let Err(e) = coordinator.abort().await {
                warn!(error = ?e, "Failed to abort empty transaction");
            }
            continue;
        }
        for offset in &offsets {
            ledger.acknowledge(offset);
        }

        let count = messages.len();
        let batch: Vec<ConsumedRecord> = messages
            .into_iter()
            .zip(offsets)
            .map(|(message, offset)| ConsumedRecord::new(message, ReceiverOffset::settled(offset)))
            .collect();
        debug!(records = count, "Handing out transactional batch");

        if !hand_off(&tx, generation, Ok(batch), &shutdown).await {
            break;
        }
        metrics::counter!(RECEIVER_RECORDS_DELIVERED).increment(count as u64);
    }

    info!("Exactly-once Kafka receive loop stopped");
}

/// Stream of consumed records. Dropping it stops the receiver.
pub struct ReceiverStream<T> {
    records: mpsc::Receiver<Stamped<T>>,
    failure: Option<oneshot::Receiver<ReceiverError>>,
    ledger: Arc<OffsetLedger>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    warnings: broadcast::Sender<ReceiverError>,
    finished: bool,
}

impl<T> ReceiverStream<T> {
    fn new(
        records: mpsc::Receiver<Stamped<T>>,
        failure: Option<oneshot::Receiver<ReceiverError>>,
        ledger: Arc<OffsetLedger>,
        shutdown: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let (warnings, _) = broadcast::channel(COMMIT_WARNING_CAPACITY);
        Self {
            records,
            failure,
            ledger,
            shutdown,
            tasks,
            warnings,
            finished: false,
        }
    }

    fn with_commit_warnings(mut self, warnings: broadcast::Sender<ReceiverError>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Stop the receiver. Already buffered records are still returned.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Stop the receiver and wait for its poll and commit tasks to finish, including
    /// the final commit of acknowledged offsets.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Receiver task did not shut down cleanly: {e:#}");
            }
        }
    }

    /// Commit failures that left offsets pending for a later retry. Only failures
    /// after this call are seen. A stream without a commit scheduler never sends any.
    pub fn commit_warnings(&self) -> broadcast::Receiver<ReceiverError> {
        self.warnings.subscribe()
    }

    pub fn ledger(&self) -> &Arc<OffsetLedger> {
        &self.ledger
    }

    fn finish(&mut self, error: ReceiverError) -> Poll<Option<Result<T, ReceiverError>>> {
        self.finished = true;
        self.shutdown.cancel();
        Poll::Ready(Some(Err(error)))
    }
}

impl<T> Stream for ReceiverStream<T> {
    type Item = Result<T, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(failure) = this.failure.as_mut() {
            match failure.poll_unpin(cx) {
                Poll::Ready(Ok(error)) => {
                    this.failure = None;
                    return this.finish(error);
                }
                // Scheduler stopped without a failure
                Poll::Ready(Err(_)) => this.failure = None,
                Poll::Pending => {}
            }
        }

        loop {
            match this.records.poll_recv(cx) {
                Poll::Ready(Some(Stamped {
                    item: Err(error), ..
                })) => return this.finish(error),
                Poll::Ready(Some(Stamped {
                    generation,
                    item: Ok(record),
                })) => {
                    if generation != this.ledger.generation() {
                        metrics::counter!(RECEIVER_STALE_RECORDS_DROPPED).increment(1);
                        continue;
                    }
                    return Poll::Ready(Some(Ok(record)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for ReceiverStream<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
