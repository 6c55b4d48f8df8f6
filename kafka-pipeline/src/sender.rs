//! Sender - Bounded, concurrent dispatch of outbound records
//!
//! `Sender::send` turns a stream of `OutboundRecord<T>` into a stream of per-record
//! results. A dispatch task takes an in-flight permit before it pulls each record,
//! then hands the record to its own task, which sends and retries it while holding
//! the permit. Results therefore come back in completion order, never more than
//! `max_in_flight` records are outstanding, and one record's retries never overlap.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ProducerClient;
use crate::error::{BrokerError, SendError, TransactionError};
use crate::limiter::{InFlightLimiter, InFlightPermit};
use crate::metrics_consts::{
    SENDER_RECORDS_COMPLETED, SENDER_RECORDS_DISPATCHED, SENDER_RECORD_RETRIES,
};
use crate::transaction::TransactionCoordinator;
use crate::types::{OutboundRecord, RecordMetadata};

#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Records dispatched but not yet reported
    pub max_in_flight: usize,
    /// End the result stream at the first failed record
    pub stop_on_error: bool,
    /// Extra attempts for transient failures
    pub retries: u32,
    pub retry_backoff: Duration,
    pub transaction_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            stop_on_error: true,
            retries: 3,
            retry_backoff: Duration::from_millis(100),
            transaction_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl SenderOptions {
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Outcome of one outbound record, carrying its correlation token back
#[derive(Debug)]
pub struct SenderResult<T> {
    pub correlation: T,
    pub result: Result<RecordMetadata, BrokerError>,
}

impl<T> SenderResult<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn correlation(&self) -> &T {
        &self.correlation
    }
}

type SendItem<T> = Result<SenderResult<T>, SendError<T>>;

pub struct Sender {
    producer: Arc<dyn ProducerClient>,
    options: SenderOptions,
    limiter: Arc<InFlightLimiter>,
    transactions: Option<Arc<TransactionCoordinator>>,
}

impl Sender {
    pub fn new(producer: Arc<dyn ProducerClient>, options: SenderOptions) -> Self {
        let limiter = Arc::new(InFlightLimiter::new(options.max_in_flight));
        Self {
            producer,
            options,
            limiter,
            transactions: None,
        }
    }

    /// A sender whose records all belong to transactions of the returned
    /// coordinator. The producer must have been created with a transactional id.
    pub fn transactional(producer: Arc<dyn ProducerClient>, options: SenderOptions) -> Self {
        let coordinator = Arc::new(TransactionCoordinator::new(producer.clone()));
        Self {
            transactions: Some(coordinator),
            ..Self::new(producer, options)
        }
    }

    pub fn transaction_coordinator(&self) -> Option<Arc<TransactionCoordinator>> {
        self.transactions.clone()
    }

    pub fn limiter(&self) -> &InFlightLimiter {
        &self.limiter
    }

    pub fn options(&self) -> &SenderOptions {
        &self.options
    }

    /// Send every record of `records`, reporting one result per record.
    ///
    /// Input is pulled lazily as in-flight capacity frees up. Dropping the returned
    /// stream stops dispatch; records already dispatched still resolve. On a
    /// transactional sender a transaction must be open.
    ///
    /// Must be called from within a tokio runtime.
    pub fn send<T, S>(&self, records: S) -> SendStream<T>
    where
        T: Send + 'static,
        S: Stream<Item = OutboundRecord<T>> + Send + 'static,
    {
        if let Some(coordinator) = &self.transactions {
            if let Err(e) = coordinator.mark_sending() {
                warn!("Refusing to send outside of a transaction: {e:#}");
                return SendStream::failed(e);
            }
        }

        let (tx, rx) = mpsc::channel(self.limiter.max_in_flight());
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch(
            self.producer.clone(),
            self.limiter.clone(),
            self.options.clone(),
            Box::pin(records),
            tx,
            shutdown.clone(),
        ));

        SendStream {
            results: rx,
            shutdown,
            finished: false,
        }
    }

    /// Send `records` inside one transaction: begin, send all, commit.
    ///
    /// The first failed record aborts the transaction and is returned as the error,
    /// even if the abort itself fails.
    pub async fn send_transactionally<T, S>(
        &self,
        records: S,
    ) -> Result<Vec<SenderResult<T>>, SendError<T>>
    where
        T: Send + 'static,
        S: Stream<Item = OutboundRecord<T>> + Send + 'static,
    {
        let coordinator = self
            .transactions
            .clone()
            .ok_or(TransactionError::NotTransactional)?;

        coordinator.begin().await?;

        let mut stream = self.send(records);
        let mut delivered = Vec::new();
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(SenderResult {
                    correlation,
                    result: Err(error),
                }) => {
                    failure = Some(SendError::Record { correlation, error });
                    break;
                }
                Ok(result) => delivered.push(result),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(stream);

        if let Some(failure) = failure {
            error!("Send failed inside transaction, aborting: {}", failure);
            if let Err(e) = coordinator.abort().await {
                error!("Failed to abort transaction after send failure: {e:#}");
            }
            return Err(failure);
        }

        coordinator.commit().await?;
        Ok(delivered)
    }

    /// Wait for queued records to be delivered
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.limiter.close();
        self.producer.flush(self.options.close_timeout).await?;
        info!(
            high_water_mark = self.limiter.high_water_mark(),
            max_in_flight = self.limiter.max_in_flight(),
            "Sender closed"
        );
        Ok(())
    }
}

async fn dispatch<T, S>(
    producer: Arc<dyn ProducerClient>,
    limiter: Arc<InFlightLimiter>,
    options: SenderOptions,
    mut records: Pin<Box<S>>,
    results: mpsc::Sender<SendItem<T>>,
    shutdown: CancellationToken,
) where
    T: Send + 'static,
    S: Stream<Item = OutboundRecord<T>> + Send + 'static,
{
    loop {
        // Capacity first, so a record is only pulled once it can be dispatched
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = limiter.acquire() => match permit {
                Some(permit) => permit,
                None => break,
            },
        };

        let outbound = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = records.next() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if shutdown.is_cancelled() {
            break;
        }

        tokio::spawn(deliver(
            producer.clone(),
            outbound,
            permit,
            options.clone(),
            results.clone(),
            shutdown.clone(),
        ));
    }
    debug!("Sender dispatch loop finished");
}

async fn deliver<T>(
    producer: Arc<dyn ProducerClient>,
    outbound: OutboundRecord<T>,
    permit: InFlightPermit,
    options: SenderOptions,
    results: mpsc::Sender<SendItem<T>>,
    shutdown: CancellationToken,
) {
    let OutboundRecord {
        record,
        correlation,
    } = outbound;

    let mut attempt = 0;
    let result = loop {
        metrics::counter!(SENDER_RECORDS_DISPATCHED).increment(1);
        match producer.send(&record).await {
            Ok(metadata) => break Ok(metadata),
            Err(e) if e.is_retriable() && attempt < options.retries => {
                attempt += 1;
                metrics::counter!(SENDER_RECORD_RETRIES).increment(1);
                debug!(
                    topic = record.topic.as_str(),
                    attempt = attempt,
                    error = %e,
                    "Transient send failure, retrying"
                );
                tokio::time::sleep(options.retry_backoff).await;
            }
            Err(e) => break Err(e),
        }
    };

    let status = if result.is_ok() { "success" } else { "error" };
    metrics::counter!(SENDER_RECORDS_COMPLETED, "status" => status).increment(1);

    let item = match result {
        Err(error) if options.stop_on_error => {
            warn!(
                topic = record.topic.as_str(),
                error = %error,
                "Record failed, stopping dispatch"
            );
            shutdown.cancel();
            Err(SendError::Record { correlation, error })
        }
        result => Ok(SenderResult {
            correlation,
            result,
        }),
    };

    if results.send(item).await.is_err() {
        debug!("Result stream dropped, discarding send result");
    }
    // Released only once the result has been handed over
    drop(permit);
}

/// Stream of per-record send outcomes. Dropping it cancels dispatch.
pub struct SendStream<T> {
    results: mpsc::Receiver<SendItem<T>>,
    shutdown: CancellationToken,
    finished: bool,
}

impl<T> SendStream<T> {
    fn failed(error: TransactionError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        if tx.try_send(Err(SendError::Transaction(error))).is_err() {
            debug!("Failed to queue transaction error");
        }
        Self {
            results: rx,
            shutdown: CancellationToken::new(),
            finished: false,
        }
    }
}

impl<T> Stream for SendStream<T> {
    type Item = SendItem<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.results.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                // A terminal error is reported once, later results are dropped
                this.finished = true;
                this.shutdown.cancel();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Ok(result))) => Poll::Ready(Some(Ok(result))),
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for SendStream<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryBroker;
    use crate::types::ProducerRecord;
    use crate::transaction::TransactionState;
    use futures::stream;

    fn records(topic: &str, count: usize) -> Vec<OutboundRecord<usize>> {
        (1..=count)
            .map(|i| {
                OutboundRecord::new(
                    ProducerRecord::to(topic).payload(format!("record-{i}")),
                    i,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sends_all_records() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 2);
        let sender = Sender::new(Arc::new(broker.producer()), SenderOptions::default());

        let results: Vec<_> = sender
            .send(stream::iter(records("out", 10)))
            .collect()
            .await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(SenderResult::is_ok)));
        assert_eq!(broker.records("out").len(), 10);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        broker.fail_transiently("record-2", 2);
        let options = SenderOptions::default()
            .with_retries(3)
            .with_retry_backoff(Duration::from_millis(1));
        let sender = Sender::new(Arc::new(broker.producer()), options);

        let results: Vec<_> = sender
            .send(stream::iter(records("out", 3)))
            .collect()
            .await;

        assert!(results.iter().all(|r| r.as_ref().is_ok_and(SenderResult::is_ok)));
        // Two failed attempts plus one success for record 2
        assert_eq!(broker.dispatched_count(), 5);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        broker.fail_transiently("record-1", 10);
        let options = SenderOptions::default()
            .with_retries(2)
            .with_retry_backoff(Duration::from_millis(1))
            .with_stop_on_error(false);
        let sender = Sender::new(Arc::new(broker.producer()), options);

        let results: Vec<_> = sender
            .send(stream::iter(records("out", 1)))
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        let result = results.into_iter().next().unwrap().unwrap();
        assert!(result.result.unwrap_err().is_retriable());
        assert_eq!(broker.dispatched_count(), 3);
    }

    #[tokio::test]
    async fn test_stop_on_error_ends_stream_once() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        broker.fail_permanently("record-2");
        let options = SenderOptions::default().with_max_in_flight(1);
        let sender = Sender::new(Arc::new(broker.producer()), options);

        let results: Vec<_> = sender
            .send(stream::iter(records("out", 5)))
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.correlation(), Some(&2));
        assert_eq!(broker.records("out").len(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_open_transaction() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        let sender = Sender::transactional(
            Arc::new(broker.transactional_producer("tx")),
            SenderOptions::default(),
        );

        let results: Vec<_> = sender
            .send(stream::iter(records("out", 2)))
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(SendError::Transaction(TransactionError::InvalidState { .. }))
        ));
    }

    #[tokio::test]
    async fn test_send_transactionally_aborts_on_failure() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        broker.fail_permanently("record-3");
        let sender = Sender::transactional(
            Arc::new(broker.transactional_producer("tx")),
            SenderOptions::default().with_max_in_flight(1),
        );

        let err = sender
            .send_transactionally(stream::iter(records("out", 4)))
            .await
            .unwrap_err();
        assert_eq!(err.correlation(), Some(&3));
        assert!(broker.records("out").is_empty());

        let delivered = sender
            .send_transactionally(stream::iter(records("other", 0)))
            .await
            .unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn test_failed_abort_still_reports_failing_record() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        broker.fail_permanently("record-2");
        broker.fail_transaction_aborts(1);
        let sender = Sender::transactional(
            Arc::new(broker.transactional_producer("tx")),
            SenderOptions::default().with_max_in_flight(1),
        );

        let err = sender
            .send_transactionally(stream::iter(records("out", 3)))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Record { correlation: 2, .. }));
        assert!(broker.records("out").is_empty());
        assert_eq!(
            sender.transaction_coordinator().unwrap().state(),
            TransactionState::Idle
        );
    }

    #[tokio::test]
    async fn test_non_transactional_sender_rejects_transactions() {
        let broker = MemoryBroker::new();
        let sender = Sender::new(Arc::new(broker.producer()), SenderOptions::default());
        let err = sender
            .send_transactionally(stream::iter(records("out", 1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SendError::Transaction(TransactionError::NotTransactional)
        ));
    }
}
