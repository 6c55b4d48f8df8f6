//! Transaction Coordinator - Ties consumed offsets to produced records
//!
//! The coordinator owns the transaction lifecycle of one transactional producer:
//!
//! ```text
//! Idle -> Begun -> Sending -> Committing -> Idle
//!         Begun | Sending -> Aborting -> Idle
//! ```
//!
//! When a receiver is bound, `commit` sends that receiver's acknowledged offsets to
//! the transaction before committing it, and `abort` rewinds the receiver so the
//! aborted records are delivered again.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ConsumerClient, ProducerClient};
use crate::error::{BrokerError, TransactionError};
use crate::metrics_consts::TRANSACTIONS_TOTAL;
use crate::offset_ledger::{CommitBatch, OffsetLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Begun,
    Sending,
    Committing,
    Aborting,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Idle => "idle",
            TransactionState::Begun => "begun",
            TransactionState::Sending => "sending",
            TransactionState::Committing => "committing",
            TransactionState::Aborting => "aborting",
        }
    }

    /// A transaction is open and accepts sends, commit and abort
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Begun | TransactionState::Sending)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
struct BoundReceiver {
    ledger: Arc<OffsetLedger>,
    consumer: Arc<dyn ConsumerClient>,
}

pub struct TransactionCoordinator {
    producer: Arc<dyn ProducerClient>,
    state: watch::Sender<TransactionState>,
    bound: Mutex<Option<BoundReceiver>>,
    /// Serializes begin, commit and abort
    operation: tokio::sync::Mutex<()>,
}

impl TransactionCoordinator {
    pub fn new(producer: Arc<dyn ProducerClient>) -> Self {
        let (state, _) = watch::channel(TransactionState::Idle);
        Self {
            producer,
            state,
            bound: Mutex::new(None),
            operation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> TransactionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TransactionState> {
        self.state.subscribe()
    }

    /// Route the offsets of a receiver's ledger through this coordinator's
    /// transactions. The ledger stops accepting non-transactional commits.
    pub fn bind(&self, ledger: Arc<OffsetLedger>, consumer: Arc<dyn ConsumerClient>) {
        ledger.set_transactional(true);
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = bound.replace(BoundReceiver { ledger, consumer }) {
            warn!("Replacing the receiver bound to the transaction coordinator");
            previous.ledger.set_transactional(false);
        }
    }

    fn bound_receiver(&self) -> Option<BoundReceiver> {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: TransactionState) {
        let previous = self.state.send_replace(state);
        debug!(from = %previous, to = %state, "Transaction state changed");
    }

    fn expect_state(
        &self,
        allowed: &[TransactionState],
        operation: &'static str,
    ) -> Result<(), TransactionError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(TransactionError::InvalidState { state, operation })
        }
    }

    /// Move `Begun` to `Sending`. Called by the sender before it dispatches
    /// records that belong to the open transaction.
    pub fn mark_sending(&self) -> Result<(), TransactionError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match *state {
            TransactionState::Begun => {
                *state = TransactionState::Sending;
                true
            }
            TransactionState::Sending => false,
            other => {
                result = Err(TransactionError::InvalidState {
                    state: other,
                    operation: "send",
                });
                false
            }
        });
        result
    }

    pub async fn begin(&self) -> Result<(), TransactionError> {
        let _operation = self.operation.lock().await;
        self.expect_state(&[TransactionState::Idle], "begin")?;

        self.producer.begin_transaction().await?;
        self.set_state(TransactionState::Begun);
        Ok(())
    }

    /// Commit the open transaction together with the bound receiver's acknowledged
    /// offsets. Any failure aborts the transaction before it is returned.
    pub async fn commit(&self) -> Result<(), TransactionError> {
        let _operation = self.operation.lock().await;
        self.expect_state(
            &[TransactionState::Begun, TransactionState::Sending],
            "commit",
        )?;
        self.set_state(TransactionState::Committing);

        let bound = self.bound_receiver();
        let batch = bound
            .as_ref()
            .map(|bound| bound.ledger.cut_transaction_batch())
            .unwrap_or_default();

        if let Err(failure) = self.commit_with_offsets(bound.as_ref(), &batch).await {
            error!("Transaction commit failed, aborting: {}", failure);
            if let Some(bound) = &bound {
                bound.ledger.restore_batch(batch);
            }
            self.abort_locked().await?;
            return Err(failure);
        }

        if let Some(bound) = &bound {
            bound.ledger.complete_batch(&batch);
        }
        self.set_state(TransactionState::Idle);
        metrics::counter!(TRANSACTIONS_TOTAL, "outcome" => "committed").increment(1);
        info!(offsets = batch.len(), "Transaction committed");
        Ok(())
    }

    async fn commit_with_offsets(
        &self,
        bound: Option<&BoundReceiver>,
        batch: &CommitBatch,
    ) -> Result<(), TransactionError> {
        if let Some(bound) = bound.filter(|_| !batch.is_empty()) {
            let group = bound
                .consumer
                .group_metadata()
                .ok_or(TransactionError::NoGroupMetadata)?;
            self.producer
                .send_offsets_to_transaction(batch.commit_offsets(), group)
                .await
                .map_err(TransactionError::CommitFailed)?;
        }

        self.producer
            .commit_transaction()
            .await
            .map_err(TransactionError::CommitFailed)
    }

    /// Abort the open transaction and rewind the bound receiver to its last
    /// committed position.
    pub async fn abort(&self) -> Result<(), TransactionError> {
        let _operation = self.operation.lock().await;
        self.expect_state(
            &[TransactionState::Begun, TransactionState::Sending],
            "abort",
        )?;
        self.abort_locked().await
    }

    async fn abort_locked(&self) -> Result<(), TransactionError> {
        self.set_state(TransactionState::Aborting);

        let aborted = self.producer.abort_transaction().await;
        let rewound = self.rewind().await;

        self.set_state(TransactionState::Idle);
        metrics::counter!(TRANSACTIONS_TOTAL, "outcome" => "aborted").increment(1);

        aborted.map_err(TransactionError::AbortFailed)?;
        rewound?;
        info!("Transaction aborted");
        Ok(())
    }

    async fn rewind(&self) -> Result<(), BrokerError> {
        let Some(bound) = self.bound_receiver() else {
            return Ok(());
        };

        let positions = bound.ledger.rollback();
        if positions.is_empty() {
            return Ok(());
        }
        for position in &positions {
            debug!(
                topic = position.topic(),
                partition = position.partition_number(),
                offset = position.offset(),
                "Rewinding consumer after abort"
            );
        }
        bound.consumer.seek(positions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryBroker;
    use crate::types::{Partition, PartitionOffset, ProducerRecord};

    fn coordinator(broker: &MemoryBroker) -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::new(broker.transactional_producer("tx-1")))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        let coordinator = coordinator(&broker);
        let mut states = coordinator.subscribe();

        coordinator.begin().await.unwrap();
        assert_eq!(coordinator.state(), TransactionState::Begun);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), TransactionState::Begun);

        coordinator.mark_sending().unwrap();
        assert_eq!(coordinator.state(), TransactionState::Sending);
        coordinator.mark_sending().unwrap();

        coordinator.commit().await.unwrap();
        assert_eq!(coordinator.state(), TransactionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker);

        assert!(matches!(
            coordinator.commit().await,
            Err(TransactionError::InvalidState {
                state: TransactionState::Idle,
                operation: "commit"
            })
        ));
        assert!(coordinator.abort().await.is_err());
        assert!(coordinator.mark_sending().is_err());

        coordinator.begin().await.unwrap();
        assert!(matches!(
            coordinator.begin().await,
            Err(TransactionError::InvalidState {
                state: TransactionState::Begun,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_abort_discards_records_and_rewinds() {
        let broker = MemoryBroker::new();
        broker.create_topic("in", 1);
        broker.create_topic("out", 1);
        let producer = Arc::new(broker.transactional_producer("tx-1"));
        let coordinator = TransactionCoordinator::new(producer.clone());

        let ledger = Arc::new(OffsetLedger::new());
        let consumer = Arc::new(broker.consumer("group"));
        coordinator.bind(ledger.clone(), consumer.clone());
        assert!(ledger.is_transactional());

        let input = Partition::new("in", 0);
        let offsets: Vec<_> = (5..8).map(|o| PartitionOffset::new(input.clone(), o)).collect();
        ledger.register(&offsets, ledger.generation());
        for offset in &offsets {
            ledger.acknowledge(offset);
        }

        coordinator.begin().await.unwrap();
        producer
            .send(&ProducerRecord::to("out").payload("x"))
            .await
            .unwrap();
        coordinator.abort().await.unwrap();

        assert_eq!(coordinator.state(), TransactionState::Idle);
        assert!(broker.records("out").is_empty());
        assert_eq!(ledger.pending_count(), 0);
        assert_eq!(ledger.generation(), 1);
        assert_eq!(consumer.position(&input), Some(5));
    }

    #[tokio::test]
    async fn test_commit_failure_aborts() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1);
        let coordinator = coordinator(&broker);
        broker.fail_transaction_commits(1);

        coordinator.begin().await.unwrap();
        let err = coordinator.commit().await.unwrap_err();
        assert!(matches!(err, TransactionError::CommitFailed(_)));
        assert_eq!(coordinator.state(), TransactionState::Idle);

        coordinator.begin().await.unwrap();
        coordinator.commit().await.unwrap();
    }
}
