use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::transaction::TransactionState;
use crate::types::Partition;

/// Errors surfaced by a broker client implementation
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker client task failed: {0}")]
    Task(String),
    #[error("broker client is closed")]
    Closed,
    #[error("unsupported broker operation: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    pub fn code(&self) -> Option<RDKafkaErrorCode> {
        match self {
            BrokerError::Kafka(e) => e.rdkafka_error_code(),
            _ => None,
        }
    }

    /// Errors that are expected to clear up on their own and are worth another attempt
    pub fn is_retriable(&self) -> bool {
        match self {
            BrokerError::Timeout(_) => true,
            BrokerError::Kafka(_) => matches!(
                self.code(),
                Some(
                    RDKafkaErrorCode::QueueFull
                        | RDKafkaErrorCode::RequestTimedOut
                        | RDKafkaErrorCode::OperationTimedOut
                        | RDKafkaErrorCode::NotEnoughReplicas
                        | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                        | RDKafkaErrorCode::LeaderNotAvailable
                        | RDKafkaErrorCode::NotLeaderForPartition
                        | RDKafkaErrorCode::NetworkException
                        | RDKafkaErrorCode::BrokerTransportFailure
                        | RDKafkaErrorCode::AllBrokersDown
                        | RDKafkaErrorCode::CoordinatorNotAvailable
                        | RDKafkaErrorCode::NotCoordinator
                )
            ),
            BrokerError::Task(_) | BrokerError::Closed | BrokerError::Unsupported(_) => false,
        }
    }

    /// Errors after which the consumer can no longer take part in its group
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::Kafka(KafkaError::MessageConsumptionFatal(_)) => true,
            BrokerError::Kafka(_) => matches!(
                self.code(),
                Some(
                    RDKafkaErrorCode::Fatal
                        | RDKafkaErrorCode::Authentication
                        | RDKafkaErrorCode::PollExceeded
                )
            ),
            BrokerError::Closed => true,
            BrokerError::Timeout(_) | BrokerError::Task(_) | BrokerError::Unsupported(_) => false,
        }
    }
}

impl From<tokio::task::JoinError> for BrokerError {
    fn from(e: tokio::task::JoinError) -> Self {
        BrokerError::Task(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transaction in progress - offsets are committed through the transaction")]
    TransactionInProgress,
}

#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("cannot {operation} while transaction is {state:?}")]
    InvalidState {
        state: TransactionState,
        operation: &'static str,
    },
    #[error("sender has no transactional id configured")]
    NotTransactional,
    #[error("consumer group metadata unavailable for transactional offset commit")]
    NoGroupMetadata,
    #[error("transaction commit failed, transaction was aborted: {0}")]
    CommitFailed(#[source] BrokerError),
    #[error("transaction abort failed: {0}")]
    AbortFailed(#[source] BrokerError),
    #[error("broker error during transaction: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Error, Debug, Clone)]
pub enum ReceiverError {
    #[error("fatal consumer error: {0}")]
    Fatal(#[source] BrokerError),
    #[error("offset commit for {partition} failed {attempts} times in a row: {error}")]
    CommitRetriesExhausted {
        partition: Partition,
        attempts: u32,
        #[source]
        error: BrokerError,
    },
    #[error("offset commit failed: {0}")]
    Commit(#[source] BrokerError),
    #[error("offsets of this receiver are committed through its transaction")]
    TransactionBound,
    #[error("receiver is shut down")]
    Closed,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Terminal error of a send stream
#[derive(Error, Debug)]
pub enum SendError<T> {
    #[error("failed to send record: {error}")]
    Record {
        correlation: T,
        #[source]
        error: BrokerError,
    },
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl<T> SendError<T> {
    /// Correlation token of the record that caused the failure, if a record did
    pub fn correlation(&self) -> Option<&T> {
        match self {
            SendError::Record { correlation, .. } => Some(correlation),
            SendError::Transaction(_) => None,
        }
    }

    pub fn into_correlation(self) -> Option<T> {
        match self {
            SendError::Record { correlation, .. } => Some(correlation),
            SendError::Transaction(_) => None,
        }
    }
}
