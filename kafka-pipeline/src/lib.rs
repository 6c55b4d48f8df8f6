//! Ordered, backpressured Kafka sends and receives with at-least-once, at-most-once
//! and exactly-once delivery.
//!
//! - [`sender::Sender`] bounds in-flight sends, retries transient failures and
//!   reports one result per record.
//! - [`receiver::Receiver`] polls on its own task and hands out records with an
//!   acknowledgment handle. Acknowledged offsets are committed by the commit
//!   scheduler, or by a transaction when one is bound.
//! - [`partition_router::PartitionRouter`] fans records out to one ordered lane per
//!   partition.
//! - [`transaction::TransactionCoordinator`] commits consumed offsets and produced
//!   records atomically, and rewinds the receiver on abort.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use formats
//! that include the full chain:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original
//! error remains the source.

pub mod client;
pub mod commit_scheduler;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics_consts;
pub mod offset_ledger;
pub mod partition_router;
pub mod partition_worker;
pub mod receiver;
pub mod relay;
pub mod sender;
pub mod test_utils;
pub mod transaction;
pub mod types;

// Re-export commonly used types for convenience
pub use client::{ConsumerClient, ProducerClient};
pub use error::{BrokerError, ReceiverError, SendError, TransactionError};
pub use receiver::{ConsumedRecord, Receiver, ReceiverOffset, ReceiverOptions, ReceiverStream};
pub use sender::{SendStream, Sender, SenderOptions, SenderResult};
pub use transaction::{TransactionCoordinator, TransactionState};
pub use types::{OutboundRecord, Partition, PartitionOffset, ProducerRecord, Subscription};
