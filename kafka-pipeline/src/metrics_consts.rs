// ==== Sender metrics ====
/// Counter for records handed to the producer client
pub const SENDER_RECORDS_DISPATCHED: &str = "kafka_sender_records_dispatched_total";

/// Counter for resolved sends, labelled by status
pub const SENDER_RECORDS_COMPLETED: &str = "kafka_sender_records_completed_total";

/// Counter for transient send failures that were retried
pub const SENDER_RECORD_RETRIES: &str = "kafka_sender_record_retries_total";

/// Gauge for records dispatched but not yet resolved
pub const SENDER_IN_FLIGHT: &str = "kafka_sender_in_flight_records";

/// Histogram for time spent waiting on an in-flight permit
pub const SENDER_PERMIT_WAIT_MS: &str = "kafka_sender_permit_wait_ms";

// ==== Receiver metrics ====
/// Counter for records delivered to the application
pub const RECEIVER_RECORDS_DELIVERED: &str = "kafka_receiver_records_delivered_total";

/// Counter for poll errors, labelled by level
pub const RECEIVER_POLL_ERRORS: &str = "kafka_receiver_poll_errors_total";

/// Counter for records discarded because a transaction abort rewound the consumer
pub const RECEIVER_STALE_RECORDS_DROPPED: &str = "kafka_receiver_stale_records_dropped_total";

// ==== Commit metrics ====
/// Counter for offset commits, labelled by trigger and status
pub const COMMITS_TOTAL: &str = "kafka_offset_commits_total";

/// Counter for commit triggers skipped because a transaction owns the offsets
pub const COMMITS_SKIPPED_TRANSACTIONAL: &str = "kafka_offset_commits_skipped_transactional_total";

/// Gauge for acknowledged offsets not yet committed
pub const PENDING_ACKNOWLEDGED_OFFSETS: &str = "kafka_pending_acknowledged_offsets";

/// Gauge for the highest committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "kafka_partition_last_committed_offset";

// ==== Transaction metrics ====
/// Counter for finished transactions, labelled by outcome
pub const TRANSACTIONS_TOTAL: &str = "kafka_transactions_total";

// ==== Partition lane metrics ====
/// Counter for routed records that had to wait on a full lane
pub const PARTITION_LANE_BACKPRESSURE_TOTAL: &str = "kafka_partition_lane_backpressure_total";

/// Histogram for time spent waiting on a full lane
pub const PARTITION_LANE_BACKPRESSURE_WAIT_MS: &str = "kafka_partition_lane_backpressure_wait_ms";
