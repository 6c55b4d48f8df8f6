//! Offset Ledger - Tracks delivered, acknowledged and committed offsets per partition
//!
//! Every record the receiver hands out is registered here as delivered. When the
//! application acknowledges it, the offset moves into the partition's pending set.
//! Commits cut the committable prefix of the pending set into a `CommitBatch`. The
//! prefix is every acknowledged offset below the lowest still-delivered offset, so a
//! commit never moves past a record the application has not finished with.
//!
//! A cut batch is either completed (the broker accepted it) or restored (the broker
//! refused it and the offsets wait for the next trigger).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::metrics_consts::{PARTITION_LAST_COMMITTED_OFFSET, PENDING_ACKNOWLEDGED_OFFSETS};
use crate::types::{Partition, PartitionOffset};

#[derive(Debug, Default)]
struct PartitionLedger {
    /// Handed to the application, not yet acknowledged
    delivered: BTreeSet<i64>,
    /// Acknowledged, not yet committed
    acknowledged: BTreeSet<i64>,
    last_acknowledged: Option<i64>,
    /// Next offset to consume, as last committed by this ledger
    committed: Option<i64>,
    /// First offset delivered since the last commit
    low_water: Option<i64>,
    consecutive_failures: u32,
}

impl PartitionLedger {
    fn is_committed(&self, offset: i64) -> bool {
        self.committed.is_some_and(|committed| offset < committed)
    }

    /// Remove and return every acknowledged offset below the lowest delivered one
    fn cut(&mut self) -> Vec<i64> {
        let rest = match self.delivered.first() {
            Some(&lowest_delivered) => self.acknowledged.split_off(&lowest_delivered),
            None => BTreeSet::new(),
        };
        std::mem::replace(&mut self.acknowledged, rest)
            .into_iter()
            .collect()
    }

    fn reset_low_water(&mut self) {
        self.low_water = match (self.delivered.first(), self.acknowledged.first()) {
            (Some(&d), Some(&a)) => Some(d.min(a)),
            (Some(&d), None) => Some(d),
            (None, Some(&a)) => Some(a),
            (None, None) => None,
        };
    }
}

/// Offsets cut from the ledger for a single commit call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    offsets: HashMap<Partition, Vec<i64>>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.offsets.values().all(Vec::is_empty)
    }

    /// Number of acknowledged offsets covered by the batch
    pub fn len(&self) -> usize {
        self.offsets.values().map(Vec::len).sum()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.offsets
            .iter()
            .filter(|(_, offsets)| !offsets.is_empty())
            .map(|(partition, _)| partition)
    }

    pub fn offsets(&self, partition: &Partition) -> &[i64] {
        self.offsets
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The next-offset-to-consume per partition, which is what the broker stores
    pub fn commit_offsets(&self) -> Vec<PartitionOffset> {
        let mut commits: Vec<PartitionOffset> = self
            .offsets
            .iter()
            .filter_map(|(partition, offsets)| {
                offsets
                    .iter()
                    .max()
                    .map(|max| PartitionOffset::new(partition.clone(), max + 1))
            })
            .collect();
        commits.sort_by(|a, b| a.partition().cmp(b.partition()));
        commits
    }

    fn insert(&mut self, partition: Partition, offsets: Vec<i64>) {
        if !offsets.is_empty() {
            self.offsets.entry(partition).or_default().extend(offsets);
        }
    }
}

/// Thread-safe ledger of per-partition offset state for one receiver
pub struct OffsetLedger {
    partitions: DashMap<Partition, PartitionLedger>,
    /// Acknowledged-but-uncommitted offsets across all partitions
    pending: AtomicUsize,
    /// While set, offsets are committed by a transaction and `cut_batch` refuses
    transactional: AtomicBool,
    /// Bumped by every rollback; records registered under an older generation are stale
    generation: AtomicU64,
    rollback_lock: RwLock<()>,
}

impl Default for OffsetLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            pending: AtomicUsize::new(0),
            transactional: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            rollback_lock: RwLock::new(()),
        }
    }

    pub fn set_transactional(&self, transactional: bool) {
        let was = self.transactional.swap(transactional, Ordering::SeqCst);
        if was != transactional {
            info!(transactional = transactional, "Offset ledger commit ownership changed");
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Record offsets as delivered to the application.
    ///
    /// Returns false, registering nothing, if the ledger was rolled back since
    /// `generation` was read. The caller's records predate the rewind and will be
    /// polled again.
    pub fn register(&self, offsets: &[PartitionOffset], generation: u64) -> bool {
        let _rollback = self
            .rollback_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.generation() != generation {
            return false;
        }

        for offset in offsets {
            let mut state = self
                .partitions
                .entry(offset.partition().clone())
                .or_default();
            if state.is_committed(offset.offset()) {
                debug!(
                    topic = offset.topic(),
                    partition = offset.partition_number(),
                    offset = offset.offset(),
                    "Registered offset is already committed"
                );
                continue;
            }
            state.delivered.insert(offset.offset());
            if state.low_water.map_or(true, |low| offset.offset() < low) {
                state.low_water = Some(offset.offset());
            }
        }
        true
    }

    /// Mark a delivered offset safe to commit.
    ///
    /// Returns the ledger-wide pending count after the acknowledgment, or `None` if
    /// the offset was not outstanding (already acknowledged, committed or revoked).
    pub fn acknowledge(&self, offset: &PartitionOffset) -> Option<usize> {
        let mut state = self.partitions.get_mut(offset.partition())?;
        if !state.delivered.remove(&offset.offset()) {
            return None;
        }
        state.acknowledged.insert(offset.offset());
        if state.last_acknowledged.map_or(true, |last| offset.offset() > last) {
            state.last_acknowledged = Some(offset.offset());
        }

        // Counted while the shard is locked so no cut can release it first
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(PENDING_ACKNOWLEDGED_OFFSETS).set(pending as f64);
        Some(pending)
    }

    /// Cut the committable offsets of every partition.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::TransactionInProgress` while a transaction owns the
    /// offsets. Callers should skip committing in this case.
    pub fn cut_batch(&self) -> Result<CommitBatch, LedgerError> {
        if self.is_transactional() {
            return Err(LedgerError::TransactionInProgress);
        }
        Ok(self.cut_all())
    }

    /// Cut the committable offsets of a single partition
    pub fn cut_partition(&self, partition: &Partition) -> Result<CommitBatch, LedgerError> {
        if self.is_transactional() {
            return Err(LedgerError::TransactionInProgress);
        }

        let mut batch = CommitBatch::default();
        if let Some(mut state) = self.partitions.get_mut(partition) {
            let cut = state.cut();
            self.release_pending(cut.len());
            batch.insert(partition.clone(), cut);
        }
        Ok(batch)
    }

    /// Cut every committable offset for a transactional offset commit
    pub fn cut_transaction_batch(&self) -> CommitBatch {
        self.cut_all()
    }

    fn cut_all(&self) -> CommitBatch {
        let mut batch = CommitBatch::default();
        for mut entry in self.partitions.iter_mut() {
            let cut = entry.value_mut().cut();
            self.release_pending(cut.len());
            batch.insert(entry.key().clone(), cut);
        }
        batch
    }

    /// Drop offsets that an earlier completed commit already covers
    pub fn retain_uncommitted(&self, batch: CommitBatch) -> CommitBatch {
        let mut retained = CommitBatch::default();
        for (partition, offsets) in batch.offsets {
            let committed = self
                .partitions
                .get(&partition)
                .and_then(|state| state.committed);
            let offsets = offsets
                .into_iter()
                .filter(|offset| committed.map_or(true, |c| *offset >= c))
                .collect();
            retained.insert(partition, offsets);
        }
        retained
    }

    /// Advance the committed position after the broker accepted `batch`
    pub fn complete_batch(&self, batch: &CommitBatch) {
        for commit in batch.commit_offsets() {
            let Some(mut state) = self.partitions.get_mut(commit.partition()) else {
                continue;
            };
            if state.committed.map_or(true, |c| commit.offset() > c) {
                state.committed = Some(commit.offset());
                debug!(
                    topic = commit.topic(),
                    partition = commit.partition_number(),
                    offset = commit.offset(),
                    "Advanced committed offset"
                );
            }
            state.consecutive_failures = 0;
            state.reset_low_water();

            metrics::gauge!(
                PARTITION_LAST_COMMITTED_OFFSET,
                "topic" => commit.topic().to_string(),
                "partition" => commit.partition_number().to_string()
            )
            .set(commit.offset() as f64);
        }
    }

    /// Put the offsets of a failed commit back into the pending sets
    pub fn restore_batch(&self, batch: CommitBatch) {
        for (partition, offsets) in batch.offsets {
            let Some(mut state) = self.partitions.get_mut(&partition) else {
                // Revoked while the commit was in flight
                continue;
            };
            let mut restored = 0;
            for offset in offsets {
                if !state.is_committed(offset) && state.acknowledged.insert(offset) {
                    restored += 1;
                }
            }
            if restored > 0 {
                let pending = self.pending.fetch_add(restored, Ordering::SeqCst) + restored;
                metrics::gauge!(PENDING_ACKNOWLEDGED_OFFSETS).set(pending as f64);
            }
        }
    }

    /// Count a failed commit against every partition in `batch`.
    ///
    /// Returns the partition with the most consecutive failures and that count.
    pub fn record_failure(&self, batch: &CommitBatch) -> Option<(Partition, u32)> {
        let mut worst: Option<(Partition, u32)> = None;
        for partition in batch.partitions() {
            let Some(mut state) = self.partitions.get_mut(partition) else {
                continue;
            };
            state.consecutive_failures += 1;
            let failures = state.consecutive_failures;
            if worst.as_ref().map_or(true, |(_, w)| failures > *w) {
                worst = Some((partition.clone(), failures));
            }
        }
        worst
    }

    /// Forget all delivered and pending offsets, and return where each partition
    /// must be rewound to so those records are delivered again.
    pub fn rollback(&self) -> Vec<PartitionOffset> {
        let _rollback = self
            .rollback_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut positions = Vec::new();
        let mut dropped = 0;
        for mut entry in self.partitions.iter_mut() {
            let partition = entry.key().clone();
            let state = entry.value_mut();

            if let Some(position) = state.committed.or(state.low_water) {
                positions.push(PartitionOffset::new(partition, position));
            }
            dropped += state.acknowledged.len();
            state.delivered.clear();
            state.acknowledged.clear();
            state.low_water = None;
        }
        self.release_pending(dropped);

        positions.sort_by(|a, b| a.partition().cmp(b.partition()));
        info!(
            generation = generation,
            partitions = positions.len(),
            "Rolled back offset ledger"
        );
        positions
    }

    /// Forget a partition this receiver no longer owns
    pub fn clear_partition(&self, partition: &Partition) {
        if let Some((_, state)) = self.partitions.remove(partition) {
            self.release_pending(state.acknowledged.len());
            if !state.acknowledged.is_empty() {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    uncommitted = state.acknowledged.len(),
                    "Partition revoked with uncommitted acknowledgments"
                );
            } else {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Cleared offset ledger for revoked partition"
                );
            }
        }
    }

    fn release_pending(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(p.saturating_sub(count))
            })
            .unwrap_or_default();
        metrics::gauge!(PENDING_ACKNOWLEDGED_OFFSETS).set(previous.saturating_sub(count) as f64);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Acknowledged-but-uncommitted offsets of a partition, ascending
    pub fn pending_offsets(&self, partition: &Partition) -> Vec<i64> {
        self.partitions
            .get(partition)
            .map(|state| state.acknowledged.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|state| state.committed)
    }

    pub fn last_acknowledged(&self, partition: &Partition) -> Option<i64> {
        self.partitions
            .get(partition)
            .and_then(|state| state.last_acknowledged)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(num: i32) -> Partition {
        Partition::new("test-topic", num)
    }

    fn offsets(p: i32, range: std::ops::RangeInclusive<i64>) -> Vec<PartitionOffset> {
        range.map(|o| PartitionOffset::new(partition(p), o)).collect()
    }

    #[test]
    fn test_cut_stops_below_unacknowledged_offset() {
        let ledger = OffsetLedger::new();
        assert!(ledger.register(&offsets(0, 1..=5), 0));

        for offset in [1, 2, 4, 5] {
            ledger.acknowledge(&PartitionOffset::new(partition(0), offset));
        }

        let batch = ledger.cut_batch().unwrap();
        assert_eq!(batch.offsets(&partition(0)), &[1, 2]);
        assert_eq!(
            batch.commit_offsets(),
            vec![PartitionOffset::new(partition(0), 3)]
        );
        assert_eq!(ledger.pending_offsets(&partition(0)), vec![4, 5]);
        assert_eq!(ledger.pending_count(), 2);

        ledger.acknowledge(&PartitionOffset::new(partition(0), 3));
        let batch = ledger.cut_batch().unwrap();
        assert_eq!(batch.offsets(&partition(0)), &[3, 4, 5]);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 7..=7), 0);
        let offset = PartitionOffset::new(partition(0), 7);

        assert_eq!(ledger.acknowledge(&offset), Some(1));
        assert_eq!(ledger.acknowledge(&offset), None);
        assert_eq!(ledger.last_acknowledged(&partition(0)), Some(7));

        // Never delivered
        assert_eq!(
            ledger.acknowledge(&PartitionOffset::new(partition(3), 1)),
            None
        );
    }

    #[test]
    fn test_complete_and_restore() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 0..=3), 0);
        for o in offsets(0, 0..=3) {
            ledger.acknowledge(&o);
        }

        let batch = ledger.cut_batch().unwrap();
        ledger.restore_batch(batch.clone());
        assert_eq!(ledger.pending_offsets(&partition(0)), vec![0, 1, 2, 3]);
        assert_eq!(ledger.pending_count(), 4);

        let batch = ledger.cut_batch().unwrap();
        ledger.complete_batch(&batch);
        assert_eq!(ledger.committed_offset(&partition(0)), Some(4));

        // A late restore of an already committed batch is ignored
        ledger.restore_batch(batch);
        assert!(ledger.pending_offsets(&partition(0)).is_empty());
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_retain_uncommitted_drops_covered_offsets() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 0..=5), 0);
        for o in offsets(0, 0..=2) {
            ledger.acknowledge(&o);
        }
        let first = ledger.cut_batch().unwrap();
        for o in offsets(0, 3..=5) {
            ledger.acknowledge(&o);
        }
        let second = ledger.cut_batch().unwrap();

        ledger.complete_batch(&second);
        let first = ledger.retain_uncommitted(first);
        assert!(first.is_empty());
        assert_eq!(ledger.committed_offset(&partition(0)), Some(6));
    }

    #[test]
    fn test_transactional_ledger_refuses_cut() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 0..=1), 0);
        ledger.acknowledge(&PartitionOffset::new(partition(0), 0));
        ledger.set_transactional(true);

        assert!(matches!(
            ledger.cut_batch(),
            Err(LedgerError::TransactionInProgress)
        ));
        assert!(ledger.cut_partition(&partition(0)).is_err());

        let batch = ledger.cut_transaction_batch();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_record_failure_counts_consecutive() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 0..=0), 0);
        ledger.register(&offsets(1, 0..=0), 0);
        ledger.acknowledge(&PartitionOffset::new(partition(0), 0));
        ledger.acknowledge(&PartitionOffset::new(partition(1), 0));
        let batch = ledger.cut_batch().unwrap();

        assert_eq!(ledger.record_failure(&batch).map(|(_, n)| n), Some(1));
        assert_eq!(ledger.record_failure(&batch).map(|(_, n)| n), Some(2));

        ledger.complete_batch(&batch);
        ledger.register(&offsets(0, 1..=1), 0);
        ledger.acknowledge(&PartitionOffset::new(partition(0), 1));
        let batch = ledger.cut_partition(&partition(0)).unwrap();
        assert_eq!(
            ledger.record_failure(&batch),
            Some((partition(0), 1))
        );
    }

    #[test]
    fn test_rollback_rewinds_to_committed_or_low_water() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 10..=14), 0);
        ledger.register(&offsets(1, 3..=4), 0);
        for o in offsets(0, 10..=11) {
            ledger.acknowledge(&o);
        }
        let batch = ledger.cut_batch().unwrap();
        ledger.complete_batch(&batch);
        ledger.acknowledge(&PartitionOffset::new(partition(0), 12));
        ledger.acknowledge(&PartitionOffset::new(partition(1), 3));

        let positions = ledger.rollback();
        assert_eq!(
            positions,
            vec![
                PartitionOffset::new(partition(0), 12),
                PartitionOffset::new(partition(1), 3),
            ]
        );
        assert_eq!(ledger.pending_count(), 0);
        assert_eq!(ledger.generation(), 1);

        // Registrations from before the rollback are refused
        assert!(!ledger.register(&offsets(0, 15..=15), 0));
        assert!(ledger.register(&offsets(0, 12..=12), 1));
    }

    #[test]
    fn test_clear_partition_releases_pending() {
        let ledger = OffsetLedger::new();
        ledger.register(&offsets(0, 0..=2), 0);
        for o in offsets(0, 0..=2) {
            ledger.acknowledge(&o);
        }
        assert_eq!(ledger.pending_count(), 3);

        ledger.clear_partition(&partition(0));
        assert_eq!(ledger.pending_count(), 0);
        assert_eq!(ledger.partition_count(), 0);
        assert!(ledger.cut_batch().unwrap().is_empty());
    }

    #[test]
    fn test_pending_count_survives_concurrent_acknowledge_and_cut() {
        for _ in 0..20 {
            let ledger = OffsetLedger::new();
            for p in 0..4 {
                assert!(ledger.register(&offsets(p, 0..=1999), 0));
            }

            std::thread::scope(|scope| {
                for p in 0..4 {
                    let ledger = &ledger;
                    scope.spawn(move || {
                        for o in offsets(p, 0..=1999) {
                            ledger.acknowledge(&o);
                        }
                    });
                }
                scope.spawn(|| {
                    for _ in 0..5000 {
                        ledger.cut_batch().unwrap();
                    }
                });
            });

            ledger.cut_batch().unwrap();
            let remaining: usize = (0..4)
                .map(|p| ledger.pending_offsets(&partition(p)).len())
                .sum();
            assert_eq!(remaining, 0);
            assert_eq!(ledger.pending_count(), 0);
        }
    }
}
