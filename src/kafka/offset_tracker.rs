//! Offset tracker - per-partition bookkeeping of polled vs completed offsets.
//!
//! Tasks handed to the processing service complete in arbitrary order, but
//! Kafka offsets may only be committed as a contiguous prefix. The tracker
//! records every polled offset and every completion, and stages a commit for
//! a partition only once the head of its polled set is done, draining as far
//! as the completed run reaches.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use tracing::debug;

use crate::kafka::types::Partition;
use crate::metrics_const::ALREADY_COMMITTED_OFFSETS;

#[derive(Default)]
struct PartitionOffsets {
    /// Offsets observed from poll, not yet drained towards a commit.
    polled: BTreeSet<i64>,
    /// Offsets whose processing finished but which are not yet at the head.
    completed: HashMap<i64, bool>,
}

impl PartitionOffsets {
    fn is_done(&self, offset: i64) -> bool {
        self.completed.get(&offset).copied().unwrap_or(false)
    }
}

struct TrackerState {
    partitions: HashMap<Partition, PartitionOffsets>,
    /// Staged commits, keyed by partition. The value is the offset of the
    /// next message to read, i.e. highest drained offset plus one.
    offsets_to_commit: HashMap<Partition, i64>,
}

/// Snapshot of tracker depth, for gauges and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetTrackerStats {
    pub polled: usize,
    pub completed: usize,
    pub staged: usize,
}

/// Per-bucket offset tracker. One mutex covers the polled sets, the completed
/// maps and the commit staging map; both the poll loop and the completion
/// listener serialize on it.
pub struct OffsetTracker {
    bucket_id: String,
    state: Mutex<TrackerState>,
}

impl OffsetTracker {
    pub fn new(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            state: Mutex::new(TrackerState {
                partitions: HashMap::new(),
                offsets_to_commit: HashMap::new(),
            }),
        }
    }

    /// Record an offset observed from poll.
    ///
    /// Removes any stale completion marker for the same offset; after a
    /// reconnect the broker can redeliver offsets we had already seen.
    pub fn register_polled(&self, partition: &Partition, offset: i64) {
        let mut state = self.state.lock().unwrap();
        let offsets = state.partitions.entry(partition.clone()).or_default();
        offsets.completed.remove(&offset);
        offsets.polled.insert(offset);
    }

    /// Mark an offset as completed by the processing service.
    ///
    /// When the offset is the head of the partition's polled set, drains the
    /// contiguous completed run from the head and stages `last drained + 1`
    /// for commit. A completion for an unknown offset is a no-op; this
    /// happens when a rebalance redelivered messages whose earlier copies
    /// were already committed past.
    pub fn release_completed(&self, partition: &Partition, offset: i64) {
        let mut state = self.state.lock().unwrap();

        let Some(offsets) = state.partitions.get_mut(partition) else {
            self.register_already_committed(partition, offset);
            return;
        };
        if !offsets.polled.contains(&offset) {
            self.register_already_committed(partition, offset);
            return;
        }

        offsets.completed.insert(offset, true);

        let is_head = offsets.polled.first() == Some(&offset);
        if !is_head {
            return;
        }

        let mut next_to_read = None;
        while let Some(&head) = offsets.polled.first() {
            if !offsets.is_done(head) {
                break;
            }
            // The committed offset is always the offset of the next message
            // the consumer will read.
            next_to_read = Some(head + 1);
            offsets.polled.pop_first();
            offsets.completed.remove(&head);
        }

        if let Some(next) = next_to_read {
            state.offsets_to_commit.insert(partition.clone(), next);
        }
    }

    /// Atomically take the staged commit map.
    pub fn drain_commitable(&self) -> HashMap<Partition, i64> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.offsets_to_commit)
    }

    pub fn has_commitable(&self) -> bool {
        !self.state.lock().unwrap().offsets_to_commit.is_empty()
    }

    pub fn stats(&self) -> OffsetTrackerStats {
        let state = self.state.lock().unwrap();
        OffsetTrackerStats {
            polled: state.partitions.values().map(|p| p.polled.len()).sum(),
            completed: state.partitions.values().map(|p| p.completed.len()).sum(),
            staged: state.offsets_to_commit.len(),
        }
    }

    fn register_already_committed(&self, partition: &Partition, offset: i64) {
        metrics::counter!(
            ALREADY_COMMITTED_OFFSETS,
            "bucket" => self.bucket_id.clone()
        )
        .increment(1);
        debug!(
            bucket = %self.bucket_id,
            partition = %partition,
            offset,
            "Offset has already been committed"
        );
    }
}
