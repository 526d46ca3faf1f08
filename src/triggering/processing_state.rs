//! Capacity signalling between the processing service and the poll loops.
//!
//! `add_task_for_processing` answering `Full` is edge-triggered; the poll
//! loop needs a level-triggered condition to retry on. Each bucket carries a
//! monotonically increasing version that the processing service bumps
//! whenever a slot frees, paired with a `Notify` for waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

pub struct BucketCapacity {
    version: AtomicU64,
    changed: Notify,
}

impl BucketCapacity {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Called by the processing service whenever a processing slot frees up.
    pub fn slot_released(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Completes once the version differs from `seen`.
    pub async fn changed_since(&self, seen: u64) {
        loop {
            let notified = self.changed.notified();
            if self.version() != seen {
                return;
            }
            notified.await;
        }
    }
}

/// Process-wide map of bucket capacity signals.
#[derive(Default)]
pub struct ProcessingState {
    buckets: DashMap<String, Arc<BucketCapacity>>,
}

impl ProcessingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, bucket_id: &str) -> Arc<BucketCapacity> {
        self.buckets
            .entry(bucket_id.to_string())
            .or_insert_with(|| Arc::new(BucketCapacity::new()))
            .clone()
    }
}
