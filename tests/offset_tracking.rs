//! Offset tracking behavior through the public API: completion order never
//! bends the rule that commits are a contiguous prefix per partition.

use task_triggerer::kafka::{OffsetTracker, Partition};

fn partition(n: i32) -> Partition {
    Partition::new("twTasks.test.executeTask.b1".to_string(), n)
}

#[test]
fn test_out_of_order_batch_commits_exactly_once() {
    let tracker = OffsetTracker::new("b1");
    let p = partition(0);

    for offset in [10, 11, 12] {
        tracker.register_polled(&p, offset);
    }

    // Completions arrive 11, 12, 10.
    tracker.release_completed(&p, 11);
    assert!(
        tracker.drain_commitable().is_empty(),
        "completion behind an in-flight head must not stage a commit"
    );

    tracker.release_completed(&p, 12);
    assert!(tracker.drain_commitable().is_empty());

    tracker.release_completed(&p, 10);
    let staged = tracker.drain_commitable();
    assert_eq!(staged.len(), 1, "the whole batch commits as one entry");
    assert_eq!(staged.get(&p), Some(&13));
}

#[test]
fn test_commit_never_passes_inflight_predecessor() {
    let tracker = OffsetTracker::new("b1");
    let p = partition(0);

    for offset in 0..6 {
        tracker.register_polled(&p, offset);
    }

    // Everything except offset 2 completes.
    for offset in [0, 1, 3, 4, 5] {
        tracker.release_completed(&p, offset);
    }

    let staged = tracker.drain_commitable();
    assert_eq!(
        staged.get(&p),
        Some(&2),
        "staged commit must stop at the still-in-flight offset"
    );

    tracker.release_completed(&p, 2);
    assert_eq!(tracker.drain_commitable().get(&p), Some(&6));
}

#[test]
fn test_interleaved_partitions_commit_independently() {
    let tracker = OffsetTracker::new("b1");
    let p0 = partition(0);
    let p1 = partition(1);

    tracker.register_polled(&p0, 5);
    tracker.register_polled(&p1, 50);
    tracker.register_polled(&p0, 6);
    tracker.register_polled(&p1, 51);

    tracker.release_completed(&p1, 50);
    tracker.release_completed(&p0, 6);

    let staged = tracker.drain_commitable();
    assert_eq!(staged.get(&p0), None, "p0 head is still in flight");
    assert_eq!(staged.get(&p1), Some(&51));
}

#[test]
fn test_rebalance_redelivery_of_committed_offset_is_ignored() {
    let tracker = OffsetTracker::new("b1");
    let p = partition(0);

    tracker.register_polled(&p, 30);
    tracker.release_completed(&p, 30);
    assert_eq!(tracker.drain_commitable().get(&p), Some(&31));

    // After a rebalance another node may complete a copy we committed past.
    tracker.release_completed(&p, 30);
    assert!(tracker.drain_commitable().is_empty());
    assert_eq!(tracker.stats().polled, 0);
}

#[test]
fn test_concurrent_release_and_register() {
    use std::sync::Arc;
    use std::thread;

    let tracker = Arc::new(OffsetTracker::new("b1"));
    let p = partition(0);

    for offset in 0..100 {
        tracker.register_polled(&p, offset);
    }

    let mut handles = vec![];
    for chunk in 0..4 {
        let tracker = tracker.clone();
        let p = p.clone();
        handles.push(thread::spawn(move || {
            for offset in (chunk * 25)..((chunk + 1) * 25) {
                tracker.release_completed(&p, offset);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // All 100 completed; exactly one staged entry pointing past the batch.
    let staged = tracker.drain_commitable();
    assert_eq!(staged.get(&p), Some(&100));
    let stats = tracker.stats();
    assert_eq!(stats.polled, 0);
    assert_eq!(stats.completed, 0);
}
