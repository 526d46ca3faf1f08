//! Per-bucket consumer state and commit policy.
//!
//! The rdkafka consumer handle itself lives in the poll session and is only
//! touched from there; this struct carries everything that outlives a
//! session: the offset tracker, commit pacing and gauge backing.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, error, warn};

use crate::config::TriggeringConfig;
use crate::kafka::consumer_context::TriggerConsumerContext;
use crate::kafka::offset_tracker::{OffsetTracker, OffsetTrackerStats};
use crate::kafka::topics::base_client_config;
use crate::metrics_const::{COMMITS, FAILED_COMMITS};
use crate::throttle::LogThrottler;
use crate::triggering::interfaces::BucketProperties;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerBucketStats {
    pub offsets: OffsetTrackerStats,
    pub unprocessed_fetched_records: i64,
}

pub struct ConsumerBucket {
    bucket_id: String,
    topics: Vec<String>,
    tracker: OffsetTracker,
    last_commit_time: Mutex<Instant>,
    unprocessed_fetched_records: AtomicI64,
    topic_configured: AtomicBool,
}

impl ConsumerBucket {
    pub fn new(bucket_id: impl Into<String>, topics: Vec<String>) -> Self {
        let bucket_id = bucket_id.into();
        Self {
            tracker: OffsetTracker::new(bucket_id.clone()),
            bucket_id,
            topics,
            last_commit_time: Mutex::new(Instant::now()),
            unprocessed_fetched_records: AtomicI64::new(0),
            topic_configured: AtomicBool::new(false),
        }
    }

    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }

    pub fn topic_configured(&self) -> bool {
        self.topic_configured.load(Ordering::SeqCst)
    }

    pub fn mark_topic_configured(&self) {
        self.topic_configured.store(true, Ordering::SeqCst);
    }

    pub fn set_unprocessed_fetched_records(&self, count: i64) {
        self.unprocessed_fetched_records
            .store(count, Ordering::SeqCst);
    }

    pub fn decrement_unprocessed_fetched_records(&self) {
        self.unprocessed_fetched_records
            .fetch_sub(1, Ordering::SeqCst);
    }

    pub fn unprocessed_fetched_records(&self) -> i64 {
        self.unprocessed_fetched_records.load(Ordering::SeqCst)
    }

    /// Snapshot-safe view for metrics and introspection.
    pub fn stats(&self) -> ConsumerBucketStats {
        ConsumerBucketStats {
            offsets: self.tracker.stats(),
            unprocessed_fetched_records: self.unprocessed_fetched_records(),
        }
    }

    /// Commit the staged offsets if any.
    ///
    /// Non-finalizing commits are async and paced: at most one per
    /// `commit_interval`, so fast empty polls do not hammer the broker.
    /// The final commit at consumer close is synchronous. The staging map
    /// is consumed either way; offsets that fail to commit are simply
    /// re-polled after the next rebalance.
    pub fn commit_offsets(
        &self,
        consumer: &StreamConsumer<TriggerConsumerContext>,
        finalize: bool,
        commit_interval: Duration,
        throttler: &LogThrottler,
    ) {
        if !finalize && self.last_commit_time.lock().unwrap().elapsed() < commit_interval {
            return;
        }

        let staged = self.tracker.drain_commitable();
        if staged.is_empty() {
            return;
        }

        metrics::counter!(COMMITS, "bucket" => self.bucket_id.clone()).increment(1);

        let mut tpl = TopicPartitionList::new();
        for (partition, next_offset) in &staged {
            debug!(
                bucket = %self.bucket_id,
                partition = %partition,
                offset = next_offset,
                "Committing offset"
            );
            if let Err(error) = tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            ) {
                warn!(
                    bucket = %self.bucket_id,
                    partition = %partition,
                    %error,
                    "Skipping invalid commit entry"
                );
            }
        }

        let mode = if finalize {
            CommitMode::Sync
        } else {
            CommitMode::Async
        };
        // Async commit errors are delivered through the consumer context's
        // commit callback; only sync commits can fail here.
        if let Err(error) = consumer.commit(&tpl, mode) {
            register_commit_error(&self.bucket_id, &error, throttler);
        }

        *self.last_commit_time.lock().unwrap() = Instant::now();
    }
}

/// Build a bucket's trigger consumer. When the bucket triggers the same task
/// on all nodes, the node-unique client id joins the group id so every node
/// forms its own consumer group and receives every partition.
pub fn create_trigger_consumer(
    config: &TriggeringConfig,
    bucket_id: &str,
    props: &BucketProperties,
    throttler: Arc<LogThrottler>,
) -> Result<Arc<StreamConsumer<TriggerConsumerContext>>, KafkaError> {
    let group_id = if props.trigger_same_task_in_all_nodes {
        format!("{}.{}", config.group_id, config.client_id)
    } else {
        config.group_id.clone()
    };

    let mut client_config: ClientConfig = base_client_config(config);
    client_config
        .set("group.id", group_id)
        .set(
            "client.id",
            format!("{}.task-triggerer.bucket.{}", config.client_id, bucket_id),
        )
        .set("enable.auto.commit", "false")
        .set("partition.assignment.strategy", "cooperative-sticky")
        .set("reconnect.backoff.ms", "100")
        .set("reconnect.backoff.max.ms", "5000");
    for (key, value) in &config.kafka_properties {
        client_config.set(key, value);
    }
    // With an offset-reset lookback the consumer context seeks assigned
    // partitions by timestamp instead of relying on auto.offset.reset.
    if props.auto_reset_offset_to_duration.is_none() {
        client_config.set("auto.offset.reset", &config.auto_reset_offset_to);
    }

    let context = TriggerConsumerContext::new(
        bucket_id,
        props.auto_reset_offset_to_duration,
        throttler,
    );
    let consumer: StreamConsumer<TriggerConsumerContext> =
        client_config.create_with_context(context)?;
    let consumer = Arc::new(consumer);
    consumer.context().bind_consumer(&consumer);
    Ok(consumer)
}

/// Rebalances, reassignments, generation changes and other retriable broker
/// conditions are normal around group churn: count them and keep the detail
/// at debug. Anything else is a real error, throttled.
pub(crate) fn register_commit_error(
    bucket_id: &str,
    error: &KafkaError,
    throttler: &LogThrottler,
) {
    if is_transient_commit_error(error) {
        metrics::counter!(FAILED_COMMITS, "bucket" => bucket_id.to_string()).increment(1);
        debug!(bucket = bucket_id, %error, "Committing Kafka offsets failed");
        return;
    }

    if throttler.allow() {
        error!(bucket = bucket_id, %error, "Committing Kafka offsets failed");
    } else {
        debug!(bucket = bucket_id, %error, "Committing Kafka offsets failed");
    }
}

pub(crate) fn is_transient_commit_error(error: &KafkaError) -> bool {
    let code = match error {
        KafkaError::ConsumerCommit(code) => *code,
        KafkaError::Global(code) => *code,
        _ => return false,
    };
    matches!(
        code,
        RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::ReassignmentInProgress
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebalance_class_commit_errors_are_transient() {
        for code in [
            RDKafkaErrorCode::RebalanceInProgress,
            RDKafkaErrorCode::ReassignmentInProgress,
            RDKafkaErrorCode::IllegalGeneration,
            RDKafkaErrorCode::UnknownMemberId,
            RDKafkaErrorCode::RequestTimedOut,
        ] {
            assert!(
                is_transient_commit_error(&KafkaError::ConsumerCommit(code)),
                "{code} should be transient"
            );
        }
    }

    #[test]
    fn test_unknown_commit_errors_are_not_transient() {
        assert!(!is_transient_commit_error(&KafkaError::ConsumerCommit(
            RDKafkaErrorCode::GroupAuthorizationFailed
        )));
        assert!(!is_transient_commit_error(&KafkaError::ConsumerCommit(
            RDKafkaErrorCode::InvalidCommitOffsetSize
        )));
        assert!(!is_transient_commit_error(&KafkaError::Canceled));
    }

    #[test]
    fn test_register_commit_error_does_not_panic() {
        let throttler = LogThrottler::default();
        register_commit_error(
            "b1",
            &KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress),
            &throttler,
        );
        register_commit_error(
            "b1",
            &KafkaError::ConsumerCommit(RDKafkaErrorCode::GroupAuthorizationFailed),
            &throttler,
        );
    }

    #[test]
    fn test_unprocessed_fetched_records_counting() {
        let bucket = ConsumerBucket::new("b1", vec!["t".to_string()]);

        bucket.set_unprocessed_fetched_records(3);
        bucket.decrement_unprocessed_fetched_records();
        assert_eq!(bucket.unprocessed_fetched_records(), 2);

        let stats = bucket.stats();
        assert_eq!(stats.unprocessed_fetched_records, 2);
        assert_eq!(stats.offsets.polled, 0);
    }
}
