use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::kafka::consumer_bucket::register_commit_error;
use crate::throttle::LogThrottler;

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer context for a bucket's trigger consumer.
///
/// Handles the commit callback for async commits and, when the bucket is
/// configured with an offset-reset lookback, seeks every newly assigned
/// partition to the offset matching `now - lookback`.
pub struct TriggerConsumerContext {
    bucket_id: String,
    seek_to_duration: Option<Duration>,
    throttler: Arc<LogThrottler>,
    // rdkafka's rebalance callbacks don't hand back the owning consumer, so
    // the consumer registers a weak handle to itself right after creation
    // (see `bind_consumer`) for the seek-by-timestamp lookback to use.
    consumer_handle: OnceLock<Weak<StreamConsumer<Self>>>,
}

impl TriggerConsumerContext {
    pub fn new(
        bucket_id: impl Into<String>,
        seek_to_duration: Option<Duration>,
        throttler: Arc<LogThrottler>,
    ) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            seek_to_duration,
            throttler,
            consumer_handle: OnceLock::new(),
        }
    }

    /// Registers the owning consumer so rebalance callbacks can seek it.
    pub fn bind_consumer(&self, consumer: &Arc<StreamConsumer<Self>>) {
        let _ = self.consumer_handle.set(Arc::downgrade(consumer));
    }

    fn seek_to_time(
        &self,
        consumer: &StreamConsumer<Self>,
        assigned: &TopicPartitionList,
        lookback: Duration,
    ) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let target_ms = now.saturating_sub(lookback).as_millis() as i64;

        let mut query = TopicPartitionList::new();
        for elem in assigned.elements() {
            if let Err(error) =
                query.add_partition_offset(elem.topic(), elem.partition(), Offset::Offset(target_ms))
            {
                warn!(
                    bucket = %self.bucket_id,
                    topic = elem.topic(),
                    partition = elem.partition(),
                    %error,
                    "Skipping timestamp lookup for assigned partition"
                );
            }
        }

        let resolved = match consumer.offsets_for_times(query, SEEK_TIMEOUT) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(
                    bucket = %self.bucket_id,
                    %error,
                    "Offset-for-timestamp lookup failed; leaving assigned partitions untouched"
                );
                return;
            }
        };

        for elem in resolved.elements() {
            // Partitions with no record at or after the timestamp fall back
            // to the earliest offset.
            let target = match elem.offset() {
                Offset::Offset(offset) => Offset::Offset(offset),
                _ => Offset::Beginning,
            };
            match consumer.seek(elem.topic(), elem.partition(), target, SEEK_TIMEOUT) {
                Ok(()) => debug!(
                    bucket = %self.bucket_id,
                    topic = elem.topic(),
                    partition = elem.partition(),
                    offset = ?target,
                    "Seeked assigned partition"
                ),
                Err(error) => warn!(
                    bucket = %self.bucket_id,
                    topic = elem.topic(),
                    partition = elem.partition(),
                    %error,
                    "Seeking assigned partition failed"
                ),
            }
        }
    }
}

impl ClientContext for TriggerConsumerContext {}

impl ConsumerContext for TriggerConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(
                bucket = %self.bucket_id,
                count = partitions.count(),
                "Revoking partitions"
            );
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(
                    bucket = %self.bucket_id,
                    count = partitions.count(),
                    "Assigned partitions"
                );
                if let Some(lookback) = self.seek_to_duration {
                    if partitions.count() > 0 {
                        if let Some(consumer) =
                            self.consumer_handle.get().and_then(Weak::upgrade)
                        {
                            self.seek_to_time(&consumer, partitions, lookback);
                        }
                    }
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(error) => {
                warn!(bucket = %self.bucket_id, %error, "Rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(
                bucket = %self.bucket_id,
                count = offsets.count(),
                "Committed offsets"
            ),
            Err(error) => register_commit_error(&self.bucket_id, &error, &self.throttler),
        }
    }
}
