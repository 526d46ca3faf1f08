pub mod consumer_bucket;
pub mod consumer_context;
pub mod offset_tracker;
pub mod producer;
pub mod topics;
pub mod types;

pub use consumer_bucket::{ConsumerBucket, ConsumerBucketStats};
pub use consumer_context::TriggerConsumerContext;
pub use offset_tracker::{OffsetTracker, OffsetTrackerStats};
pub use producer::{TriggerProduceError, TriggerProducer};
pub use types::Partition;
