//! Kafka-backed task execution triggerer.
//!
//! Converts durable "task available" signals flowing through Kafka into
//! in-process handoffs to a task-processing service, with at-least-once
//! delivery, per-bucket lifecycle and offsets committed strictly as a
//! contiguous completed prefix per partition.

pub mod config;
pub mod kafka;
pub mod metrics_const;
pub mod test_utils;
pub mod throttle;
pub mod triggering;

pub use config::{Config, TriggeringConfig};
pub use triggering::{
    AddTaskResponse, BaseTask, BucketProperties, BucketsManager, KafkaTaskTriggerer,
    ProcessingService, ProcessingState, TaskHandler, TaskHandlerRegistry, TaskStatus, TaskStore,
    TaskTriggering, TasksProcessingState, TriggerSource, TriggererDependencies,
    TriggeringFinishedListener, DEFAULT_BUCKET_ID,
};
