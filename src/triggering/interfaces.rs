//! Collaborator seams of the triggering engine.
//!
//! Task persistence, handler resolution and the actual task execution live
//! outside this crate; the engine talks to them through these traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::kafka::types::Partition;
use crate::triggering::task::{BaseTask, TaskStatus};

/// Task persistence operations the trigger path needs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Compare-and-set the task status. Returns false when the stored
    /// version no longer matches `expected_version`.
    async fn set_status(&self, id: Uuid, status: TaskStatus, expected_version: i64) -> bool;
}

/// Resolves a task to the handler that will execute it.
pub trait TaskHandlerRegistry: Send + Sync {
    fn task_handler(&self, task: &BaseTask) -> Option<Arc<dyn TaskHandler>>;
}

/// The slice of a task handler the triggerer cares about: its processing
/// policy, i.e. which bucket the task runs in.
pub trait TaskHandler: Send + Sync {
    fn processing_bucket(&self, task: &BaseTask) -> String;
}

/// Seam for the no-active-transaction assertion in `trigger`.
pub trait TransactionContext: Send + Sync {
    fn is_transaction_active(&self) -> bool;
}

/// Where a triggering came from. Kafka-sourced triggerings carry the record
/// coordinates needed for offset release; same-process triggerings bypass
/// offset tracking entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    SameProcess,
    Kafka { partition: Partition, offset: i64 },
}

/// A task handed to the processing service, with enough context to release
/// its offset once processing finishes.
#[derive(Debug, Clone)]
pub struct TaskTriggering {
    pub task: BaseTask,
    pub bucket_id: String,
    pub source: TriggerSource,
}

impl TaskTriggering {
    pub fn same_process(task: BaseTask, bucket_id: String) -> Self {
        Self {
            task,
            bucket_id,
            source: TriggerSource::SameProcess,
        }
    }

    pub fn from_kafka(task: BaseTask, bucket_id: String, partition: Partition, offset: i64) -> Self {
        Self {
            task,
            bucket_id,
            source: TriggerSource::Kafka { partition, offset },
        }
    }

    pub fn is_same_process_trigger(&self) -> bool {
        matches!(self.source, TriggerSource::SameProcess)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTaskResponse {
    Ok,
    /// The processing stage has no room; the caller must back off and retry.
    Full,
}

/// Invoked by the processing service when a triggered task finishes, so the
/// triggerer can release the record's offset.
pub trait TriggeringFinishedListener: Send + Sync {
    fn triggering_finished(&self, triggering: &TaskTriggering);
}

/// The downstream task-processing service.
#[async_trait]
pub trait ProcessingService: Send + Sync {
    async fn add_task_for_processing(&self, triggering: TaskTriggering) -> AddTaskResponse;

    /// Register the listener to invoke whenever a triggered task finishes.
    fn add_triggering_finished_listener(&self, listener: Arc<dyn TriggeringFinishedListener>);
}

/// Per-bucket configuration.
#[derive(Debug, Clone)]
pub struct BucketProperties {
    pub triggering_topic_partitions_count: i32,
    pub triggers_fetch_size: usize,
    pub trigger_in_same_process: bool,
    /// When set, every node forms its own consumer group for this bucket so
    /// all nodes receive every trigger.
    pub trigger_same_task_in_all_nodes: bool,
    pub auto_reset_offset_to_duration: Option<Duration>,
    pub auto_start_processing: bool,
}

impl Default for BucketProperties {
    fn default() -> Self {
        Self {
            triggering_topic_partitions_count: 1,
            triggers_fetch_size: 100,
            trigger_in_same_process: false,
            trigger_same_task_in_all_nodes: false,
            auto_reset_offset_to_duration: None,
            auto_start_processing: true,
        }
    }
}

pub const DEFAULT_BUCKET_ID: &str = "default";

/// Static registry of configured buckets. Bucket configuration loading is
/// the caller's concern; this just answers lookups.
pub struct BucketsManager {
    buckets: HashMap<String, BucketProperties>,
}

impl BucketsManager {
    pub fn new(default_bucket: BucketProperties) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(DEFAULT_BUCKET_ID.to_string(), default_bucket);
        Self { buckets }
    }

    pub fn with_bucket(mut self, bucket_id: impl Into<String>, props: BucketProperties) -> Self {
        self.buckets.insert(bucket_id.into(), props);
        self
    }

    pub fn is_configured_bucket(&self, bucket_id: &str) -> bool {
        self.buckets.contains_key(bucket_id)
    }

    pub fn bucket_properties(&self, bucket_id: &str) -> Option<&BucketProperties> {
        self.buckets.get(bucket_id)
    }

    pub fn bucket_ids(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }
}
