//! Mock collaborators and fixtures shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::TriggeringConfig;
use crate::triggering::interfaces::{
    AddTaskResponse, BucketProperties, BucketsManager, ProcessingService, TaskHandler,
    TaskHandlerRegistry, TaskStore, TaskTriggering, TriggeringFinishedListener,
};
use crate::triggering::processing_state::ProcessingState;
use crate::triggering::task::{BaseTask, TaskStatus};
use crate::triggering::triggerer::{KafkaTaskTriggerer, TriggererDependencies};

pub fn test_task(task_type: &str) -> BaseTask {
    BaseTask {
        id: Uuid::new_v4(),
        version: 0,
        task_type: task_type.to_string(),
        priority: 5,
        status: "WAITING".to_string(),
    }
}

pub fn test_triggering_config() -> TriggeringConfig {
    TriggeringConfig {
        bootstrap_servers: "localhost:9092".to_string(),
        group_id: "test-tasks".to_string(),
        client_id: "test-node".to_string(),
        topics_namespace: None,
        data_center_prefixes: String::new(),
        auto_reset_offset_to: "earliest".to_string(),
        generic_medium_delay: Duration::from_millis(50),
        kafka_properties: Vec::new(),
        kafka_tls: false,
        assertions_enabled: false,
    }
}

/// Default bucket plus `b1` (plain) and `inline` (same-process handoff).
pub fn test_buckets_manager() -> BucketsManager {
    BucketsManager::new(BucketProperties::default())
        .with_bucket(
            "b1",
            BucketProperties {
                auto_start_processing: false,
                ..BucketProperties::default()
            },
        )
        .with_bucket(
            "inline",
            BucketProperties {
                trigger_in_same_process: true,
                auto_start_processing: false,
                ..BucketProperties::default()
            },
        )
}

pub fn test_triggerer(
    registry: StaticHandlerRegistry,
    default_response: AddTaskResponse,
) -> (
    Arc<KafkaTaskTriggerer>,
    Arc<ScriptedProcessingService>,
    Arc<RecordingTaskStore>,
) {
    let processing = Arc::new(ScriptedProcessingService::new(default_response));
    let store = Arc::new(RecordingTaskStore::default());
    let triggerer = KafkaTaskTriggerer::new(
        test_triggering_config(),
        TriggererDependencies {
            task_store: store.clone(),
            handler_registry: Arc::new(registry),
            buckets_manager: Arc::new(test_buckets_manager()),
            processing: processing.clone(),
            processing_state: Arc::new(ProcessingState::new()),
            transactions: None,
        },
    )
    .expect("failed to build test triggerer");
    (triggerer, processing, store)
}

/// Task store that records every status change.
#[derive(Default)]
pub struct RecordingTaskStore {
    status_changes: Mutex<Vec<(Uuid, TaskStatus, i64)>>,
    reject_status_change: AtomicBool,
}

impl RecordingTaskStore {
    pub fn reject_status_changes(&self) {
        self.reject_status_change.store(true, Ordering::SeqCst);
    }

    pub fn status_changes(&self) -> Vec<(Uuid, TaskStatus, i64)> {
        self.status_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskStore for RecordingTaskStore {
    async fn set_status(&self, id: Uuid, status: TaskStatus, expected_version: i64) -> bool {
        self.status_changes
            .lock()
            .unwrap()
            .push((id, status, expected_version));
        !self.reject_status_change.load(Ordering::SeqCst)
    }
}

/// Registry mapping task types straight to bucket ids.
#[derive(Default)]
pub struct StaticHandlerRegistry {
    handlers: HashMap<String, String>,
}

impl StaticHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, task_type: &str, bucket_id: &str) -> Self {
        self.handlers
            .insert(task_type.to_string(), bucket_id.to_string());
        self
    }
}

struct StaticBucketHandler {
    bucket_id: String,
}

impl TaskHandler for StaticBucketHandler {
    fn processing_bucket(&self, _task: &BaseTask) -> String {
        self.bucket_id.clone()
    }
}

impl TaskHandlerRegistry for StaticHandlerRegistry {
    fn task_handler(&self, task: &BaseTask) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task.task_type).map(|bucket_id| {
            Arc::new(StaticBucketHandler {
                bucket_id: bucket_id.clone(),
            }) as Arc<dyn TaskHandler>
        })
    }
}

/// Processing service with scripted responses; records every handoff and
/// lets tests drive the completion listener.
pub struct ScriptedProcessingService {
    default_response: Mutex<AddTaskResponse>,
    scripted: Mutex<VecDeque<AddTaskResponse>>,
    received: Mutex<Vec<TaskTriggering>>,
    listener: Mutex<Option<Arc<dyn TriggeringFinishedListener>>>,
}

impl ScriptedProcessingService {
    pub fn new(default_response: AddTaskResponse) -> Self {
        Self {
            default_response: Mutex::new(default_response),
            scripted: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn set_default_response(&self, response: AddTaskResponse) {
        *self.default_response.lock().unwrap() = response;
    }

    pub fn enqueue_response(&self, response: AddTaskResponse) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn received(&self) -> Vec<TaskTriggering> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Invoke the registered completion listener, as the real processing
    /// service does when a triggered task finishes.
    pub fn finish(&self, triggering: &TaskTriggering) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.triggering_finished(triggering);
        }
    }
}

#[async_trait]
impl ProcessingService for ScriptedProcessingService {
    async fn add_task_for_processing(&self, triggering: TaskTriggering) -> AddTaskResponse {
        self.received.lock().unwrap().push(triggering);
        self.scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_response.lock().unwrap())
    }

    fn add_triggering_finished_listener(&self, listener: Arc<dyn TriggeringFinishedListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}
