pub mod interfaces;
pub mod processing_state;
pub mod task;
pub mod triggerer;

pub use interfaces::{
    AddTaskResponse, BucketProperties, BucketsManager, ProcessingService, TaskHandler,
    TaskHandlerRegistry, TaskStore, TaskTriggering, TransactionContext, TriggerSource,
    TriggeringFinishedListener, DEFAULT_BUCKET_ID,
};
pub use processing_state::{BucketCapacity, ProcessingState};
pub use task::{BaseTask, TaskStatus};
pub use triggerer::{KafkaTaskTriggerer, TasksProcessingState, TriggererDependencies};
