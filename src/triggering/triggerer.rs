//! The triggering engine: `trigger` entry point, per-bucket poll loops and
//! the processing lifecycle state machine.
//!
//! Each started bucket runs one worker task that owns its Kafka consumer for
//! the duration of a poll session; everything other threads need from the
//! bucket goes through the consumer bucket's snapshot accessors or the
//! bucket's cancellation token. Workers self-heal: any session error closes
//! the consumer, sleeps one delay and reopens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TriggeringConfig;
use crate::kafka::consumer_bucket::{
    create_trigger_consumer, ConsumerBucket, ConsumerBucketStats,
};
use crate::kafka::consumer_context::TriggerConsumerContext;
use crate::kafka::producer::TriggerProducer;
use crate::kafka::topics::ensure_topic_partitions;
use crate::kafka::types::Partition;
use crate::metrics_const::{
    FAILED_STATUS_CHANGES, OFFSETS_COMPLETED, OFFSETS_OUTSTANDING, OFFSETS_TO_BE_COMMITTED,
    POLLING_BUCKETS, TASKS_MARKED_ERROR, TRIGGERS_RECEIVED, UNPROCESSED_FETCHED_RECORDS,
};
use crate::throttle::LogThrottler;
use crate::triggering::interfaces::{
    AddTaskResponse, BucketsManager, ProcessingService, TaskHandlerRegistry, TaskStore,
    TaskTriggering, TransactionContext, TriggerSource, TriggeringFinishedListener,
    DEFAULT_BUCKET_ID,
};
use crate::triggering::processing_state::{BucketCapacity, ProcessingState};
use crate::triggering::task::{BaseTask, TaskStatus};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// The slice of the consumer surface the backpressure wait drives. The poll
/// session hands its real consumer in; tests script one.
#[async_trait]
trait BackpressureConsumer: Send + Sync {
    async fn recv_message(&self) -> KafkaResult<OwnedMessage>;
    fn current_assignment(&self) -> KafkaResult<TopicPartitionList>;
    fn pause_partitions(&self, partitions: &TopicPartitionList) -> KafkaResult<()>;
    fn resume_partitions(&self, partitions: &TopicPartitionList) -> KafkaResult<()>;
    fn seek_back(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()>;
}

#[async_trait]
impl BackpressureConsumer for StreamConsumer<TriggerConsumerContext> {
    async fn recv_message(&self) -> KafkaResult<OwnedMessage> {
        self.recv().await.map(|message| message.detach())
    }

    fn current_assignment(&self) -> KafkaResult<TopicPartitionList> {
        self.assignment()
    }

    fn pause_partitions(&self, partitions: &TopicPartitionList) -> KafkaResult<()> {
        self.pause(partitions)
    }

    fn resume_partitions(&self, partitions: &TopicPartitionList) -> KafkaResult<()> {
        self.resume(partitions)
    }

    fn seek_back(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
        self.seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TasksProcessingState {
    Stopped,
    Started,
    StopInProgress,
}

struct ProcessingBucket {
    state: TasksProcessingState,
    stop_tx: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl ProcessingBucket {
    fn new() -> Self {
        Self {
            state: TasksProcessingState::Stopped,
            stop_tx: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// External collaborators of the triggerer.
pub struct TriggererDependencies {
    pub task_store: Arc<dyn TaskStore>,
    pub handler_registry: Arc<dyn TaskHandlerRegistry>,
    pub buckets_manager: Arc<BucketsManager>,
    pub processing: Arc<dyn ProcessingService>,
    pub processing_state: Arc<ProcessingState>,
    pub transactions: Option<Arc<dyn TransactionContext>>,
}

pub struct KafkaTaskTriggerer {
    // Handle to the owning Arc, for spawning bucket workers from &self.
    self_handle: Weak<KafkaTaskTriggerer>,
    config: TriggeringConfig,
    producer: TriggerProducer,
    task_store: Arc<dyn TaskStore>,
    handler_registry: Arc<dyn TaskHandlerRegistry>,
    buckets_manager: Arc<BucketsManager>,
    processing: Arc<dyn ProcessingService>,
    processing_state: Arc<ProcessingState>,
    transactions: Option<Arc<dyn TransactionContext>>,
    consumer_buckets: DashMap<String, Arc<ConsumerBucket>>,
    processing_buckets: Mutex<HashMap<String, ProcessingBucket>>,
    polling_buckets: AtomicI64,
    active_workers: AtomicUsize,
    shutting_down: AtomicBool,
    throttler: Arc<LogThrottler>,
}

impl KafkaTaskTriggerer {
    pub fn new(config: TriggeringConfig, deps: TriggererDependencies) -> Result<Arc<Self>> {
        let throttler = Arc::new(LogThrottler::default());
        let producer = TriggerProducer::new(&config, throttler.clone())
            .context("failed to create trigger producer")?;

        let triggerer = Arc::new_cyclic(|self_handle| Self {
            self_handle: self_handle.clone(),
            config,
            producer,
            task_store: deps.task_store,
            handler_registry: deps.handler_registry,
            buckets_manager: deps.buckets_manager,
            processing: deps.processing,
            processing_state: deps.processing_state,
            transactions: deps.transactions,
            consumer_buckets: DashMap::new(),
            processing_buckets: Mutex::new(HashMap::new()),
            polling_buckets: AtomicI64::new(0),
            active_workers: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            throttler,
        });
        triggerer
            .processing
            .add_triggering_finished_listener(triggerer.clone());
        Ok(triggerer)
    }

    /// Make a persisted task eligible for execution.
    ///
    /// Resolves the handler and its processing bucket, optionally attempts a
    /// same-process handoff, and otherwise publishes a trigger message to the
    /// bucket's topic. Tasks with no handler or an unconfigured bucket are
    /// marked ERROR instead.
    pub async fn trigger(&self, task: &BaseTask) {
        if self.config.assertions_enabled {
            if let Some(transactions) = &self.transactions {
                assert!(
                    !transactions.is_transaction_active(),
                    "trigger called inside an active transaction"
                );
            }
        }

        let Some(handler) = self.handler_registry.task_handler(task) else {
            error!(
                task = %task.version_id(),
                task_type = %task.task_type,
                "Marking task as ERROR, no task handler found"
            );
            self.mark_task_as_error(task, None).await;
            return;
        };

        let bucket_id = handler.processing_bucket(task);
        if !self.buckets_manager.is_configured_bucket(&bucket_id) {
            error!(
                task = %task.version_id(),
                bucket = %bucket_id,
                "Marking task as ERROR, task handler has unknown bucket"
            );
            self.mark_task_as_error(task, Some(&bucket_id)).await;
            return;
        }

        let same_process = self
            .buckets_manager
            .bucket_properties(&bucket_id)
            .map(|props| props.trigger_in_same_process)
            .unwrap_or(false);
        if same_process {
            let triggering = TaskTriggering::same_process(task.clone(), bucket_id.clone());
            if self.processing.add_task_for_processing(triggering).await == AddTaskResponse::Ok {
                return;
            }
            // No room in this node; fall through to the broker path.
        }

        let topic = self.config.trigger_topic(&bucket_id);
        if let Err(error) = self.producer.send_trigger(&topic, task) {
            error!(task = %task.version_id(), %error, "Task triggering failed");
        }
    }

    async fn mark_task_as_error(&self, task: &BaseTask, bucket_id: Option<&str>) {
        metrics::counter!(
            TASKS_MARKED_ERROR,
            "bucket" => bucket_id.unwrap_or("unknown").to_string(),
            "task_type" => task.task_type.clone()
        )
        .increment(1);

        if !self
            .task_store
            .set_status(task.id, TaskStatus::Error, task.version)
            .await
        {
            metrics::counter!(
                FAILED_STATUS_CHANGES,
                "task_type" => task.task_type.clone(),
                "from_status" => TaskStatus::Unknown.as_str(),
                "to_status" => TaskStatus::Error.as_str()
            )
            .increment(1);
            error!(
                task = %task.version_id(),
                "Marking task as ERROR failed, version may have changed"
            );
        }
    }

    /// Snapshot of a bucket's offset-tracking depth, for metrics readers.
    pub fn consumer_bucket_stats(&self, bucket_id: &str) -> Option<ConsumerBucketStats> {
        self.consumer_buckets.get(bucket_id).map(|b| b.stats())
    }

    // ==== lifecycle ====

    /// Start every configured bucket that wants auto-start.
    pub fn application_started(&self) {
        let bucket_ids: Vec<String> = self
            .buckets_manager
            .bucket_ids()
            .filter(|bucket_id| {
                self.buckets_manager
                    .bucket_properties(bucket_id)
                    .map(|props| props.auto_start_processing)
                    .unwrap_or(false)
            })
            .map(str::to_string)
            .collect();

        let mut buckets = self.processing_buckets.lock().unwrap();
        for bucket_id in bucket_ids {
            if Self::bucket_entry(&mut buckets, &bucket_id).state == TasksProcessingState::Stopped {
                self.start_bucket_processing(&mut buckets, &bucket_id);
            }
        }
    }

    pub fn start_tasks_processing(&self, bucket_id: Option<&str>) {
        let bucket_id = resolve_bucket_id(bucket_id);
        let mut buckets = self.processing_buckets.lock().unwrap();
        if Self::bucket_entry(&mut buckets, bucket_id).state == TasksProcessingState::Stopped {
            self.start_bucket_processing(&mut buckets, bucket_id);
        }
    }

    /// Request a bucket stop. The returned receiver resolves once the
    /// worker has exited its poll loop and closed the consumer; a bucket
    /// that is not started resolves immediately.
    pub fn stop_tasks_processing(&self, bucket_id: Option<&str>) -> oneshot::Receiver<()> {
        let bucket_id = resolve_bucket_id(bucket_id);
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut buckets = self.processing_buckets.lock().unwrap();
        let entry = Self::bucket_entry(&mut buckets, bucket_id);
        if entry.state != TasksProcessingState::Started {
            let _ = stop_tx.send(());
            return stop_rx;
        }
        entry.state = TasksProcessingState::StopInProgress;
        entry.stop_tx = Some(stop_tx);
        entry.cancel.cancel();
        stop_rx
    }

    pub fn get_tasks_processing_state(&self, bucket_id: Option<&str>) -> TasksProcessingState {
        let bucket_id = resolve_bucket_id(bucket_id);
        self.processing_buckets
            .lock()
            .unwrap()
            .get(bucket_id)
            .map(|bucket| bucket.state)
            .unwrap_or(TasksProcessingState::Stopped)
    }

    pub fn prepare_for_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let buckets = self.processing_buckets.lock().unwrap();
        for bucket in buckets.values() {
            bucket.cancel.cancel();
        }
    }

    pub fn can_shutdown(&self) -> bool {
        self.active_workers.load(Ordering::SeqCst) == 0
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn bucket_entry<'a>(
        buckets: &'a mut HashMap<String, ProcessingBucket>,
        bucket_id: &str,
    ) -> &'a mut ProcessingBucket {
        buckets
            .entry(bucket_id.to_string())
            .or_insert_with(ProcessingBucket::new)
    }

    fn start_bucket_processing(
        &self,
        buckets: &mut HashMap<String, ProcessingBucket>,
        bucket_id: &str,
    ) {
        // The worker needs an owning handle; upgrading cannot fail while
        // &self is alive.
        let Some(this) = self.self_handle.upgrade() else {
            return;
        };

        let cancel = CancellationToken::new();
        let entry = Self::bucket_entry(buckets, bucket_id);
        entry.state = TasksProcessingState::Started;
        entry.cancel = cancel.clone();
        entry.stop_tx = None;

        self.active_workers.fetch_add(1, Ordering::SeqCst);
        let bucket_id = bucket_id.to_string();
        let started_bucket_id = bucket_id.clone();
        tokio::spawn(async move {
            while !this.is_shutting_down()
                && this.get_tasks_processing_state(Some(bucket_id.as_str()))
                    == TasksProcessingState::Started
            {
                if let Err(error) = this.poll(&bucket_id, &cancel).await {
                    error!(
                        bucket = %bucket_id,
                        "Triggers poll loop failed, restarting: {error:#}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(this.config.generic_medium_delay) => {}
                    }
                }
            }

            let stop_tx = {
                let mut buckets = this.processing_buckets.lock().unwrap();
                let entry = Self::bucket_entry(&mut buckets, &bucket_id);
                entry.state = TasksProcessingState::Stopped;
                entry.stop_tx.take()
            };
            if let Some(stop_tx) = stop_tx {
                let _ = stop_tx.send(());
            }
            this.active_workers.fetch_sub(1, Ordering::SeqCst);
            info!(bucket = %bucket_id, "Stopped triggers processing");
        });
        info!(bucket = %started_bucket_id, "Started triggers processing");
    }

    // ==== poll loop ====

    async fn poll(&self, bucket_id: &str, cancel: &CancellationToken) -> Result<()> {
        info!(bucket = %bucket_id, "Started to listen for task triggers");
        let polling = self.polling_buckets.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(POLLING_BUCKETS).set(polling as f64);

        // Consumer setup talks to brokers; a stop request must not wait on
        // an unreachable cluster.
        let session = tokio::select! {
            _ = cancel.cancelled() => None,
            session = self.open_consumer_session(bucket_id) => Some(session),
        };

        let result = match session {
            None => Ok(()),
            Some(Err(error)) => Err(error),
            Some(Ok((bucket, consumer))) => {
                let result = self.poll_session(&bucket, &consumer, cancel).await;
                // Final sync commit, then unsubscribe promptly so other
                // nodes can take the partitions over.
                bucket.commit_offsets(
                    &consumer,
                    true,
                    self.config.generic_medium_delay,
                    &self.throttler,
                );
                consumer.unsubscribe();
                info!(bucket = %bucket_id, "Closed Kafka consumer");
                result
            }
        };

        let polling = self.polling_buckets.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!(POLLING_BUCKETS).set(polling as f64);
        result
    }

    async fn open_consumer_session(
        &self,
        bucket_id: &str,
    ) -> Result<(Arc<ConsumerBucket>, Arc<StreamConsumer<TriggerConsumerContext>>)> {
        let props = self
            .buckets_manager
            .bucket_properties(bucket_id)
            .with_context(|| format!("bucket '{bucket_id}' is not configured"))?
            .clone();

        let bucket = self
            .consumer_buckets
            .entry(bucket_id.to_string())
            .or_insert_with(|| {
                Arc::new(ConsumerBucket::new(
                    bucket_id,
                    self.config.trigger_topics(bucket_id),
                ))
            })
            .clone();

        if !bucket.topic_configured() {
            ensure_topic_partitions(
                &self.config,
                &self.config.trigger_topic(bucket_id),
                props.triggering_topic_partitions_count,
            )
            .await?;
            bucket.mark_topic_configured();
        }

        let consumer =
            create_trigger_consumer(&self.config, bucket_id, &props, self.throttler.clone())
                .context("failed to create trigger consumer")?;
        let topics: Vec<&str> = bucket.topics().iter().map(String::as_str).collect();
        info!(bucket = %bucket_id, ?topics, "Subscribing to trigger topics");
        consumer
            .subscribe(&topics)
            .context("failed to subscribe to trigger topics")?;

        Ok((bucket, consumer))
    }

    async fn poll_session(
        &self,
        bucket: &ConsumerBucket,
        consumer: &StreamConsumer<TriggerConsumerContext>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bucket_id = bucket.bucket_id();
        let capacity = self.processing_state.bucket(bucket_id);
        let fetch_size = self
            .buckets_manager
            .bucket_properties(bucket_id)
            .map(|props| props.triggers_fetch_size)
            .unwrap_or(100);
        let delay = self.config.generic_medium_delay;

        while !self.is_shutting_down()
            && !cancel.is_cancelled()
            && self.get_tasks_processing_state(Some(bucket_id)) == TasksProcessingState::Started
        {
            let records = fetch_batch(consumer, fetch_size, delay, cancel).await?;

            bucket.commit_offsets(consumer, false, delay, &self.throttler);

            bucket.set_unprocessed_fetched_records(records.len() as i64);
            publish_bucket_gauges(bucket);

            for message in records {
                let partition =
                    Partition::new(message.topic().to_string(), message.partition());
                let offset = message.offset();
                bucket.tracker().register_polled(&partition, offset);
                debug!(
                    bucket = %bucket_id,
                    partition = %partition,
                    offset,
                    "Received trigger message"
                );

                let task = parse_trigger_message(&message).with_context(|| {
                    format!("undecodable trigger message at {partition} offset {offset}")
                })?;

                metrics::counter!(TRIGGERS_RECEIVED, "bucket" => bucket_id.to_string())
                    .increment(1);

                let triggering =
                    TaskTriggering::from_kafka(task, bucket_id.to_string(), partition, offset);
                if !self
                    .hand_to_processing(consumer, &capacity, triggering, cancel)
                    .await
                {
                    // Stop or shutdown interrupted the handoff; leave the
                    // record uncommitted, it will be re-polled.
                    return Ok(());
                }
                bucket.decrement_unprocessed_fetched_records();
            }
        }
        Ok(())
    }

    /// Hand a triggering to the processing service, retrying while it
    /// reports `Full`. Returns false when abandoned due to stop/shutdown.
    async fn hand_to_processing<C: BackpressureConsumer>(
        &self,
        consumer: &C,
        capacity: &BucketCapacity,
        triggering: TaskTriggering,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if self.is_shutting_down() || cancel.is_cancelled() {
                return false;
            }
            let seen_version = capacity.version();
            debug!(task = %triggering.task.version_id(), "Adding task for processing");
            if self
                .processing
                .add_task_for_processing(triggering.clone())
                .await
                != AddTaskResponse::Full
            {
                return true;
            }

            // No room downstream. Pause the assignment but keep serving the
            // consumer while waiting, so a long stall cannot exceed
            // max.poll.interval.ms and cost us the partitions. The wait
            // grows the paused set when a rebalance adds partitions, so the
            // resume below must cover everything ever paused, not just this
            // snapshot.
            let mut paused = pause_assignment(consumer);
            self.wait_for_capacity(consumer, capacity, seen_version, cancel, &mut paused)
                .await;
            if let Some(paused) = paused {
                if let Err(error) = consumer.resume_partitions(&paused) {
                    warn!(%error, "Resuming paused partitions failed");
                }
            }
        }
    }

    async fn wait_for_capacity<C: BackpressureConsumer>(
        &self,
        consumer: &C,
        capacity: &BucketCapacity,
        seen_version: u64,
        cancel: &CancellationToken,
        paused: &mut Option<TopicPartitionList>,
    ) {
        let delay = self.config.generic_medium_delay;
        while capacity.version() == seen_version
            && !self.is_shutting_down()
            && !cancel.is_cancelled()
        {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = capacity.changed_since(seen_version) => {}
                fetched = timeout(delay, consumer.recv_message()) => match fetched {
                    Ok(Ok(message)) => {
                        // A partition assigned mid-wait is not paused yet;
                        // put the record back, pause the fresh assignment
                        // and fold it into the caller's paused set.
                        let _ = consumer.seek_back(
                            message.topic(),
                            message.partition(),
                            message.offset(),
                        );
                        if let Some(extra) = pause_assignment(consumer) {
                            *paused = Some(match paused.take() {
                                Some(current) => merge_partition_lists(&current, &extra),
                                None => extra,
                            });
                        }
                    }
                    Ok(Err(error)) => {
                        debug!(%error, "Consumer error while waiting for processing capacity");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Err(_) => {}
                }
            }
        }
    }
}

impl TriggeringFinishedListener for KafkaTaskTriggerer {
    fn triggering_finished(&self, triggering: &TaskTriggering) {
        // Same-process handoffs never went through Kafka; there is no
        // offset to release.
        let TriggerSource::Kafka { partition, offset } = &triggering.source else {
            return;
        };
        match self.consumer_buckets.get(&triggering.bucket_id) {
            Some(bucket) => bucket.tracker().release_completed(partition, *offset),
            None => warn!(
                bucket = %triggering.bucket_id,
                partition = %partition,
                offset,
                "Completion for unknown consumer bucket"
            ),
        }
    }
}

fn resolve_bucket_id(bucket_id: Option<&str>) -> &str {
    match bucket_id {
        Some(bucket_id) if !bucket_id.is_empty() => bucket_id,
        _ => DEFAULT_BUCKET_ID,
    }
}

fn publish_bucket_gauges(bucket: &ConsumerBucket) {
    let stats = bucket.stats();
    let label = bucket.bucket_id().to_string();
    metrics::gauge!(OFFSETS_TO_BE_COMMITTED, "bucket" => label.clone())
        .set(stats.offsets.staged as f64);
    metrics::gauge!(OFFSETS_COMPLETED, "bucket" => label.clone())
        .set(stats.offsets.completed as f64);
    metrics::gauge!(OFFSETS_OUTSTANDING, "bucket" => label.clone())
        .set(stats.offsets.polled as f64);
    metrics::gauge!(UNPROCESSED_FETCHED_RECORDS, "bucket" => label)
        .set(stats.unprocessed_fetched_records as f64);
}

fn parse_trigger_message(message: &OwnedMessage) -> Result<BaseTask> {
    let payload = message.payload().context("trigger message has no payload")?;
    let payload =
        std::str::from_utf8(payload).context("trigger message payload is not valid UTF-8")?;
    serde_json::from_str(payload).context("trigger message is not valid JSON")
}

/// Collect up to `max_records` records under a single deadline. librdkafka
/// has no `max.poll.records`; the fetch size is enforced here instead.
/// Cancellation ends the fetch early with whatever was collected.
async fn fetch_batch(
    consumer: &StreamConsumer<TriggerConsumerContext>,
    max_records: usize,
    max_wait: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<OwnedMessage>> {
    let mut records = Vec::new();
    let deadline = Instant::now() + max_wait;

    while records.len() < max_records {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = timeout(remaining, consumer.recv()) => match fetched {
                Ok(Ok(message)) => records.push(message.detach()),
                Ok(Err(error)) => {
                    return Err(error).context("polling trigger records failed");
                }
                Err(_) => break,
            }
        }
    }
    Ok(records)
}

fn pause_assignment<C: BackpressureConsumer>(consumer: &C) -> Option<TopicPartitionList> {
    let assignment = match consumer.current_assignment() {
        Ok(assignment) if assignment.count() > 0 => assignment,
        Ok(_) => return None,
        Err(error) => {
            warn!(%error, "Reading consumer assignment failed");
            return None;
        }
    };
    match consumer.pause_partitions(&assignment) {
        Ok(()) => Some(assignment),
        Err(error) => {
            warn!(%error, "Pausing partitions failed");
            None
        }
    }
}

fn merge_partition_lists(
    base: &TopicPartitionList,
    extra: &TopicPartitionList,
) -> TopicPartitionList {
    let mut merged = TopicPartitionList::new();
    for elem in base.elements() {
        merged.add_partition(elem.topic(), elem.partition());
    }
    for elem in extra.elements() {
        if merged.find_partition(elem.topic(), elem.partition()).is_none() {
            merged.add_partition(elem.topic(), elem.partition());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        test_task, test_triggerer, test_triggering_config, RecordingTaskStore,
        ScriptedProcessingService, StaticHandlerRegistry,
    };
    use crate::triggering::interfaces::BucketProperties;

    #[test]
    fn test_resolve_bucket_id_defaults() {
        assert_eq!(resolve_bucket_id(None), DEFAULT_BUCKET_ID);
        assert_eq!(resolve_bucket_id(Some("")), DEFAULT_BUCKET_ID);
        assert_eq!(resolve_bucket_id(Some("emails")), "emails");
    }

    #[tokio::test]
    async fn test_backpressure_blocks_until_slot_released() {
        let (triggerer, processing, _store) = test_triggerer(
            StaticHandlerRegistry::new().with_handler("x", "b1"),
            AddTaskResponse::Full,
        );
        let props = BucketProperties::default();
        let consumer = create_trigger_consumer(
            &test_triggering_config(),
            "b1",
            &props,
            Arc::new(LogThrottler::default()),
        )
        .unwrap();

        let capacity = triggerer.processing_state.bucket("b1");
        let cancel = CancellationToken::new();
        let triggering = TaskTriggering::from_kafka(
            test_task("x"),
            "b1".to_string(),
            Partition::new("t".to_string(), 0),
            7,
        );

        let handoff = {
            let triggerer = triggerer.clone();
            let capacity = capacity.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                triggerer
                    .hand_to_processing(&consumer, &capacity, triggering, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handoff.is_finished(), "handoff must block while Full");
        assert!(processing.received_count() >= 1);

        processing.set_default_response(AddTaskResponse::Ok);
        capacity.slot_released();

        let handed = timeout(Duration::from_secs(5), handoff)
            .await
            .expect("handoff should finish after slot release")
            .unwrap();
        assert!(handed);
    }

    #[tokio::test]
    async fn test_backpressure_abandoned_on_shutdown() {
        let (triggerer, _processing, _store) = test_triggerer(
            StaticHandlerRegistry::new().with_handler("x", "b1"),
            AddTaskResponse::Full,
        );
        let props = BucketProperties::default();
        let consumer = create_trigger_consumer(
            &test_triggering_config(),
            "b1",
            &props,
            Arc::new(LogThrottler::default()),
        )
        .unwrap();

        let capacity = triggerer.processing_state.bucket("b1");
        let cancel = CancellationToken::new();
        let triggering = TaskTriggering::from_kafka(
            test_task("x"),
            "b1".to_string(),
            Partition::new("t".to_string(), 0),
            7,
        );

        let handoff = {
            let triggerer = triggerer.clone();
            let capacity = capacity.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                triggerer
                    .hand_to_processing(&consumer, &capacity, triggering, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handoff.is_finished());

        triggerer.prepare_for_shutdown();

        let handed = timeout(Duration::from_secs(5), handoff)
            .await
            .expect("handoff should abort on shutdown")
            .unwrap();
        assert!(!handed, "abandoned handoff must not report success");
    }

    #[tokio::test]
    async fn test_backpressure_abandoned_on_bucket_stop() {
        let (triggerer, _processing, _store) = test_triggerer(
            StaticHandlerRegistry::new().with_handler("x", "b1"),
            AddTaskResponse::Full,
        );
        let props = BucketProperties::default();
        let consumer = create_trigger_consumer(
            &test_triggering_config(),
            "b1",
            &props,
            Arc::new(LogThrottler::default()),
        )
        .unwrap();

        let capacity = triggerer.processing_state.bucket("b1");
        let cancel = CancellationToken::new();
        let triggering = TaskTriggering::from_kafka(
            test_task("x"),
            "b1".to_string(),
            Partition::new("t".to_string(), 0),
            7,
        );

        let handoff = {
            let triggerer = triggerer.clone();
            let capacity = capacity.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                triggerer
                    .hand_to_processing(&consumer, &capacity, triggering, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let handed = timeout(Duration::from_secs(5), handoff)
            .await
            .expect("handoff should abort on cancellation")
            .unwrap();
        assert!(!handed);
    }

    /// Scripted stand-in for the consumer surface of the backpressure wait:
    /// yields queued messages (growing its assignment as a rebalance would)
    /// and records every pause, resume and seek.
    struct ScriptedBackpressureConsumer {
        assignment: Mutex<Vec<(String, i32)>>,
        incoming: Mutex<std::collections::VecDeque<OwnedMessage>>,
        paused: Mutex<Vec<Vec<(String, i32)>>>,
        resumed: Mutex<Vec<Vec<(String, i32)>>>,
        seeks: Mutex<Vec<(String, i32, i64)>>,
    }

    impl ScriptedBackpressureConsumer {
        fn new(assignment: Vec<(String, i32)>, incoming: Vec<OwnedMessage>) -> Self {
            Self {
                assignment: Mutex::new(assignment),
                incoming: Mutex::new(incoming.into()),
                paused: Mutex::new(Vec::new()),
                resumed: Mutex::new(Vec::new()),
                seeks: Mutex::new(Vec::new()),
            }
        }
    }

    fn partition_pairs(partitions: &TopicPartitionList) -> Vec<(String, i32)> {
        partitions
            .elements()
            .iter()
            .map(|elem| (elem.topic().to_string(), elem.partition()))
            .collect()
    }

    #[async_trait]
    impl BackpressureConsumer for ScriptedBackpressureConsumer {
        async fn recv_message(&self) -> KafkaResult<OwnedMessage> {
            let next = self.incoming.lock().unwrap().pop_front();
            match next {
                Some(message) => {
                    // The broker handed us this partition mid-wait.
                    let mut assignment = self.assignment.lock().unwrap();
                    let key = (message.topic().to_string(), message.partition());
                    if !assignment.contains(&key) {
                        assignment.push(key);
                    }
                    Ok(message)
                }
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        fn current_assignment(&self) -> KafkaResult<TopicPartitionList> {
            let mut partitions = TopicPartitionList::new();
            for (topic, partition) in self.assignment.lock().unwrap().iter() {
                partitions.add_partition(topic, *partition);
            }
            Ok(partitions)
        }

        fn pause_partitions(&self, partitions: &TopicPartitionList) -> KafkaResult<()> {
            self.paused.lock().unwrap().push(partition_pairs(partitions));
            Ok(())
        }

        fn resume_partitions(&self, partitions: &TopicPartitionList) -> KafkaResult<()> {
            self.resumed.lock().unwrap().push(partition_pairs(partitions));
            Ok(())
        }

        fn seek_back(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
            self.seeks
                .lock()
                .unwrap()
                .push((topic.to_string(), partition, offset));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mid_wait_assignment_is_resumed_after_backpressure() {
        use rdkafka::message::{OwnedHeaders, Timestamp};

        let (triggerer, processing, _store) = test_triggerer(
            StaticHandlerRegistry::new().with_handler("x", "b1"),
            AddTaskResponse::Full,
        );

        let topic = "twTasks.test-tasks.executeTask.b1";
        // Record from a partition the consumer only gets assigned while the
        // backpressure wait is already in progress.
        let late_message = OwnedMessage::new(
            Some(serde_json::to_vec(&test_task("x")).unwrap()),
            Some(b"k".to_vec()),
            topic.to_string(),
            Timestamp::now(),
            1,
            5,
            Some(OwnedHeaders::new()),
        );
        let consumer = Arc::new(ScriptedBackpressureConsumer::new(
            vec![(topic.to_string(), 0)],
            vec![late_message],
        ));

        let capacity = triggerer.processing_state.bucket("b1");
        let cancel = CancellationToken::new();
        let triggering = TaskTriggering::from_kafka(
            test_task("x"),
            "b1".to_string(),
            Partition::new(topic.to_string(), 0),
            7,
        );

        let handoff = {
            let triggerer = triggerer.clone();
            let consumer = consumer.clone();
            let capacity = capacity.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                triggerer
                    .hand_to_processing(&*consumer, &capacity, triggering, &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handoff.is_finished(), "handoff must block while Full");

        processing.set_default_response(AddTaskResponse::Ok);
        capacity.slot_released();

        let handed = timeout(Duration::from_secs(5), handoff)
            .await
            .expect("handoff should finish after slot release")
            .unwrap();
        assert!(handed);

        // The slipped-through record went back where it came from.
        assert_eq!(
            consumer.seeks.lock().unwrap().clone(),
            vec![(topic.to_string(), 1, 5)]
        );

        // The wait paused the initial assignment first, then the grown one.
        let paused = consumer.paused.lock().unwrap().clone();
        assert_eq!(paused.first(), Some(&vec![(topic.to_string(), 0)]));
        assert!(
            paused.iter().any(|set| set.contains(&(topic.to_string(), 1))),
            "mid-wait assignment must be paused too: {paused:?}"
        );

        // Everything ever paused is resumed, including the partition that
        // arrived mid-wait.
        let resumed = consumer.resumed.lock().unwrap().clone();
        assert_eq!(resumed.len(), 1, "one resume covering the full set");
        assert!(resumed[0].contains(&(topic.to_string(), 0)));
        assert!(resumed[0].contains(&(topic.to_string(), 1)));
    }

    #[test]
    fn test_merge_partition_lists_unions_without_duplicates() {
        let mut base = TopicPartitionList::new();
        base.add_partition("t", 0);
        base.add_partition("t", 1);
        let mut extra = TopicPartitionList::new();
        extra.add_partition("t", 1);
        extra.add_partition("t", 2);

        let merged = merge_partition_lists(&base, &extra);
        assert_eq!(merged.count(), 3);
        assert!(merged.find_partition("t", 0).is_some());
        assert!(merged.find_partition("t", 1).is_some());
        assert!(merged.find_partition("t", 2).is_some());
    }

    #[tokio::test]
    async fn test_parse_trigger_message_rejects_garbage() {
        use rdkafka::message::{OwnedHeaders, Timestamp};

        let message = OwnedMessage::new(
            Some(b"not json".to_vec()),
            Some(b"k".to_vec()),
            "t".to_string(),
            Timestamp::now(),
            0,
            1,
            Some(OwnedHeaders::new()),
        );
        assert!(parse_trigger_message(&message).is_err());

        let message = OwnedMessage::new(
            None,
            Some(b"k".to_vec()),
            "t".to_string(),
            Timestamp::now(),
            0,
            1,
            Some(OwnedHeaders::new()),
        );
        assert!(parse_trigger_message(&message).is_err());
    }

    #[tokio::test]
    async fn test_parse_trigger_message_accepts_task_json() {
        use rdkafka::message::{OwnedHeaders, Timestamp};

        let task = test_task("send-email");
        let payload = serde_json::to_vec(&task).unwrap();
        let message = OwnedMessage::new(
            Some(payload),
            Some(b"k".to_vec()),
            "t".to_string(),
            Timestamp::now(),
            0,
            1,
            Some(OwnedHeaders::new()),
        );

        let parsed = parse_trigger_message(&message).unwrap();
        assert_eq!(parsed, task);
    }

    #[tokio::test]
    async fn test_completion_listener_ignores_same_process_triggers() {
        let (triggerer, processing, _store) = test_triggerer(
            StaticHandlerRegistry::new().with_handler("x", "b1"),
            AddTaskResponse::Ok,
        );

        let triggering = TaskTriggering::same_process(test_task("x"), "b1".to_string());
        processing.finish(&triggering);

        assert!(triggerer.consumer_bucket_stats("b1").is_none());
    }

    #[tokio::test]
    async fn test_completion_listener_tolerates_unknown_bucket() {
        let (triggerer, processing, _store) = test_triggerer(
            StaticHandlerRegistry::new().with_handler("x", "b1"),
            AddTaskResponse::Ok,
        );

        let triggering = TaskTriggering::from_kafka(
            test_task("x"),
            "ghost".to_string(),
            Partition::new("t".to_string(), 0),
            3,
        );
        processing.finish(&triggering);

        assert!(triggerer.consumer_bucket_stats("ghost").is_none());
    }

    #[tokio::test]
    async fn test_trigger_assertion_rejects_active_transaction() {
        struct AlwaysActive;
        impl TransactionContext for AlwaysActive {
            fn is_transaction_active(&self) -> bool {
                true
            }
        }

        let registry = StaticHandlerRegistry::new().with_handler("x", "b1");
        let processing = Arc::new(ScriptedProcessingService::new(AddTaskResponse::Ok));
        let store = Arc::new(RecordingTaskStore::default());
        let mut config = test_triggering_config();
        config.assertions_enabled = true;

        let triggerer = KafkaTaskTriggerer::new(
            config,
            TriggererDependencies {
                task_store: store,
                handler_registry: Arc::new(registry),
                buckets_manager: Arc::new(crate::test_utils::test_buckets_manager()),
                processing: processing.clone(),
                processing_state: Arc::new(ProcessingState::new()),
                transactions: Some(Arc::new(AlwaysActive)),
            },
        )
        .unwrap();

        let task = test_task("x");
        let result = tokio::spawn(async move { triggerer.trigger(&task).await }).await;
        assert!(result.is_err(), "active transaction must trip the assertion");
    }
}
