use std::sync::Arc;

use rand::Rng;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::TriggeringConfig;
use crate::kafka::topics::base_client_config;
use crate::throttle::LogThrottler;
use crate::triggering::task::BaseTask;

#[derive(Error, Debug)]
pub enum TriggerProduceError {
    #[error("failed to serialize trigger message: {error}")]
    Serialization {
        #[from]
        error: serde_json::Error,
    },
}

/// Process-wide idempotent producer for trigger messages.
///
/// Sends are fire-and-forget: the task row is already durable in the task
/// store, so a lost trigger only delays pickup until the periodic
/// resurrection scan re-triggers it. Delivery outcomes are logged from a
/// spawned task, with failures throttled.
pub struct TriggerProducer {
    producer: FutureProducer,
    throttler: Arc<LogThrottler>,
}

impl TriggerProducer {
    pub fn new(config: &TriggeringConfig, throttler: Arc<LogThrottler>) -> Result<Self, KafkaError> {
        let mut client_config = base_client_config(config);
        client_config
            .set("client.id", format!("{}.task-triggerer", config.group_id))
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set("request.timeout.ms", "5000")
            .set("message.timeout.ms", "10000")
            .set("linger.ms", "5")
            .set("reconnect.backoff.ms", "100")
            .set("reconnect.backoff.max.ms", "5000");
        for (key, value) in &config.kafka_properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer = client_config.create()?;
        Ok(Self { producer, throttler })
    }

    pub fn send_trigger(&self, topic: &str, task: &BaseTask) -> Result<(), TriggerProduceError> {
        let payload = serde_json::to_string(task)?;
        let key = random_trigger_key();
        let version_id = task.version_id();

        match self
            .producer
            .send_result(FutureRecord::to(topic).key(&key).payload(&payload))
        {
            Ok(delivery) => {
                let throttler = self.throttler.clone();
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Ok(_)) => {
                            debug!(task = %version_id, "Task triggering acknowledged by Kafka");
                        }
                        Ok(Err((error, _))) => {
                            if throttler.allow() {
                                error!(task = %version_id, %error, "Task triggering failed through Kafka");
                            } else {
                                debug!(task = %version_id, %error, "Task triggering failed through Kafka");
                            }
                        }
                        Err(_) => {
                            if throttler.allow() {
                                error!(task = %version_id, "Task triggering canceled by Kafka client");
                            } else {
                                debug!(task = %version_id, "Task triggering canceled by Kafka client");
                            }
                        }
                    }
                });
            }
            Err((error, _)) => {
                if self.throttler.allow() {
                    error!(task = %version_id, %error, "Enqueueing task trigger failed");
                } else {
                    debug!(task = %version_id, %error, "Enqueueing task trigger failed");
                }
            }
        }
        Ok(())
    }
}

/// A non-empty pseudo-random key; with a null key the Kafka client falls
/// back to sticky batch partitioning instead of spreading triggers across
/// partitions. Code points in the surrogate range are not valid chars and
/// are re-rolled.
fn random_trigger_key() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let code: u32 = rng.gen_range(1..=0xFFFF);
        if let Some(key) = char::from_u32(code) {
            return key.to_string();
        }
    }
}
