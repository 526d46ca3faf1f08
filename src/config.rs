use std::time::Duration;

use envconfig::Envconfig;
use uuid::Uuid;

use crate::triggering::interfaces::{BucketProperties, DEFAULT_BUCKET_ID};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    /// Logical service group; part of the trigger topic name and the
    /// consumer group id.
    #[envconfig(default = "task-triggerer")]
    pub group_id: String,

    // supplied by k8s deploy env, used as the node-unique client id
    #[envconfig(from = "HOSTNAME")]
    pub pod_hostname: Option<String>,

    pub kafka_topics_namespace: Option<String>,

    /// Comma-separated prefixes; each adds a consume-side topic alias.
    #[envconfig(default = "")]
    pub kafka_data_center_prefixes: String,

    #[envconfig(default = "earliest")]
    pub auto_reset_offset_to: String,

    /// Shared pacing delay: poll timeout, commit cadence, backpressure wait
    /// bound and worker restart backoff.
    #[envconfig(default = "2000")]
    pub generic_medium_delay_ms: u64,

    /// Pass-through rdkafka overrides, comma-separated `key=value` pairs,
    /// applied last to both producer and consumer configs.
    pub kafka_properties: Option<String>,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "false")]
    pub assertions_enabled: bool,

    // Default-bucket properties
    #[envconfig(default = "1")]
    pub triggering_topic_partitions_count: i32,

    #[envconfig(default = "100")]
    pub triggers_fetch_size: usize,

    #[envconfig(default = "false")]
    pub trigger_in_same_process: bool,

    #[envconfig(default = "false")]
    pub trigger_same_task_in_all_nodes: bool,

    #[envconfig(default = "true")]
    pub auto_start_processing: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn generic_medium_delay(&self) -> Duration {
        Duration::from_millis(self.generic_medium_delay_ms)
    }

    /// Node-unique client id; the pod hostname where available.
    pub fn client_id(&self) -> String {
        self.pod_hostname
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn default_bucket_properties(&self) -> BucketProperties {
        BucketProperties {
            triggering_topic_partitions_count: self.triggering_topic_partitions_count,
            triggers_fetch_size: self.triggers_fetch_size,
            trigger_in_same_process: self.trigger_in_same_process,
            trigger_same_task_in_all_nodes: self.trigger_same_task_in_all_nodes,
            auto_reset_offset_to_duration: None,
            auto_start_processing: self.auto_start_processing,
        }
    }

    pub fn triggering_config(&self) -> TriggeringConfig {
        TriggeringConfig {
            bootstrap_servers: self.kafka_hosts.clone(),
            group_id: self.group_id.clone(),
            client_id: self.client_id(),
            topics_namespace: self.kafka_topics_namespace.clone(),
            data_center_prefixes: self.kafka_data_center_prefixes.clone(),
            auto_reset_offset_to: self.auto_reset_offset_to.clone(),
            generic_medium_delay: self.generic_medium_delay(),
            kafka_properties: parse_kafka_properties(self.kafka_properties.as_deref()),
            kafka_tls: self.kafka_tls,
            assertions_enabled: self.assertions_enabled,
        }
    }
}

fn parse_kafka_properties(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| {
        raw.split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect()
    })
    .unwrap_or_default()
}

/// Resolved triggering settings, detached from the environment.
#[derive(Clone, Debug)]
pub struct TriggeringConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: String,
    pub topics_namespace: Option<String>,
    pub data_center_prefixes: String,
    pub auto_reset_offset_to: String,
    pub generic_medium_delay: Duration,
    pub kafka_properties: Vec<(String, String)>,
    pub kafka_tls: bool,
    pub assertions_enabled: bool,
}

impl TriggeringConfig {
    /// `[<namespace>.]twTasks.<groupId>.executeTask[.<bucketId>]`. The
    /// default bucket publishes to the unsuffixed topic.
    pub fn trigger_topic(&self, bucket_id: &str) -> String {
        let mut topic = format!("twTasks.{}.executeTask", self.group_id);
        if !bucket_id.is_empty() && bucket_id != DEFAULT_BUCKET_ID {
            topic.push('.');
            topic.push_str(bucket_id);
        }
        match &self.topics_namespace {
            Some(namespace) if !namespace.is_empty() => format!("{namespace}.{topic}"),
            _ => topic,
        }
    }

    /// The trigger topic plus one data-center-prefixed alias per configured
    /// prefix; this is the consume-side subscription list.
    pub fn trigger_topics(&self, bucket_id: &str) -> Vec<String> {
        let topic = self.trigger_topic(bucket_id);
        let mut topics = vec![topic.clone()];
        for prefix in self
            .data_center_prefixes
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            topics.push(format!("{prefix}{topic}"));
        }
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TriggeringConfig {
        TriggeringConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "payments".to_string(),
            client_id: "node-1".to_string(),
            topics_namespace: None,
            data_center_prefixes: String::new(),
            auto_reset_offset_to: "earliest".to_string(),
            generic_medium_delay: Duration::from_millis(2000),
            kafka_properties: Vec::new(),
            kafka_tls: false,
            assertions_enabled: false,
        }
    }

    #[test]
    fn test_topic_for_named_bucket() {
        let config = test_config();
        assert_eq!(
            config.trigger_topic("emails"),
            "twTasks.payments.executeTask.emails"
        );
    }

    #[test]
    fn test_topic_for_default_bucket_has_no_suffix() {
        let config = test_config();
        assert_eq!(config.trigger_topic("default"), "twTasks.payments.executeTask");
        assert_eq!(config.trigger_topic(""), "twTasks.payments.executeTask");
    }

    #[test]
    fn test_topic_namespace_prefix() {
        let mut config = test_config();
        config.topics_namespace = Some("staging".to_string());
        assert_eq!(
            config.trigger_topic("emails"),
            "staging.twTasks.payments.executeTask.emails"
        );
    }

    #[test]
    fn test_data_center_prefixed_aliases() {
        let mut config = test_config();
        config.data_center_prefixes = "fra.,lhr.".to_string();
        assert_eq!(
            config.trigger_topics("emails"),
            vec![
                "twTasks.payments.executeTask.emails",
                "fra.twTasks.payments.executeTask.emails",
                "lhr.twTasks.payments.executeTask.emails",
            ]
        );
    }

    #[test]
    fn test_kafka_properties_parsing() {
        assert_eq!(parse_kafka_properties(None), Vec::new());
        assert_eq!(
            parse_kafka_properties(Some("session.timeout.ms=45000, fetch.min.bytes=1")),
            vec![
                ("session.timeout.ms".to_string(), "45000".to_string()),
                ("fetch.min.bytes".to_string(), "1".to_string()),
            ]
        );
        assert_eq!(parse_kafka_properties(Some("garbage")), Vec::new());
    }
}
