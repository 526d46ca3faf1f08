//! Trigger-topic administration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewPartitions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::config::TriggeringConfig;

const ADMIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bootstrap + TLS client config shared by all clients this crate creates.
pub(crate) fn base_client_config(config: &TriggeringConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.bootstrap_servers);
    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }
    client_config
}

/// Idempotently ensure the trigger topic exists with at least the configured
/// partition count. Partition counts never shrink.
pub async fn ensure_topic_partitions(
    config: &TriggeringConfig,
    topic: &str,
    partitions: i32,
) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = base_client_config(config)
        .create()
        .context("failed to create Kafka admin client")?;
    let opts = AdminOptions::new().operation_timeout(Some(ADMIN_OPERATION_TIMEOUT));

    let results = admin
        .create_topics(
            &[NewTopic {
                name: topic,
                num_partitions: partitions,
                replication: TopicReplication::Fixed(-1),
                config: vec![],
            }],
            &opts,
        )
        .await
        .with_context(|| format!("create topics request failed for '{topic}'"))?;

    for result in results {
        match result {
            Ok(name) => info!(topic = %name, partitions, "Created trigger topic"),
            Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                grow_partitions(&admin, &opts, topic, partitions).await?;
            }
            Err((name, code)) => bail!("failed to create topic '{name}': {code}"),
        }
    }
    Ok(())
}

async fn grow_partitions(
    admin: &AdminClient<DefaultClientContext>,
    opts: &AdminOptions,
    topic: &str,
    partitions: i32,
) -> Result<()> {
    let results = admin
        .create_partitions(&[NewPartitions::new(topic, partitions as usize)], opts)
        .await
        .with_context(|| format!("create partitions request failed for '{topic}'"))?;

    for result in results {
        match result {
            Ok(name) => info!(topic = %name, partitions, "Grew trigger topic partitions"),
            Err((_, RDKafkaErrorCode::InvalidPartitions | RDKafkaErrorCode::InvalidRequest)) => {
                // The topic already has at least this many partitions.
                debug!(topic, partitions, "Trigger topic partition count already satisfied");
            }
            Err((name, code)) => bail!("failed to grow partitions of '{name}': {code}"),
        }
    }
    Ok(())
}
