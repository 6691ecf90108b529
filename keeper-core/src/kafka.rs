use anyhow::{anyhow, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::KafkaConfig;

pub type EventProducer = Arc<FutureProducer>;
pub type EventConsumer = Arc<StreamConsumer>;

fn build_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("metadata.request.timeout.ms", "30000")
        .set("socket.timeout.ms", "30000")
        .set("socket.keepalive.enable", "true");
    client_config
}

pub fn create_producer(config: &KafkaConfig) -> Result<EventProducer> {
    tracing::info!("Creating event-log producer, brokers: {}", config.brokers);

    let producer: FutureProducer = build_client_config(config)
        .set("message.timeout.ms", "5000")
        .set("acks", "all")
        .set("retries", "3")
        .create()
        .map_err(|e| anyhow!("Failed to create event-log producer: {}", e))?;

    tracing::info!("Event-log producer ready (connects on first publish)");

    Ok(Arc::new(producer))
}

/// Each consumer cohort passes its own group id; offsets auto-commit
/// periodically, so delivery is at-least-once.
pub fn create_consumer(config: &KafkaConfig, group_id: &str) -> Result<EventConsumer> {
    tracing::info!(
        "Creating event-log consumer, brokers: {}, group: {}",
        config.brokers,
        group_id
    );

    let consumer: StreamConsumer = build_client_config(config)
        .set("group.id", group_id)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| anyhow!("Failed to create event-log consumer: {}", e))?;

    Ok(Arc::new(consumer))
}

/// Blocking publish: returns once the broker acknowledges the record.
/// Messages are keyed by product code so per-product ordering holds within
/// a partition.
pub async fn produce_message(
    producer: &EventProducer,
    topic: &str,
    key: &str,
    payload: &[u8],
) -> Result<()> {
    let record = FutureRecord::to(topic).key(key).payload(payload);

    match producer.send(record, Duration::from_secs(5)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                "Delivered message to {} partition {} offset {}",
                topic,
                partition,
                offset
            );
            Ok(())
        }
        Err((e, _)) => {
            tracing::error!("Failed to deliver message to {}: {:?}", topic, e);
            Err(anyhow!("Failed to deliver message: {:?}", e))
        }
    }
}
