use anyhow::{anyhow, Result};
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tracing;

use keeper_core::{store, KeeperContext};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Deal-update consumer cohort. Back-fills tracked products: every deal
/// becomes a system-user watch plus a history row tagged "kafka_deals".
pub async fn run(ctx: KeeperContext, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let group = format!("{}-deals", ctx.config.kafka.consumer_group);
    let topic = ctx.config.kafka.topic_deals.clone();

    let consumer = ctx.create_consumer(&group)?;
    consumer.subscribe(&[topic.as_str()])?;
    tracing::info!("Deal consumer subscribed to {} as {}", topic, group);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            received = consumer.recv() => match received {
                Ok(message) => {
                    if let Some(payload) = message.payload() {
                        if let Err(e) = handle_deal_message(&ctx, payload).await {
                            tracing::error!("Error processing deal message: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Deal consumer receive error: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    tracing::info!("Deal consumer stopped");
    Ok(())
}

async fn handle_deal_message(ctx: &KeeperContext, payload: &[u8]) -> Result<()> {
    let message: Value = serde_json::from_slice(payload)?;

    let asin = message
        .get("asin")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing asin"))?;
    let price = message
        .get("current_price")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let title = message
        .get("product_title")
        .or_else(|| message.get("title"))
        .and_then(|v| v.as_str());

    if asin.is_empty() || price <= 0.0 {
        return Ok(());
    }

    let recorded =
        store::record_deal_price(&ctx.db_pool, asin, price, title, "kafka_deals", None).await?;
    if recorded {
        tracing::debug!("Recorded deal price: {} @ {:.2}", asin, price);
    }
    Ok(())
}
