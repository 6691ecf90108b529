use anyhow::{anyhow, Result};
use chrono::Duration as ChronoDuration;
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tracing;

use keeper_core::{store, KeeperContext};

/// Alert tolerance on the target price, preserved verbatim from upstream.
const TARGET_TOLERANCE: f64 = 1.01;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Price-update consumer cohort. Offsets auto-commit, so delivery is
/// at-least-once; the 1-hour alert guard and append-only history keep the
/// effects idempotent enough.
pub async fn run(ctx: KeeperContext, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let group = ctx.config.kafka.consumer_group.clone();
    let topic = ctx.config.kafka.topic_prices.clone();

    let consumer = ctx.create_consumer(&group)?;
    consumer.subscribe(&[topic.as_str()])?;
    tracing::info!("Price consumer subscribed to {} as {}", topic, group);

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
                        if let Err(e) = handle_price_message(&ctx, payload).await {
                            tracing::error!("Error processing price message: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Price consumer receive error: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    tracing::info!("Price consumer stopped");
    Ok(())
}

async fn handle_price_message(ctx: &KeeperContext, payload: &[u8]) -> Result<()> {
    let message: Value = serde_json::from_slice(payload)?;

    let asin = message
        .get("asin")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing asin"))?;
    let current_price = message
        .get("current_price")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow!("missing current_price"))?;

    // Untracked products are skipped, not auto-created; that is the deal
    // consumer's job.
    let Some(watch) = store::find_watch_by_asin(&ctx.db_pool, asin).await? else {
        tracing::debug!("Skipping price update for untracked product {}", asin);
        return Ok(());
    };

    store::append_price_history(&ctx.db_pool, watch.id, current_price, "kafka").await?;

    let target = if watch.target_price > 0.0 {
        watch.target_price
    } else {
        message.get("target_price").and_then(|v| v.as_f64()).unwrap_or(0.0)
    };

    if target > 0.0 && current_price <= target * TARGET_TOLERANCE {
        if store::has_recent_alert(&ctx.db_pool, watch.id, ChronoDuration::hours(1)).await? {
            tracing::debug!("Alert for {} suppressed by the 1h window", asin);
            return Ok(());
        }
        store::create_price_alert(
            &ctx.db_pool,
            watch.id,
            current_price,
            target,
            watch.current_price,
            Some(current_price),
        )
        .await?;
        tracing::info!("Created price alert for {} at {:.2}", asin, current_price);
    }

    Ok(())
}
