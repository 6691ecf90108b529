use std::sync::Arc;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing;

use keeper_core::events::{send_price_update, PriceUpdateEvent};
use keeper_core::models::WatchedProduct;
use keeper_core::{store, KeeperContext};
use keeper_keepa::{KeepaClient, KeepaError};

const TARGET_TOLERANCE: f64 = 1.01;
const ALERT_GUARD_SECS: i64 = 3600;

/// Watches live on the German marketplace unless told otherwise.
const WATCH_DOMAIN_ID: u32 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct PriceCheckSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub price_changes: usize,
    pub alerts_triggered: usize,
    pub published: usize,
    pub indexed: usize,
}

/// One full price-check pass over every ACTIVE watch. Fetches run in
/// parallel under the configured semaphore; a single failure never aborts
/// the batch.
pub async fn run_price_check(
    ctx: &KeeperContext,
    client: &Arc<KeepaClient>,
) -> Result<PriceCheckSummary> {
    let watches = store::get_active_watches(&ctx.db_pool).await?;
    tracing::info!("Price check: {} active watches", watches.len());

    let mut summary = PriceCheckSummary {
        total: watches.len(),
        ..Default::default()
    };

    let semaphore = Arc::new(Semaphore::new(ctx.config.scheduler.parallel_price_fetch.max(1)));
    let mut tasks = JoinSet::new();

    for watch in watches {
        let client = Arc::clone(client);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = client.query_product(&watch.asin, WATCH_DOMAIN_ID).await;
            (watch, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (watch, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("Price check task panicked: {}", e);
                summary.failed += 1;
                continue;
            }
        };

        match result {
            Ok(product) => {
                summary.successful += 1;
                if let Err(e) =
                    apply_check_result(ctx, &watch, product.current_price, &mut summary).await
                {
                    tracing::error!("Applying price for {} failed: {}", watch.asin, e);
                }
            }
            Err(KeepaError::TokensExhausted { .. }) => {
                // Do not cascade; the next cycle retries with a fuller bucket.
                tracing::warn!("Skipping {}: token bucket exhausted", watch.asin);
                summary.failed += 1;
            }
            Err(e) => {
                tracing::error!("Price check for {} failed: {}", watch.asin, e);
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        "Price check complete: {} ok, {} failed, {} changes, {} alerts, {} published, {} indexed",
        summary.successful,
        summary.failed,
        summary.price_changes,
        summary.alerts_triggered,
        summary.published,
        summary.indexed
    );
    Ok(summary)
}

async fn apply_check_result(
    ctx: &KeeperContext,
    watch: &WatchedProduct,
    fetched_price: Option<f64>,
    summary: &mut PriceCheckSummary,
) -> Result<()> {
    // Fall back to the latest collected snapshot before declaring the
    // price absent.
    let mut price = fetched_price.unwrap_or(0.0);
    if price <= 0.0 {
        if let Some(snapshot_price) = store::get_latest_deal_price(&ctx.db_pool, &watch.asin).await? {
            tracing::info!("Snapshot fallback: {} -> {:.2}", watch.asin, snapshot_price);
            price = snapshot_price;
        }
    }

    if price <= 0.0 {
        store::touch_watch_checked(&ctx.db_pool, watch.id).await?;
        return Ok(());
    }

    let previous = watch.current_price;
    let changed = previous.map(|p| (p - price).abs() > 0.009).unwrap_or(true);
    if changed {
        summary.price_changes += 1;
    }

    store::update_watch_price(&ctx.db_pool, watch.id, price, None).await?;

    let event = PriceUpdateEvent::new(
        &watch.asin,
        watch.product_name.as_deref().unwrap_or(&watch.asin),
        price,
        Some(watch.target_price),
        previous,
        "de",
    );
    if send_price_update(&ctx.producer, &ctx.config.kafka.topic_prices, &event).await {
        summary.published += 1;
    }
    if ctx
        .search
        .index_price_update(&serde_json::to_value(&event)?)
        .await
    {
        summary.indexed += 1;
    }

    if watch.target_price > 0.0 && price <= watch.target_price * TARGET_TOLERANCE {
        if store::has_recent_alert(&ctx.db_pool, watch.id, ChronoDuration::seconds(ALERT_GUARD_SECS)).await? {
            tracing::debug!("Alert for {} suppressed by the 1h window", watch.asin);
        } else {
            store::create_price_alert(
                &ctx.db_pool,
                watch.id,
                price,
                watch.target_price,
                previous,
                Some(price),
            )
            .await?;
            summary.alerts_triggered += 1;
            tracing::info!(
                "ALERT: {} dropped to {:.2} (target {:.2})",
                watch.asin,
                price,
                watch.target_price
            );
        }
    }

    Ok(())
}
