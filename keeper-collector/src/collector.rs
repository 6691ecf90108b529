use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing;

use keeper_core::events::{send_deal_update, DealUpdateEvent};
use keeper_core::models::NewCollectedDeal;
use keeper_core::{store, KeeperContext};
use keeper_keepa::{DealFilters, KeepaClient, KeepaError};

use crate::keyboard::{annotate_layout, matches_keyboard_domain};
use crate::normalize::{deal_from_hit, deal_from_product, Deal};
use crate::score::{filter_spam, score_deal};
use crate::seeds::{select_batch, SeedSource};

/// Amazon browse node for keyboards; shared across the EU marketplaces.
const KEYBOARD_CATEGORY_ID: i64 = 340_843_031;
const PARALLEL_QUERIES: usize = 5;
const ALERT_GUARD_SECS: i64 = 3600;

/// Long-running deal pipeline: resolve seeds, fetch, normalize, score,
/// filter, fan out. Launched once by the runner; exits on shutdown.
pub async fn run(
    ctx: KeeperContext,
    client: Arc<KeepaClient>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = ctx.config.collector.clone();
    tracing::info!(
        "Deal collector started: interval={}s, batch_size={}, mode={}",
        config.scan_interval_seconds,
        config.scan_batch_size,
        config.source_mode
    );

    let mut seeds = SeedSource::new(&config);
    let mut cursor = 0usize;
    let mut cycle = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match run_iteration(&ctx, &client, &config.source_mode, &mut seeds, config.scan_batch_size, cursor)
            .await
        {
            Ok(kept) => {
                cycle += 1;
                tracing::info!("Deal collection #{}: {} deals kept", cycle, kept);
            }
            Err(e) => tracing::warn!("Deal collector iteration failed: {}", e),
        }
        cursor = cursor.wrapping_add(config.scan_batch_size.max(1));

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.scan_interval_seconds.max(30))) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::info!("Deal collector stopped");
    Ok(())
}

async fn run_iteration(
    ctx: &KeeperContext,
    client: &Arc<KeepaClient>,
    source_mode: &str,
    seeds: &mut SeedSource,
    batch_size: usize,
    cursor: usize,
) -> Result<usize> {
    let targets = seeds.resolve();
    let batch = select_batch(&targets, batch_size, cursor);

    let mut deals = if source_mode == "deals" && client.deal_endpoint_available() {
        match fetch_from_deal_endpoint(client).await {
            Ok(deals) => deals,
            Err(KeepaError::DealAccessDenied) => {
                tracing::warn!("Deal endpoint denied; falling back to product queries");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Deal endpoint failed: {}", e);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    if deals.is_empty() {
        deals = fetch_from_products(client, &batch).await;
    }

    // Score first; the spam gate reads the discount the scorer saw.
    let scored: Vec<Deal> = deals
        .into_iter()
        .map(|mut deal| {
            deal.deal_score = score_deal(&deal);
            deal
        })
        .collect();
    let mut kept: Vec<Deal> = filter_spam(scored)
        .into_iter()
        .filter(|deal| matches_keyboard_domain(&deal.title))
        .collect();
    for deal in &mut kept {
        deal.layout = Some(annotate_layout(&deal.title, &deal.market));
    }

    if kept.is_empty() {
        tracing::info!("No keyboard deals collected this cycle");
        return Ok(0);
    }

    fan_out(ctx, &kept).await;
    Ok(kept.len())
}

async fn fetch_from_deal_endpoint(client: &Arc<KeepaClient>) -> Result<Vec<Deal>, KeepaError> {
    let filters = DealFilters {
        domain_id: 3,
        include_categories: vec![KEYBOARD_CATEGORY_ID],
        min_discount: 10,
        max_discount: 90,
        min_price_cents: 1_500,
        max_price_cents: 30_000,
        min_reviews: 0,
        ..DealFilters::default()
    };

    let hits = client.search_deals(&filters).await?;
    Ok(hits.iter().map(|hit| deal_from_hit(hit, filters.domain_id)).collect())
}

/// Per-seed product queries, grouped by domain, bounded by a semaphore.
/// One failed query never aborts the batch.
async fn fetch_from_products(
    client: &Arc<KeepaClient>,
    batch: &[crate::seeds::SeedTarget],
) -> Vec<Deal> {
    let mut by_domain: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for target in batch {
        by_domain.entry(target.domain_id).or_default().push(target.asin.clone());
    }

    let semaphore = Arc::new(Semaphore::new(PARALLEL_QUERIES));
    let mut tasks = JoinSet::new();

    for (domain_id, asins) in by_domain {
        for asin in asins {
            let client = Arc::clone(client);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = client.query_product(&asin, domain_id).await;
                (asin, result)
            });
        }
    }

    let mut deals = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(product))) => {
                if product.current_price.unwrap_or(0.0) > 0.0 {
                    deals.push(deal_from_product(&product, "product_heuristic"));
                }
            }
            Ok((asin, Err(e))) => tracing::debug!("Seed query {} failed: {}", asin, e),
            Err(e) => tracing::warn!("Seed query task panicked: {}", e),
        }
    }
    deals
}

/// Triple-write plus alert check. Each sink is guarded on its own so one
/// failure cannot starve the others; the relational write comes first
/// because it is the source of truth.
async fn fan_out(ctx: &KeeperContext, deals: &[Deal]) {
    let rows: Vec<NewCollectedDeal> = deals.iter().map(collected_row).collect();
    match store::save_collected_deals_batch(&ctx.db_pool, &rows).await {
        Ok(saved) => tracing::debug!("Saved {} collected deals", saved),
        Err(e) => tracing::error!("Collected-deal batch insert failed: {}", e),
    }

    let topic = &ctx.config.kafka.topic_deals;
    for deal in deals {
        let event = DealUpdateEvent {
            asin: deal.asin.clone(),
            product_title: deal.title.clone(),
            current_price: deal.current_price,
            original_price: deal.list_price,
            discount_percent: deal.discount_percent,
            rating: deal.rating,
            review_count: deal.reviews as i32,
            sales_rank: Some(deal.sales_rank as i32),
            domain: deal.domain.clone(),
            timestamp: Utc::now().to_rfc3339(),
            event_type: "deal_update".to_string(),
        };
        send_deal_update(&ctx.producer, topic, &event).await;

        ctx.search.index_deal_update(&deal_document(deal)).await;

        if let Err(e) = create_alerts_for_crossed_watches(ctx, deal).await {
            tracing::warn!("Alert check for {} failed: {}", deal.asin, e);
        }
    }
}

async fn create_alerts_for_crossed_watches(ctx: &KeeperContext, deal: &Deal) -> Result<()> {
    let crossed =
        store::get_watches_crossed_by_price(&ctx.db_pool, &deal.asin, deal.current_price).await?;

    for watch in crossed {
        if store::has_recent_alert(&ctx.db_pool, watch.id, ChronoDuration::seconds(ALERT_GUARD_SECS)).await? {
            continue;
        }
        store::create_price_alert(
            &ctx.db_pool,
            watch.id,
            deal.current_price,
            watch.target_price,
            watch.current_price,
            Some(deal.current_price),
        )
        .await?;
        tracing::info!(
            "Alert: {} at {:.2} crossed target {:.2}",
            deal.asin,
            deal.current_price,
            watch.target_price
        );
    }
    Ok(())
}

fn collected_row(deal: &Deal) -> NewCollectedDeal {
    NewCollectedDeal {
        asin: deal.asin.clone(),
        title: Some(deal.title.clone()),
        current_price: deal.current_price,
        original_price: Some(deal.list_price),
        discount_percent: Some(deal.discount_percent),
        rating: Some(deal.rating),
        review_count: Some(deal.reviews as i32),
        sales_rank: Some(deal.sales_rank as i32),
        domain: deal.domain.clone(),
        category: deal.category.clone(),
        url: Some(deal.url.clone()),
        prime_eligible: deal.prime_eligible,
        deal_score: Some(deal.deal_score),
    }
}

pub fn deal_document(deal: &Deal) -> Value {
    json!({
        "asin": deal.asin,
        "title": deal.title,
        "description": deal.title,
        "current_price": deal.current_price,
        "original_price": deal.list_price,
        "discount_percent": deal.discount_percent,
        "rating": deal.rating,
        "review_count": deal.reviews,
        "sales_rank": deal.sales_rank,
        "domain": deal.domain,
        "market": deal.market,
        "category": deal.category.clone().unwrap_or_else(|| "general".to_string()),
        "prime_eligible": deal.prime_eligible,
        "url": deal.url,
        "deal_score": deal.deal_score,
        "layout": deal.layout,
        "timestamp": Utc::now().to_rfc3339(),
        "event_type": "deal_collector",
        "source": deal.source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[test]
    fn spam_reject_drops_the_canonical_bad_deal() {
        // Three independent rules fire: discount, rating, title keyword.
        let raw = json!({
            "asin": "B000BADD3A",
            "title": "Cheap Fast Shipping Dropship Keyboard",
            "current_price": 12.0,
            "list_price": 120.0,
            "discount_percent": 90.0,
            "rating": 3.2
        });
        let mut deal = normalize(&raw);
        deal.deal_score = score_deal(&deal);
        assert!(filter_spam(vec![deal]).is_empty());
    }

    #[test]
    fn kept_deal_satisfies_the_quantified_invariant() {
        let raw = json!({
            "asin": "B07W6JN8V8",
            "title": "Logitech K380 QWERTZ Tastatur",
            "current_price": 44.99,
            "list_price": 59.99,
            "rating": 4.5,
            "review_count": 834
        });
        let deal = normalize(&raw);
        let kept = filter_spam(vec![deal]);
        assert_eq!(kept.len(), 1);
        let d = &kept[0];
        assert!(d.rating >= 3.5);
        assert!(d.current_price >= 10.0);
        assert!(d.discount_percent <= 80.0);
        assert!(matches_keyboard_domain(&d.title));
    }

    #[test]
    fn deal_document_carries_index_fields() {
        let mut deal = normalize(&json!({
            "asin": "B07W6JN8V8",
            "title": "Logitech K380 QWERTZ",
            "current_price": 44.99,
            "list_price": 59.99,
            "rating": 4.5
        }));
        deal.layout = Some("QWERTZ".to_string());
        deal.deal_score = score_deal(&deal);

        let doc = deal_document(&deal);
        assert_eq!(doc["asin"], "B07W6JN8V8");
        assert_eq!(doc["event_type"], "deal_collector");
        assert_eq!(doc["layout"], "QWERTZ");
        assert_eq!(doc["category"], "general");
        assert!(doc["deal_score"].as_f64().unwrap() > 0.0);
    }
}
