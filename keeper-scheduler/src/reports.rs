use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing;

use keeper_collector::collector::deal_document;
use keeper_collector::normalize::{deal_from_hit, Deal};
use keeper_collector::score::{filter_spam, score_deal};
use keeper_core::events::{send_deal_update, DealUpdateEvent};
use keeper_core::models::DealFilter;
use keeper_core::{store, KeeperContext};
use keeper_dispatch::channels::EmailDelivery;
use keeper_dispatch::format::format_deal_report_html;
use keeper_keepa::{DealFilters, KeepaClient, KeepaError};

const MIN_DEALS_FOR_REPORT: usize = 5;
const MAX_DEALS_PER_REPORT: usize = 15;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReportSummary {
    pub reports_sent: usize,
    pub deals_indexed: usize,
}

/// Daily report pass: run every active filter, persist a report row and
/// email the owner when enough deals survive filtering.
pub async fn run_daily_deal_reports(
    ctx: &KeeperContext,
    client: &Arc<KeepaClient>,
) -> Result<ReportSummary> {
    let filter_rows = store::get_active_deal_filters_with_users(&ctx.db_pool).await?;
    if filter_rows.is_empty() {
        tracing::info!("No active deal filters, skipping reports");
        return Ok(ReportSummary::default());
    }

    let email = EmailDelivery::new(&ctx.config.delivery)?;
    let mut summary = ReportSummary::default();

    for (deal_filter, user) in filter_rows {
        match build_report(ctx, client, &deal_filter).await {
            Ok(deals) => {
                summary.deals_indexed += fan_out_report_deals(ctx, &deals).await;

                let payload: Vec<Value> = deals
                    .iter()
                    .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
                    .collect();
                let report_id =
                    store::save_deal_report(&ctx.db_pool, deal_filter.id, json!(payload)).await?;

                if deals.len() >= MIN_DEALS_FOR_REPORT && email.is_configured() {
                    let summary_line = format!(
                        "Discount: {:.0}-{:.0}%, Price: {:.0}-{:.0}€, Rating ≥ {:.1}",
                        deal_filter.min_discount,
                        deal_filter.max_discount,
                        deal_filter.min_price,
                        deal_filter.max_price,
                        deal_filter.min_rating
                    );
                    let html = format_deal_report_html(&payload, &deal_filter.name, &summary_line);
                    let subject = format!("Daily Deal Report: {}", deal_filter.name);

                    match email.send(&user.email, &subject, &html, None).await {
                        Ok(()) => {
                            store::mark_report_sent(&ctx.db_pool, report_id).await?;
                            summary.reports_sent += 1;
                            tracing::info!(
                                "Sent deal report '{}' to {} ({} deals)",
                                deal_filter.name,
                                user.email,
                                deals.len()
                            );
                        }
                        Err(e) => tracing::warn!(
                            "Failed to send deal report to {}: {}",
                            user.email,
                            e
                        ),
                    }
                }
            }
            Err(e) => tracing::error!(
                "Report '{}' for {} failed: {}",
                deal_filter.name,
                user.email,
                e
            ),
        }
    }

    tracing::info!(
        "Deal reports complete: {} sent, {} deals indexed",
        summary.reports_sent,
        summary.deals_indexed
    );
    Ok(summary)
}

/// Deal search for one filter: the deal endpoint when the tier allows it,
/// otherwise the best recent snapshots from the store.
async fn build_report(
    ctx: &KeeperContext,
    client: &Arc<KeepaClient>,
    deal_filter: &DealFilter,
) -> Result<Vec<Deal>> {
    let mut deals = if client.deal_endpoint_available() {
        let categories: Vec<i64> = deal_filter
            .categories
            .as_ref()
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|c| {
                        c.as_i64().or_else(|| c.as_str().and_then(|s| s.parse().ok()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let filters = DealFilters {
            domain_id: 3,
            include_categories: categories,
            min_discount: deal_filter.min_discount.max(0.0) as u32,
            max_discount: deal_filter.max_discount.clamp(0.0, 100.0) as u32,
            min_price_cents: (deal_filter.min_price.max(0.0) * 100.0) as u64,
            max_price_cents: (deal_filter.max_price.max(1.0) * 100.0) as u64,
            min_reviews: 0,
            ..DealFilters::default()
        };

        match client.search_deals(&filters).await {
            Ok(hits) => hits.iter().map(|h| deal_from_hit(h, filters.domain_id)).collect(),
            Err(KeepaError::DealAccessDenied) => {
                tracing::warn!("Deal endpoint denied; report falls back to collected snapshots");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Deal search failed, falling back to snapshots: {}", e);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    if deals.is_empty() {
        let snapshots = store::get_best_deals(
            &ctx.db_pool,
            deal_filter.min_discount,
            deal_filter.min_rating,
            deal_filter.max_price,
            (MAX_DEALS_PER_REPORT * 3) as i64,
        )
        .await?;
        deals = snapshots
            .iter()
            .map(|row| {
                keeper_collector::normalize(&json!({
                    "asin": row.asin,
                    "title": row.title,
                    "current_price": row.current_price,
                    "original_price": row.original_price,
                    "discount_percent": row.discount_percent,
                    "rating": row.rating,
                    "review_count": row.review_count,
                    "sales_rank": row.sales_rank,
                    "domain": row.domain,
                    "category": row.category,
                    "url": row.url,
                    "prime_eligible": row.prime_eligible,
                    "source": "collected_snapshot",
                }))
            })
            .collect();
    }

    // User-level bounds, then the shared scoring and spam gate.
    deals.retain(|d| {
        d.discount_percent >= deal_filter.min_discount
            && d.discount_percent <= deal_filter.max_discount
            && d.current_price >= deal_filter.min_price
            && d.current_price <= deal_filter.max_price
            && d.rating >= deal_filter.min_rating
    });
    for deal in &mut deals {
        deal.deal_score = score_deal(deal);
    }
    let mut kept = filter_spam(deals);
    kept.sort_by(|a, b| b.deal_score.partial_cmp(&a.deal_score).unwrap_or(std::cmp::Ordering::Equal));
    kept.truncate(MAX_DEALS_PER_REPORT);
    Ok(kept)
}

async fn fan_out_report_deals(ctx: &KeeperContext, deals: &[Deal]) -> usize {
    let mut indexed = 0;
    for deal in deals {
        if ctx.search.index_deal_update(&deal_document(deal)).await {
            indexed += 1;
        }

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
        send_deal_update(&ctx.producer, &ctx.config.kafka.topic_deals, &event).await;
    }
    indexed
}
