use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use rand::Rng;
use tracing;
use uuid::Uuid;

use crate::db::{DbConnection, DbPool};
use crate::models::{
    alert_status, watch_status, DealFilter, NewCollectedDeal, PriceAlert, User, WatchedProduct,
    SYSTEM_USER_EMAIL, SYSTEM_USER_ID,
};
use crate::schema::{
    collected_deals, deal_filters, deal_reports, price_alerts, price_history, users,
    watched_products,
};

/// Connection acquisition is the transient failure class here; statement
/// errors (constraint violations) surface without retry.
pub async fn get_conn(pool: &DbPool) -> Result<DbConnection> {
    let mut last_error = None;
    for attempt in 0..3u32 {
        match pool.get().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                tracing::warn!("Connection checkout failed (attempt {}/3): {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
        if attempt < 2 {
            let jitter = rand::thread_rng().gen_range(0..250);
            let backoff = std::time::Duration::from_millis(500 * (1 << attempt) + jitter);
            tokio::time::sleep(backoff).await;
        }
    }
    match last_error {
        Some(e) => Err(anyhow!("Failed to check out database connection: {}", e)),
        None => Err(anyhow!("Failed to check out database connection")),
    }
}

pub async fn get_or_create_system_user(pool: &DbPool) -> Result<User> {
    let mut conn = get_conn(pool).await?;

    diesel::insert_into(users::table)
        .values((
            users::id.eq(SYSTEM_USER_ID),
            users::email.eq(SYSTEM_USER_EMAIL),
            users::is_active.eq(true),
        ))
        .on_conflict(users::id)
        .do_nothing()
        .execute(&mut conn)
        .await?;

    users::table
        .filter(users::id.eq(SYSTEM_USER_ID))
        .select(User::as_select())
        .first(&mut conn)
        .await
        .context("system user missing after upsert")
}

/// Create a user-owned watch. Call-site validation: the code must be 10
/// alphanumeric characters and the target positive.
pub async fn create_watch(
    pool: &DbPool,
    user_id: Uuid,
    asin: &str,
    target_price: f64,
    current_price: Option<f64>,
) -> Result<WatchedProduct> {
    if asin.len() != 10 || !asin.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow!("invalid product code: {}", asin));
    }
    if target_price <= 0.0 {
        return Err(anyhow!("target price must be positive"));
    }

    let mut conn = get_conn(pool).await?;
    let watch = diesel::insert_into(watched_products::table)
        .values((
            watched_products::id.eq(Uuid::new_v4()),
            watched_products::user_id.eq(user_id),
            watched_products::asin.eq(asin),
            watched_products::target_price.eq(target_price),
            watched_products::current_price.eq(current_price),
            watched_products::volatility_score.eq(0.0),
            watched_products::status.eq(watch_status::ACTIVE),
        ))
        .returning(WatchedProduct::as_returning())
        .get_result(&mut conn)
        .await?;
    Ok(watch)
}

/// Soft delete: the row survives with status INACTIVE.
pub async fn soft_delete_watch(pool: &DbPool, watch_id: Uuid, user_id: Uuid) -> Result<bool> {
    let mut conn = get_conn(pool).await?;
    let updated = diesel::update(
        watched_products::table
            .filter(watched_products::id.eq(watch_id))
            .filter(watched_products::user_id.eq(user_id)),
    )
    .set((
        watched_products::status.eq(watch_status::INACTIVE),
        watched_products::updated_at.eq(Utc::now()),
    ))
    .execute(&mut conn)
    .await?;
    Ok(updated > 0)
}

pub async fn get_active_watches(pool: &DbPool) -> Result<Vec<WatchedProduct>> {
    let mut conn = get_conn(pool).await?;
    let watches = watched_products::table
        .filter(watched_products::status.eq(watch_status::ACTIVE))
        .select(WatchedProduct::as_select())
        .load(&mut conn)
        .await?;
    Ok(watches)
}

pub async fn get_watch(pool: &DbPool, watch_id: Uuid) -> Result<Option<WatchedProduct>> {
    let mut conn = get_conn(pool).await?;
    let watch = watched_products::table
        .filter(watched_products::id.eq(watch_id))
        .select(WatchedProduct::as_select())
        .first(&mut conn)
        .await
        .optional()?;
    Ok(watch)
}

/// First tracked watch for a product code, regardless of owner. Used by the
/// price consumer to decide whether a message refers to a known product.
pub async fn find_watch_by_asin(pool: &DbPool, asin: &str) -> Result<Option<WatchedProduct>> {
    let mut conn = get_conn(pool).await?;
    let watch = watched_products::table
        .filter(watched_products::asin.eq(asin))
        .select(WatchedProduct::as_select())
        .first(&mut conn)
        .await
        .optional()?;
    Ok(watch)
}

/// Atomic price update: the watch row and its history row commit together.
/// A history row is inserted whether or not the price changed.
pub async fn update_watch_price(
    pool: &DbPool,
    watch_id: Uuid,
    price: f64,
    source: Option<&str>,
) -> Result<Option<WatchedProduct>> {
    if price < 0.0 {
        return Err(anyhow!("negative price for watch {}", watch_id));
    }

    let mut conn = get_conn(pool).await?;
    let source = source.map(|s| s.to_string());

    let updated = conn
        .transaction::<Option<WatchedProduct>, diesel::result::Error, _>(|conn| {
            async move {
                let watch: Option<WatchedProduct> = watched_products::table
                    .filter(watched_products::id.eq(watch_id))
                    .select(WatchedProduct::as_select())
                    .first(conn)
                    .await
                    .optional()?;

                let Some(watch) = watch else {
                    return Ok(None);
                };

                let now = Utc::now();

                diesel::insert_into(price_history::table)
                    .values((
                        price_history::id.eq(Uuid::new_v4()),
                        price_history::watch_id.eq(watch_id),
                        price_history::price.eq(price),
                        price_history::source.eq(source.as_deref()),
                        price_history::recorded_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                let changed = match watch.current_price {
                    Some(previous) => (previous - price).abs() > 0.009,
                    None => true,
                };

                let price_change_at = if changed {
                    Some(now)
                } else {
                    watch.last_price_change
                };

                let updated = diesel::update(
                    watched_products::table.filter(watched_products::id.eq(watch_id)),
                )
                .set((
                    watched_products::current_price.eq(Some(price)),
                    watched_products::last_checked_at.eq(Some(now)),
                    watched_products::last_price_change.eq(price_change_at),
                    watched_products::updated_at.eq(now),
                ))
                .returning(WatchedProduct::as_returning())
                .get_result(conn)
                .await?;

                Ok(Some(updated))
            }
            .scope_boxed()
        })
        .await?;

    Ok(updated)
}

/// Price absent upstream: the watch still records that it was checked.
pub async fn touch_watch_checked(pool: &DbPool, watch_id: Uuid) -> Result<()> {
    let mut conn = get_conn(pool).await?;
    let now = Utc::now();
    diesel::update(watched_products::table.filter(watched_products::id.eq(watch_id)))
        .set((
            watched_products::last_checked_at.eq(Some(now)),
            watched_products::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
    Ok(())
}

/// Find-or-create a watch owned by the system user. Idempotent: the unique
/// (user_id, asin) index absorbs concurrent creators.
pub async fn ensure_tracked_product(
    pool: &DbPool,
    asin: &str,
    title: Option<&str>,
    current_price: Option<f64>,
) -> Result<Uuid> {
    if asin.len() != 10 {
        return Err(anyhow!("invalid product code: {}", asin));
    }

    let mut conn = get_conn(pool).await?;

    let existing: Option<Uuid> = watched_products::table
        .filter(watched_products::asin.eq(asin))
        .filter(watched_products::user_id.eq(SYSTEM_USER_ID))
        .select(watched_products::id)
        .first(&mut conn)
        .await
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    drop(conn);
    get_or_create_system_user(pool).await?;
    let mut conn = get_conn(pool).await?;

    let new_id = Uuid::new_v4();
    diesel::insert_into(watched_products::table)
        .values((
            watched_products::id.eq(new_id),
            watched_products::user_id.eq(SYSTEM_USER_ID),
            watched_products::asin.eq(asin),
            watched_products::product_name.eq(title),
            watched_products::target_price.eq(0.0),
            watched_products::current_price.eq(current_price),
            watched_products::volatility_score.eq(0.0),
            watched_products::status.eq(watch_status::ACTIVE),
        ))
        .on_conflict((watched_products::user_id, watched_products::asin))
        .do_nothing()
        .execute(&mut conn)
        .await?;

    watched_products::table
        .filter(watched_products::asin.eq(asin))
        .filter(watched_products::user_id.eq(SYSTEM_USER_ID))
        .select(watched_products::id)
        .first(&mut conn)
        .await
        .context("tracked product missing after upsert")
}

/// Append-only history insert, no watch-level update. The price consumer
/// uses this for replayed messages.
pub async fn append_price_history(
    pool: &DbPool,
    watch_id: Uuid,
    price: f64,
    source: &str,
) -> Result<()> {
    if price < 0.0 {
        return Err(anyhow!("negative price for watch {}", watch_id));
    }
    let mut conn = get_conn(pool).await?;
    diesel::insert_into(price_history::table)
        .values((
            price_history::id.eq(Uuid::new_v4()),
            price_history::watch_id.eq(watch_id),
            price_history::price.eq(price),
            price_history::source.eq(Some(source)),
            price_history::recorded_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
    Ok(())
}

/// Record a deal snapshot price into history for the (auto-created) system
/// watch and refresh the watch-level price.
pub async fn record_deal_price(
    pool: &DbPool,
    asin: &str,
    price: f64,
    title: Option<&str>,
    source: &str,
    recorded_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    if price <= 0.0 {
        return Ok(false);
    }

    let watch_id = ensure_tracked_product(pool, asin, title, Some(price)).await?;
    let mut conn = get_conn(pool).await?;
    let now = Utc::now();

    diesel::insert_into(price_history::table)
        .values((
            price_history::id.eq(Uuid::new_v4()),
            price_history::watch_id.eq(watch_id),
            price_history::price.eq(price),
            price_history::source.eq(Some(source)),
            price_history::recorded_at.eq(recorded_at.unwrap_or(now)),
        ))
        .execute(&mut conn)
        .await?;

    diesel::update(watched_products::table.filter(watched_products::id.eq(watch_id)))
        .set((
            watched_products::current_price.eq(Some(price)),
            watched_products::last_checked_at.eq(Some(now)),
            watched_products::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

    Ok(true)
}

/// Bulk insert of deal snapshots in one transaction. Returns rows written.
pub async fn save_collected_deals_batch(
    pool: &DbPool,
    deals: &[NewCollectedDeal],
) -> Result<usize> {
    if deals.is_empty() {
        return Ok(0);
    }

    let mut conn = get_conn(pool).await?;
    let count = diesel::insert_into(collected_deals::table)
        .values(deals)
        .execute(&mut conn)
        .await?;
    Ok(count)
}

/// Most recent positive snapshot price for a product code. Used as a price
/// fallback when the product query comes back empty.
pub async fn get_latest_deal_price(pool: &DbPool, asin: &str) -> Result<Option<f64>> {
    let mut conn = get_conn(pool).await?;
    let price = collected_deals::table
        .filter(collected_deals::asin.eq(asin))
        .filter(collected_deals::current_price.gt(0.0))
        .order(collected_deals::collected_at.desc())
        .select(collected_deals::current_price)
        .first::<f64>(&mut conn)
        .await
        .optional()?;
    Ok(price)
}

pub async fn create_price_alert(
    pool: &DbPool,
    watch_id: Uuid,
    triggered_price: f64,
    target_price: f64,
    old_price: Option<f64>,
    new_price: Option<f64>,
) -> Result<Uuid> {
    let mut conn = get_conn(pool).await?;

    let discount = match old_price {
        Some(old) if old > 0.0 => {
            Some(((old - triggered_price) / old * 100.0 * 100.0).round() / 100.0)
        }
        _ => None,
    };

    let alert_id = Uuid::new_v4();
    diesel::insert_into(price_alerts::table)
        .values((
            price_alerts::id.eq(alert_id),
            price_alerts::watch_id.eq(watch_id),
            price_alerts::triggered_price.eq(triggered_price),
            price_alerts::target_price.eq(target_price),
            price_alerts::old_price.eq(old_price),
            price_alerts::new_price.eq(new_price),
            price_alerts::discount_percent.eq(discount),
            price_alerts::status.eq(alert_status::PENDING),
        ))
        .execute(&mut conn)
        .await?;

    Ok(alert_id)
}

/// Any PENDING or SENT alert for this watch inside the window. Guards the
/// consumers against re-delivered messages creating alert storms.
pub async fn has_recent_alert(
    pool: &DbPool,
    watch_id: Uuid,
    window: ChronoDuration,
) -> Result<bool> {
    let mut conn = get_conn(pool).await?;
    let since = Utc::now() - window;

    let existing: Option<Uuid> = price_alerts::table
        .filter(price_alerts::watch_id.eq(watch_id))
        .filter(
            price_alerts::status
                .eq(alert_status::PENDING)
                .or(price_alerts::status.eq(alert_status::SENT)),
        )
        .filter(price_alerts::triggered_at.gt(since))
        .select(price_alerts::id)
        .first(&mut conn)
        .await
        .optional()?;

    Ok(existing.is_some())
}

/// Cent-rounded price comparison against SENT alerts inside the window;
/// the authoritative half of the dispatcher's duplicate check.
pub async fn has_sent_duplicate(
    pool: &DbPool,
    watch_id: Uuid,
    triggered_price: f64,
    window: ChronoDuration,
) -> Result<bool> {
    let mut conn = get_conn(pool).await?;
    let since = Utc::now() - window;

    let recent: Vec<f64> = price_alerts::table
        .filter(price_alerts::watch_id.eq(watch_id))
        .filter(price_alerts::status.eq(alert_status::SENT))
        .filter(price_alerts::triggered_at.gt(since))
        .select(price_alerts::triggered_price)
        .load(&mut conn)
        .await?;

    let wanted = round_to_cents(triggered_price);
    Ok(recent.iter().any(|p| round_to_cents(*p) == wanted))
}

pub fn round_to_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

pub async fn get_pending_alerts_with_context(
    pool: &DbPool,
) -> Result<Vec<(PriceAlert, WatchedProduct, User)>> {
    let mut conn = get_conn(pool).await?;
    let rows = price_alerts::table
        .inner_join(watched_products::table.inner_join(users::table))
        .filter(price_alerts::status.eq(alert_status::PENDING))
        .order(price_alerts::triggered_at.asc())
        .select((
            PriceAlert::as_select(),
            WatchedProduct::as_select(),
            User::as_select(),
        ))
        .load(&mut conn)
        .await?;
    Ok(rows)
}

pub async fn count_sent_alerts_for_user(
    pool: &DbPool,
    user_id: Uuid,
    window: ChronoDuration,
) -> Result<i64> {
    let mut conn = get_conn(pool).await?;
    let since = Utc::now() - window;

    let count = price_alerts::table
        .inner_join(watched_products::table)
        .filter(watched_products::user_id.eq(user_id))
        .filter(price_alerts::status.eq(alert_status::SENT))
        .filter(price_alerts::sent_at.gt(since))
        .count()
        .get_result(&mut conn)
        .await?;
    Ok(count)
}

pub async fn mark_alert_sent(pool: &DbPool, alert_id: Uuid, channel: &str) -> Result<()> {
    let mut conn = get_conn(pool).await?;
    diesel::update(price_alerts::table.filter(price_alerts::id.eq(alert_id)))
        .set((
            price_alerts::status.eq(alert_status::SENT),
            price_alerts::sent_at.eq(Some(Utc::now())),
            price_alerts::notification_channel.eq(Some(channel)),
        ))
        .execute(&mut conn)
        .await?;
    Ok(())
}

pub async fn mark_alert_failed(pool: &DbPool, alert_id: Uuid) -> Result<()> {
    let mut conn = get_conn(pool).await?;
    diesel::update(price_alerts::table.filter(price_alerts::id.eq(alert_id)))
        .set(price_alerts::status.eq(alert_status::FAILED))
        .execute(&mut conn)
        .await?;
    Ok(())
}

/// Active watches on a product code whose target the given price crosses
/// (with the 1% tolerance). Feeds alert creation from the deal pipeline.
pub async fn get_watches_crossed_by_price(
    pool: &DbPool,
    asin: &str,
    price: f64,
) -> Result<Vec<WatchedProduct>> {
    let mut conn = get_conn(pool).await?;
    let watches: Vec<WatchedProduct> = watched_products::table
        .filter(watched_products::asin.eq(asin))
        .filter(watched_products::status.eq(watch_status::ACTIVE))
        .filter(watched_products::target_price.gt(0.0))
        .select(WatchedProduct::as_select())
        .load(&mut conn)
        .await?;

    Ok(watches
        .into_iter()
        .filter(|w| price <= w.target_price * 1.01)
        .collect())
}

/// Best recent snapshots matching a filter, highest discount first. Report
/// fallback when the deal endpoint is unavailable.
pub async fn get_best_deals(
    pool: &DbPool,
    min_discount: f64,
    min_rating: f64,
    max_price: f64,
    limit: i64,
) -> Result<Vec<crate::models::CollectedDeal>> {
    let mut conn = get_conn(pool).await?;
    let deals = collected_deals::table
        .filter(collected_deals::discount_percent.ge(min_discount))
        .filter(collected_deals::rating.ge(min_rating))
        .filter(collected_deals::current_price.le(max_price))
        .order(collected_deals::discount_percent.desc())
        .limit(limit)
        .select(crate::models::CollectedDeal::as_select())
        .load(&mut conn)
        .await?;
    Ok(deals)
}

pub async fn get_active_deal_filters_with_users(
    pool: &DbPool,
) -> Result<Vec<(DealFilter, User)>> {
    let mut conn = get_conn(pool).await?;
    let rows = deal_filters::table
        .inner_join(users::table)
        .filter(deal_filters::is_active.eq(true))
        .select((DealFilter::as_select(), User::as_select()))
        .load(&mut conn)
        .await?;
    Ok(rows)
}

pub async fn save_deal_report(
    pool: &DbPool,
    filter_id: Uuid,
    deals_data: serde_json::Value,
) -> Result<Uuid> {
    let mut conn = get_conn(pool).await?;
    let report_id = Uuid::new_v4();
    diesel::insert_into(deal_reports::table)
        .values((
            deal_reports::id.eq(report_id),
            deal_reports::filter_id.eq(filter_id),
            deal_reports::deals_data.eq(Some(deals_data)),
        ))
        .execute(&mut conn)
        .await?;
    Ok(report_id)
}

pub async fn mark_report_sent(pool: &DbPool, report_id: Uuid) -> Result<()> {
    let mut conn = get_conn(pool).await?;
    diesel::update(deal_reports::table.filter(deal_reports::id.eq(report_id)))
        .set(deal_reports::sent_at.eq(Some(Utc::now())))
        .execute(&mut conn)
        .await?;
    Ok(())
}

/// One-shot startup job: replay collected deal snapshots into price history
/// for the system user. Skips entirely once any system-user history exists.
pub async fn backfill_price_history_from_deals(pool: &DbPool) -> Result<usize> {
    let mut conn = get_conn(pool).await?;

    let existing: i64 = price_history::table
        .inner_join(watched_products::table)
        .filter(watched_products::user_id.eq(SYSTEM_USER_ID))
        .count()
        .get_result(&mut conn)
        .await?;

    if existing > 0 {
        tracing::info!("Backfill already done, skipping");
        return Ok(0);
    }

    let asins: Vec<String> = collected_deals::table
        .filter(collected_deals::current_price.gt(0.0))
        .select(collected_deals::asin)
        .distinct()
        .load(&mut conn)
        .await?;

    if asins.is_empty() {
        tracing::info!("No collected deals to backfill");
        return Ok(0);
    }

    drop(conn);

    let mut total = 0usize;
    for asin in &asins {
        let mut conn = get_conn(pool).await?;
        let snapshots: Vec<(Option<String>, f64, DateTime<Utc>)> = collected_deals::table
            .filter(collected_deals::asin.eq(asin))
            .filter(collected_deals::current_price.gt(0.0))
            .order(collected_deals::collected_at.asc())
            .select((
                collected_deals::title,
                collected_deals::current_price,
                collected_deals::collected_at,
            ))
            .load(&mut conn)
            .await?;
        drop(conn);

        for (title, price, collected_at) in snapshots {
            if record_deal_price(pool, asin, price, title.as_deref(), "backfill", Some(collected_at))
                .await?
            {
                total += 1;
            }
        }
    }

    tracing::info!("Backfilled {} history rows from {} products", total, asins.len());
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cent_rounding_collapses_float_noise() {
        assert_eq!(round_to_cents(44.99), 4499);
        assert_eq!(round_to_cents(44.990000001), 4499);
        assert_eq!(round_to_cents(44.994), 4499);
        assert_ne!(round_to_cents(44.99), round_to_cents(45.00));
    }
}
