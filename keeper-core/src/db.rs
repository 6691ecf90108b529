use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

/// Waits between startup probes. Persistence is the one required resource,
/// so the database gets a short grace period to come up before we give up.
const PROBE_BACKOFF_SECS: [u64; 4] = [1, 2, 4, 8];
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!(
        "Connecting to {} (pool size {})",
        mask_database_url(&config.url),
        config.max_connections
    );

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    let mut backoffs = PROBE_BACKOFF_SECS.iter();
    loop {
        let failure = match tokio::time::timeout(PROBE_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Database connection established");
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => anyhow!("database connection failed: {}", e),
            Err(_) => anyhow!("database probe timed out after {:?}", PROBE_TIMEOUT),
        };

        match backoffs.next() {
            Some(secs) => {
                tracing::warn!("{}; next probe in {}s", failure, secs);
                tokio::time::sleep(Duration::from_secs(*secs)).await;
            }
            None => return Err(failure),
        }
    }
}

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        telegram_chat_id TEXT,
        webhook_url TEXT,
        preferred_channel TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS watched_products (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        asin TEXT NOT NULL,
        product_name TEXT,
        target_price DOUBLE PRECISION NOT NULL,
        current_price DOUBLE PRECISION,
        volatility_score DOUBLE PRECISION NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'ACTIVE',
        last_checked_at TIMESTAMPTZ,
        last_price_change TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_watched_products_user_asin
        ON watched_products (user_id, asin)",
    "CREATE TABLE IF NOT EXISTS price_history (
        id UUID PRIMARY KEY,
        watch_id UUID NOT NULL REFERENCES watched_products(id),
        price DOUBLE PRECISION NOT NULL,
        source TEXT,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_price_history_watch_time
        ON price_history (watch_id, recorded_at)",
    "CREATE TABLE IF NOT EXISTS price_alerts (
        id UUID PRIMARY KEY,
        watch_id UUID NOT NULL REFERENCES watched_products(id),
        triggered_price DOUBLE PRECISION NOT NULL,
        target_price DOUBLE PRECISION NOT NULL,
        old_price DOUBLE PRECISION,
        new_price DOUBLE PRECISION,
        discount_percent DOUBLE PRECISION,
        status TEXT NOT NULL DEFAULT 'PENDING',
        notification_channel TEXT,
        triggered_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        sent_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_price_alerts_watch ON price_alerts (watch_id)",
    "CREATE TABLE IF NOT EXISTS deal_filters (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        categories JSONB,
        min_price DOUBLE PRECISION NOT NULL DEFAULT 0,
        max_price DOUBLE PRECISION NOT NULL DEFAULT 500,
        min_discount DOUBLE PRECISION NOT NULL DEFAULT 20,
        max_discount DOUBLE PRECISION NOT NULL DEFAULT 80,
        min_rating DOUBLE PRECISION NOT NULL DEFAULT 4.0,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS deal_reports (
        id UUID PRIMARY KEY,
        filter_id UUID NOT NULL REFERENCES deal_filters(id),
        deals_data JSONB,
        generated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        sent_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS collected_deals (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        asin TEXT NOT NULL,
        title TEXT,
        current_price DOUBLE PRECISION NOT NULL,
        original_price DOUBLE PRECISION,
        discount_percent DOUBLE PRECISION,
        rating DOUBLE PRECISION,
        review_count INTEGER,
        sales_rank INTEGER,
        domain TEXT NOT NULL DEFAULT 'de',
        category TEXT,
        url TEXT,
        prime_eligible BOOLEAN NOT NULL DEFAULT FALSE,
        deal_score DOUBLE PRECISION,
        collected_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_collected_deals_asin_collected
        ON collected_deals (asin, collected_at)",
    "CREATE INDEX IF NOT EXISTS idx_collected_deals_discount
        ON collected_deals (discount_percent)",
    "CREATE INDEX IF NOT EXISTS idx_collected_deals_price
        ON collected_deals (current_price)",
];

/// Create-if-absent on every table and index. Safe to run on every startup.
pub async fn init_tables(pool: &DbPool) -> Result<()> {
    let mut conn = pool.get().await?;
    for statement in DDL {
        diesel::sql_query(*statement).execute(&mut conn).await?;
    }
    tracing::info!("Database tables ready");
    Ok(())
}

/// Keeps scheme, user and host readable in logs, hides the password.
fn mask_database_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _password)) => format!("{}://{}:****@{}", scheme, user, host),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_password_in_url() {
        assert_eq!(
            mask_database_url("postgres://keeper:hunter2@db:5432/keeper"),
            "postgres://keeper:****@db:5432/keeper"
        );
        // A password containing ':' is still fully hidden.
        assert_eq!(
            mask_database_url("postgres://keeper:hun:ter2@db/keeper"),
            "postgres://keeper:****@db/keeper"
        );
    }

    #[test]
    fn leaves_urls_without_a_password_alone() {
        assert_eq!(
            mask_database_url("postgres://localhost/keeper"),
            "postgres://localhost/keeper"
        );
        assert_eq!(
            mask_database_url("postgres://keeper@db/keeper"),
            "postgres://keeper@db/keeper"
        );
        assert_eq!(mask_database_url("not a url"), "not a url");
    }

    #[test]
    fn ddl_is_create_if_absent_only() {
        for statement in DDL {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "non-idempotent DDL: {}",
                statement
            );
        }
    }
}
