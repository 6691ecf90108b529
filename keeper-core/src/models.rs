use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner of products auto-tracked by the deal pipeline. Created at startup.
pub const SYSTEM_USER_ID: Uuid = Uuid::from_u128(1);
pub const SYSTEM_USER_EMAIL: &str = "system@keeper.internal";

pub mod watch_status {
    pub const ACTIVE: &str = "ACTIVE";
    pub const PAUSED: &str = "PAUSED";
    pub const INACTIVE: &str = "INACTIVE";
}

pub mod alert_status {
    pub const PENDING: &str = "PENDING";
    pub const SENT: &str = "SENT";
    pub const FAILED: &str = "FAILED";
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub telegram_chat_id: Option<String>,
    pub webhook_url: Option<String>,
    pub preferred_channel: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::watched_products)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WatchedProduct {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asin: String,
    pub product_name: Option<String>,
    pub target_price: f64,
    pub current_price: Option<f64>,
    pub volatility_score: f64,
    pub status: String,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_price_change: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::price_alerts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PriceAlert {
    pub id: Uuid,
    pub watch_id: Uuid,
    pub triggered_price: f64,
    pub target_price: f64,
    pub old_price: Option<f64>,
    pub new_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub status: String,
    pub notification_channel: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::deal_filters)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DealFilter {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub categories: Option<serde_json::Value>,
    pub min_price: f64,
    pub max_price: f64,
    pub min_discount: f64,
    pub max_discount: f64,
    pub min_rating: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::collected_deals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CollectedDeal {
    pub id: Uuid,
    pub asin: String,
    pub title: Option<String>,
    pub current_price: f64,
    pub original_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub rating: Option<f64>,
    pub review_count: Option<i32>,
    pub sales_rank: Option<i32>,
    pub domain: String,
    pub category: Option<String>,
    pub url: Option<String>,
    pub prime_eligible: bool,
    pub deal_score: Option<f64>,
    pub collected_at: DateTime<Utc>,
}

/// Field set for the collected-deals bulk insert. Duplicates over time are
/// expected; each snapshot carries its own collected_at.
#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::collected_deals)]
pub struct NewCollectedDeal {
    pub asin: String,
    pub title: Option<String>,
    pub current_price: f64,
    pub original_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub rating: Option<f64>,
    pub review_count: Option<i32>,
    pub sales_rank: Option<i32>,
    pub domain: String,
    pub category: Option<String>,
    pub url: Option<String>,
    pub prime_eligible: bool,
    pub deal_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_user_id_is_the_reserved_low_uuid() {
        assert_eq!(
            SYSTEM_USER_ID.to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
    }
}
