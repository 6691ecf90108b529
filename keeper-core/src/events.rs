use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing;

use crate::kafka::{produce_message, EventProducer};

/// Payload published on the price-updates topic, keyed by product code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdateEvent {
    pub asin: String,
    pub product_title: String,
    pub current_price: f64,
    pub target_price: Option<f64>,
    pub previous_price: Option<f64>,
    pub price_change: f64,
    pub domain: String,
    pub currency: String,
    pub timestamp: String,
    pub event_type: String,
}

impl PriceUpdateEvent {
    pub fn new(
        asin: &str,
        product_title: &str,
        current_price: f64,
        target_price: Option<f64>,
        previous_price: Option<f64>,
        domain: &str,
    ) -> Self {
        PriceUpdateEvent {
            asin: asin.to_string(),
            product_title: product_title.to_string(),
            current_price,
            target_price,
            previous_price,
            price_change: percent_change(previous_price, current_price),
            domain: domain.to_string(),
            currency: "EUR".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            event_type: "price_update".to_string(),
        }
    }
}

/// Payload published on the deal-updates topic, keyed by product code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealUpdateEvent {
    pub asin: String,
    pub product_title: String,
    pub current_price: f64,
    pub original_price: f64,
    pub discount_percent: f64,
    pub rating: f64,
    pub review_count: i32,
    pub sales_rank: Option<i32>,
    pub domain: String,
    pub timestamp: String,
    pub event_type: String,
}

/// Drop in price relative to the previous value, rounded to two decimals.
pub fn percent_change(previous: Option<f64>, current: f64) -> f64 {
    match previous {
        Some(prev) if prev > 0.0 => ((prev - current) / prev * 100.0 * 100.0).round() / 100.0,
        _ => 0.0,
    }
}

/// Publish a price update; a broker failure is logged and swallowed because
/// the relational write is the source of truth.
pub async fn send_price_update(
    producer: &EventProducer,
    topic: &str,
    event: &PriceUpdateEvent,
) -> bool {
    let payload = match serde_json::to_vec(event) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to serialize price update for {}: {}", event.asin, e);
            return false;
        }
    };

    match produce_message(producer, topic, &event.asin, &payload).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Price update for {} not published: {}", event.asin, e);
            false
        }
    }
}

pub async fn send_deal_update(
    producer: &EventProducer,
    topic: &str,
    event: &DealUpdateEvent,
) -> bool {
    let payload = match serde_json::to_vec(event) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to serialize deal update for {}: {}", event.asin, e);
            return false;
        }
    };

    match produce_message(producer, topic, &event.asin, &payload).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Deal update for {} not published: {}", event.asin, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_change_rounds_to_two_decimals() {
        assert_eq!(percent_change(Some(55.0), 44.99), 18.2);
        assert_eq!(percent_change(Some(30.0), 20.0), 33.33);
    }

    #[test]
    fn percent_change_without_previous_is_zero() {
        assert_eq!(percent_change(None, 42.0), 0.0);
        assert_eq!(percent_change(Some(0.0), 42.0), 0.0);
    }

    #[test]
    fn price_event_carries_the_wire_fields() {
        let event = PriceUpdateEvent::new("B07W6JN8V8", "Logitech K380", 44.99, Some(45.0), Some(55.0), "de");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["asin"], "B07W6JN8V8");
        assert_eq!(value["event_type"], "price_update");
        assert_eq!(value["currency"], "EUR");
        assert_eq!(value["price_change"], 18.2);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }
}
