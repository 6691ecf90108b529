use serde::{Deserialize, Serialize};
use serde_json::Value;

use keeper_keepa::{domain_code, domain_host, DealHit, Product};

/// Canonical deal record. Upstream payloads arrive in several shapes (both
/// underscore and camelCase keys, list/original price synonyms, numbers as
/// strings); everything downstream of `normalize` sees only this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub asin: String,
    pub title: String,
    pub current_price: f64,
    pub list_price: f64,
    pub discount_percent: f64,
    pub rating: f64,
    pub reviews: i64,
    pub sales_rank: i64,
    pub prime_eligible: bool,
    pub url: String,
    pub source: String,
    pub category: Option<String>,
    pub domain_id: u32,
    pub domain: String,
    pub market: String,
    pub layout: Option<String>,
    pub deal_score: f64,
}

const DEFAULT_SALES_RANK: i64 = 100_000;

/// Numeric field that may arrive as a JSON number or a stringified number.
fn number(value: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match value.get(*key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

fn boolean(value: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

/// Discount from the two prices, one decimal place. Only derived when both
/// prices are positive and the list price actually exceeds the current one.
pub fn derive_discount(current: f64, list: f64) -> f64 {
    if current > 0.0 && list > current {
        ((1.0 - current / list) * 1000.0).round() / 10.0
    } else {
        0.0
    }
}

/// Normalize an upstream deal payload. Idempotent: feeding the serialized
/// output back in reproduces the same record.
pub fn normalize(raw: &Value) -> Deal {
    let asin = string(raw, &["asin"]).unwrap_or_default();

    let domain_id = number(raw, &["domain_id", "domainId"])
        .map(|v| v as u32)
        .filter(|id| domain_code(*id).is_some())
        .unwrap_or(3);
    let domain = string(raw, &["domain"])
        .unwrap_or_else(|| domain_code(domain_id).unwrap_or("de").to_string())
        .to_lowercase();
    let market = string(raw, &["market"])
        .unwrap_or_else(|| domain.clone())
        .to_uppercase();

    let current_price = number(raw, &["current_price", "currentPrice"]).unwrap_or(0.0);
    let mut list_price = number(
        raw,
        &["list_price", "listPrice", "original_price", "originalPrice"],
    )
    .unwrap_or(current_price);
    if list_price <= 0.0 {
        list_price = current_price;
    }

    let discount_percent = number(raw, &["discount_percent", "discountPercent"])
        .unwrap_or_else(|| derive_discount(current_price, list_price));

    Deal {
        title: string(raw, &["title"]).unwrap_or_else(|| "Unknown".to_string()),
        current_price,
        list_price,
        discount_percent,
        rating: number(raw, &["rating"]).unwrap_or(0.0),
        reviews: number(raw, &["reviews", "review_count", "reviewCount"]).unwrap_or(0.0) as i64,
        sales_rank: number(raw, &["sales_rank", "salesRank"]).unwrap_or(DEFAULT_SALES_RANK as f64)
            as i64,
        prime_eligible: boolean(raw, &["prime_eligible", "primeEligible"]),
        url: string(raw, &["url", "amazonUrl"])
            .unwrap_or_else(|| format!("https://{}/dp/{}", domain_host(domain_id), asin)),
        source: string(raw, &["source"]).unwrap_or_else(|| "product_api".to_string()),
        category: string(raw, &["category"]),
        layout: string(raw, &["layout"]),
        deal_score: number(raw, &["deal_score", "dealScore"]).unwrap_or(0.0),
        asin,
        domain_id,
        domain,
        market,
    }
}

/// Build a canonical deal from a product query result.
pub fn deal_from_product(product: &Product, source: &str) -> Deal {
    let current_price = product.current_price.unwrap_or(0.0);
    let mut list_price = product.list_price.unwrap_or(current_price);
    if list_price <= 0.0 {
        list_price = current_price;
    }

    let domain = domain_code(product.domain_id).unwrap_or("de").to_string();

    Deal {
        asin: product.asin.clone(),
        title: product.title.clone(),
        current_price,
        list_price,
        discount_percent: derive_discount(current_price, list_price),
        rating: product.rating,
        reviews: product.review_count,
        sales_rank: product.sales_rank.unwrap_or(DEFAULT_SALES_RANK),
        prime_eligible: false,
        url: product.url.clone(),
        source: source.to_string(),
        category: product.category.clone(),
        domain_id: product.domain_id,
        market: domain.to_uppercase(),
        domain,
        layout: None,
        deal_score: 0.0,
    }
}

/// Build a canonical deal from a deal-endpoint row.
pub fn deal_from_hit(hit: &DealHit, domain_id: u32) -> Deal {
    let domain = domain_code(domain_id).unwrap_or("de").to_string();
    Deal {
        asin: hit.asin.clone(),
        title: hit.title.clone(),
        current_price: hit.current_price,
        list_price: hit.list_price,
        discount_percent: hit.discount_percent,
        rating: hit.rating,
        reviews: hit.reviews,
        sales_rank: DEFAULT_SALES_RANK,
        prime_eligible: false,
        url: hit.url.clone(),
        source: "deals_api".to_string(),
        category: None,
        domain_id,
        market: domain.to_uppercase(),
        domain,
        layout: None,
        deal_score: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn underscore_and_camel_price_aliases_agree() {
        let a = normalize(&json!({"asin": "B005EOWBHC", "current_price": 49.99}));
        let b = normalize(&json!({"asin": "B005EOWBHC", "currentPrice": 49.99}));
        assert_eq!(a.current_price, 49.99);
        assert_eq!(a.current_price, b.current_price);
    }

    #[test]
    fn list_and_original_price_aliases_agree() {
        for key in ["list_price", "listPrice", "original_price", "originalPrice"] {
            let deal = normalize(&json!({
                "asin": "B005EOWBHC",
                "current_price": 40.0,
                key: 80.0
            }));
            assert_eq!(deal.list_price, 80.0, "alias {}", key);
            assert_eq!(deal.discount_percent, 50.0, "alias {}", key);
        }
    }

    #[test]
    fn discount_aliases_override_derivation() {
        let underscore = normalize(&json!({
            "asin": "B005EOWBHC",
            "current_price": 40.0,
            "list_price": 80.0,
            "discount_percent": 33.0
        }));
        assert_eq!(underscore.discount_percent, 33.0);

        let camel = normalize(&json!({
            "asin": "B005EOWBHC",
            "current_price": 40.0,
            "list_price": 80.0,
            "discountPercent": 33.0
        }));
        assert_eq!(camel.discount_percent, 33.0);
    }

    #[test]
    fn review_count_aliases_agree() {
        for key in ["reviews", "review_count", "reviewCount"] {
            let deal = normalize(&json!({"asin": "B005EOWBHC", key: 123}));
            assert_eq!(deal.reviews, 123, "alias {}", key);
        }
    }

    #[test]
    fn sales_rank_and_prime_aliases_agree() {
        for key in ["sales_rank", "salesRank"] {
            assert_eq!(normalize(&json!({key: 777})).sales_rank, 777, "alias {}", key);
        }
        for key in ["prime_eligible", "primeEligible"] {
            assert!(normalize(&json!({key: true})).prime_eligible, "alias {}", key);
        }
        for key in ["domain_id", "domainId"] {
            assert_eq!(normalize(&json!({key: 4})).domain_id, 4, "alias {}", key);
        }
    }

    #[test]
    fn stringified_numbers_are_accepted() {
        let deal = normalize(&json!({
            "asin": "B005EOWBHC",
            "current_price": "44.99",
            "rating": "4.5",
            "review_count": "210"
        }));
        assert_eq!(deal.current_price, 44.99);
        assert_eq!(deal.rating, 4.5);
        assert_eq!(deal.reviews, 210);
    }

    #[test]
    fn discount_derivation_bounds() {
        assert_eq!(derive_discount(40.0, 80.0), 50.0);
        assert_eq!(derive_discount(29.99, 44.95), 33.3);
        // list <= current or non-positive prices never derive a discount
        assert_eq!(derive_discount(80.0, 40.0), 0.0);
        assert_eq!(derive_discount(0.0, 40.0), 0.0);
        assert_eq!(derive_discount(40.0, 40.0), 0.0);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let deal = normalize(&json!({"asin": "B005EOWBHC"}));
        assert_eq!(deal.title, "Unknown");
        assert_eq!(deal.sales_rank, 100_000);
        assert_eq!(deal.domain_id, 3);
        assert_eq!(deal.domain, "de");
        assert_eq!(deal.market, "DE");
        assert_eq!(deal.url, "https://amazon.de/dp/B005EOWBHC");
        assert_eq!(deal.source, "product_api");
    }

    #[test]
    fn unknown_domain_ids_collapse_to_the_default() {
        let deal = normalize(&json!({"asin": "B005EOWBHC", "domain_id": 42}));
        assert_eq!(deal.domain_id, 3);
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = json!({
            "asin": "B07W6JN8V8",
            "title": "Logitech K380 QWERTZ",
            "currentPrice": "44.99",
            "originalPrice": 59.99,
            "reviewCount": 834,
            "salesRank": 1200,
            "primeEligible": true,
            "domainId": 3
        });
        let once = normalize(&raw);
        let twice = normalize(&serde_json::to_value(&once).unwrap());
        assert_eq!(once, twice);
    }
}
