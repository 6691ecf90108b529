use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing;

use crate::bucket::{TokenBucket, DEFAULT_MAX_WAIT};
use crate::error::{KeepaError, KeepaResult};
use crate::series;
use crate::series::PackedSeries;

const BASE_URL: &str = "https://api.keepa.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 2;
const THROTTLE_PAUSE: Duration = Duration::from_secs(60);

pub const QUERY_COST: u32 = 15;
pub const DEALS_COST: u32 = 5;

/// Marketplace domains the pipeline monitors. Numeric ids are fixed by the
/// upstream API; hosts are only used to construct product URLs.
pub const DOMAINS: [(u32, &str, &str); 6] = [
    (1, "us", "amazon.com"),
    (2, "uk", "amazon.co.uk"),
    (3, "de", "amazon.de"),
    (4, "fr", "amazon.fr"),
    (8, "it", "amazon.it"),
    (9, "es", "amazon.es"),
];

pub fn domain_code(domain_id: u32) -> Option<&'static str> {
    DOMAINS.iter().find(|(id, _, _)| *id == domain_id).map(|(_, code, _)| *code)
}

pub fn domain_host(domain_id: u32) -> &'static str {
    DOMAINS
        .iter()
        .find(|(id, _, _)| *id == domain_id)
        .map(|(_, _, host)| *host)
        .unwrap_or("amazon.de")
}

pub fn validate_asin(asin: &str) -> KeepaResult<()> {
    if asin.len() == 10 && asin.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(KeepaError::InvalidAsin(asin.to_string()))
    }
}

/// Canonical product view after price extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub asin: String,
    pub title: String,
    pub current_price: Option<f64>,
    pub list_price: Option<f64>,
    pub buy_box_price: Option<f64>,
    pub rating: f64,
    pub review_count: i64,
    pub sales_rank: Option<i64>,
    pub category: Option<String>,
    pub domain_id: u32,
    pub url: String,
}

/// One row from the deal endpoint after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealHit {
    pub asin: String,
    pub title: String,
    pub current_price: f64,
    pub list_price: f64,
    pub discount_percent: f64,
    pub rating: f64,
    pub reviews: i64,
    pub url: String,
}

/// Filter set for the deal endpoint.
#[derive(Debug, Clone)]
pub struct DealFilters {
    pub page: u32,
    pub domain_id: u32,
    pub include_categories: Vec<i64>,
    pub exclude_categories: Vec<i64>,
    pub min_discount: u32,
    pub max_discount: u32,
    pub min_price_cents: u64,
    pub max_price_cents: u64,
    pub min_reviews: u32,
}

impl Default for DealFilters {
    fn default() -> Self {
        DealFilters {
            page: 0,
            domain_id: 3,
            include_categories: Vec::new(),
            exclude_categories: Vec::new(),
            min_discount: 20,
            max_discount: 90,
            min_price_cents: 500,
            max_price_cents: 50_000,
            min_reviews: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenStatus {
    pub available: u32,
    pub refill_in_ms: u64,
    pub rate_per_minute: u32,
}

#[derive(Debug, Deserialize)]
struct RawStats {
    current: Option<Vec<Option<i64>>>,
    #[serde(rename = "buyBoxPrice")]
    buy_box_price: Option<i64>,
    #[serde(rename = "listPrice")]
    list_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawOffer {
    #[serde(rename = "offerCSV")]
    offer_csv: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    title: Option<String>,
    csv: Option<PackedSeries>,
    stats: Option<RawStats>,
    offers: Option<Vec<RawOffer>>,
    #[serde(rename = "buyBoxPrice")]
    buy_box_price: Option<i64>,
    rating: Option<f64>,
    categories: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    products: Option<Vec<RawProduct>>,
}

/// Rate-limited client for the external price API. One instance per
/// process; the token bucket inside is shared by every caller.
pub struct KeepaClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    pub bucket: TokenBucket,
    deal_access: AtomicBool,
}

impl KeepaClient {
    pub fn new(api_key: &str, tokens_per_minute: u32, tokens_capacity: u32) -> KeepaResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(KeepaError::from)?;

        Ok(KeepaClient {
            http,
            api_key: api_key.to_string(),
            base_url: BASE_URL.to_string(),
            bucket: TokenBucket::new(tokens_per_minute, tokens_capacity),
            deal_access: AtomicBool::new(true),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    pub fn deal_endpoint_available(&self) -> bool {
        self.deal_access.load(Ordering::Relaxed)
    }

    /// Latched for the rest of the process; callers fall back to product
    /// queries once the access tier rejects the deal endpoint.
    pub fn disable_deal_endpoint(&self) {
        self.deal_access.store(false, Ordering::Relaxed);
    }

    /// GET with the shared retry policy: one retry after a 1 s backoff for
    /// 5xx and network failures (the second failure skips the item), a
    /// single 60 s pause for 429, no retry for anything else. Only the
    /// deal endpoint reads 404 as access denial.
    async fn get_with_retry(&self, url: &str, deny_on_404: bool) -> KeepaResult<Value> {
        let mut throttled_once = false;
        let mut attempt = 0u32;

        loop {
            let result = self.http.get(url).send().await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| KeepaError::InvalidResponse(e.to_string()));
                    }
                    if status.as_u16() == 404 {
                        if deny_on_404 {
                            return Err(KeepaError::DealAccessDenied);
                        }
                        return Err(KeepaError::InvalidResponse("not found".to_string()));
                    }
                    if status.as_u16() == 429 {
                        if throttled_once {
                            return Err(KeepaError::Throttled);
                        }
                        throttled_once = true;
                        tracing::warn!("Upstream throttled (429), pausing {:?}", THROTTLE_PAUSE);
                        tokio::time::sleep(THROTTLE_PAUSE).await;
                        continue;
                    }
                    if !status.is_server_error() {
                        return Err(KeepaError::InvalidResponse(format!(
                            "unexpected status {}",
                            status
                        )));
                    }
                    tracing::warn!(
                        "Upstream returned {} (attempt {}/{})",
                        status,
                        attempt + 1,
                        MAX_ATTEMPTS
                    );
                }
                Err(e) => {
                    let mapped = KeepaError::from(e);
                    if !matches!(mapped, KeepaError::UpstreamUnavailable(_)) {
                        return Err(mapped);
                    }
                    tracing::warn!(
                        "Upstream call failed (attempt {}/{}): {}",
                        attempt + 1,
                        MAX_ATTEMPTS,
                        mapped
                    );
                }
            }

            attempt += 1;
            if attempt >= MAX_ATTEMPTS {
                return Err(KeepaError::UpstreamUnavailable(format!(
                    "gave up after {} attempts",
                    MAX_ATTEMPTS
                )));
            }
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
        }
    }

    async fn sync_bucket_from(&self, response: &Value) {
        if let Some(tokens_left) = response.get("tokensLeft").and_then(|v| v.as_i64()) {
            self.bucket.sync(tokens_left.max(0) as u32).await;
        }
        if let Some(rate) = response.get("refillRate").and_then(|v| v.as_i64()) {
            self.bucket.set_rate(rate.max(0) as u32).await;
        }
    }

    /// Query one product with stats, history and offers (cost ≈ 15 tokens).
    pub async fn query_product(&self, asin: &str, domain_id: u32) -> KeepaResult<Product> {
        validate_asin(asin)?;
        let code = domain_code(domain_id)
            .ok_or_else(|| KeepaError::InvalidResponse(format!("unsupported domain {}", domain_id)))?;

        self.bucket.acquire(QUERY_COST, DEFAULT_MAX_WAIT).await?;

        let url = format!(
            "{}/product?key={}&domain={}&asin={}&stats=90&history=1&offers=20",
            self.base_url, self.api_key, domain_id, asin
        );
        let body = self.get_with_retry(&url, false).await?;
        self.sync_bucket_from(&body).await;

        let response: ProductResponse = serde_json::from_value(body)
            .map_err(|e| KeepaError::InvalidResponse(e.to_string()))?;

        let raw = response
            .products
            .and_then(|mut products| {
                if products.is_empty() {
                    None
                } else {
                    Some(products.remove(0))
                }
            })
            .ok_or_else(|| KeepaError::InvalidResponse(format!("no product for {}", asin)))?;

        let product = build_product(raw, asin, domain_id);
        tracing::info!(
            "{} ({}): price={:?}, list={:?}, rating={}",
            asin,
            code,
            product.current_price,
            product.list_price,
            product.rating
        );
        Ok(product)
    }

    /// Search the deal endpoint (cost ≈ 5 tokens). Access tiers without the
    /// deal feature answer 404; that latches the endpoint off.
    pub async fn search_deals(&self, filters: &DealFilters) -> KeepaResult<Vec<DealHit>> {
        if !self.deal_endpoint_available() {
            return Err(KeepaError::DealAccessDenied);
        }

        self.bucket.acquire(DEALS_COST, DEFAULT_MAX_WAIT).await?;

        let selection = json!({
            "page": filters.page,
            "domainId": filters.domain_id,
            "hasReviews": filters.min_reviews > 0,
            "isFilterEnabled": true,
            "isRangeEnabled": true,
            "deltaPercentRange": [filters.min_discount, filters.max_discount],
            "currentRange": [filters.min_price_cents, filters.max_price_cents],
            "includeCategories": filters.include_categories,
            "excludeCategories": filters.exclude_categories,
        });

        let url = format!(
            "{}/deal?key={}&selection={}",
            self.base_url, self.api_key, selection
        );

        let body = match self.get_with_retry(&url, true).await {
            Ok(body) => body,
            Err(KeepaError::DealAccessDenied) => {
                self.disable_deal_endpoint();
                return Err(KeepaError::DealAccessDenied);
            }
            Err(e) => return Err(e),
        };
        self.sync_bucket_from(&body).await;

        Ok(parse_deal_hits(&body, filters.domain_id))
    }

    /// Free status call; also refreshes the bucket from the server balance.
    pub async fn get_token_status(&self) -> KeepaResult<TokenStatus> {
        let url = format!("{}/token?key={}", self.base_url, self.api_key);
        let body = self.get_with_retry(&url, false).await?;
        self.sync_bucket_from(&body).await;

        Ok(TokenStatus {
            available: body.get("tokensLeft").and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u32,
            refill_in_ms: body.get("refillIn").and_then(|v| v.as_u64()).unwrap_or(60_000),
            rate_per_minute: body.get("refillRate").and_then(|v| v.as_i64()).unwrap_or(20).max(0)
                as u32,
        })
    }
}

/// Resolve prices for a raw product: packed series first, then the flat
/// stats array, then offers, then the root buy-box field.
fn build_product(raw: RawProduct, asin: &str, domain_id: u32) -> Product {
    let csv = raw.csv.unwrap_or_default();

    let mut current_price = series::extract_current_price(&csv);
    let mut list_price = series::extract_list_price(&csv);
    let mut buy_box_price = [series::BUY_BOX, series::BUY_BOX_USED]
        .iter()
        .find_map(|index| {
            csv.get(*index)
                .and_then(|s| s.as_ref())
                .and_then(|s| series::last_valid_value(s))
                .map(|cents| cents as f64 / 100.0)
        });

    if let Some(stats) = &raw.stats {
        let current: Vec<i64> = stats
            .current
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|v| v.unwrap_or(-1))
            .collect();

        if current_price.is_none() {
            current_price = series::price_from_current_array(&current);
        }
        if buy_box_price.is_none() {
            buy_box_price = [series::BUY_BOX, series::BUY_BOX_USED]
                .iter()
                .filter_map(|index| current.get(*index))
                .copied()
                .find(|v| *v > 0)
                .map(|cents| cents as f64 / 100.0)
                .or_else(|| positive_cents(stats.buy_box_price));
        }
        if list_price.is_none() {
            list_price = current
                .get(series::LIST_PRICE)
                .copied()
                .filter(|v| *v > 0)
                .map(|cents| cents as f64 / 100.0)
                .or_else(|| positive_cents(stats.list_price));
        }
    }

    if current_price.is_none() {
        current_price = raw.offers.as_deref().unwrap_or(&[]).iter().find_map(|offer| {
            offer
                .offer_csv
                .as_deref()
                .and_then(series::last_valid_value)
                .map(|cents| cents as f64 / 100.0)
        });
    }

    if current_price.is_none() {
        current_price = positive_cents(raw.buy_box_price);
    }

    let rating = raw
        .rating
        .filter(|r| *r > 0.0)
        .map(series::normalize_rating)
        .or_else(|| series::extract_rating(&csv))
        .unwrap_or(0.0);

    Product {
        asin: asin.to_string(),
        title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
        current_price,
        list_price,
        buy_box_price,
        rating,
        review_count: series::extract_review_count(&csv).unwrap_or(0),
        sales_rank: series::extract_sales_rank(&csv),
        category: raw
            .categories
            .as_deref()
            .and_then(|c| c.last())
            .map(|c| c.to_string()),
        domain_id,
        url: format!("https://{}/dp/{}", domain_host(domain_id), asin),
    }
}

/// Parse deal rows out of the endpoint response. The row list lives under
/// `dr` (sometimes nested under `deals`).
fn parse_deal_hits(body: &Value, domain_id: u32) -> Vec<DealHit> {
    let rows = body
        .get("dr")
        .or_else(|| body.get("deals").and_then(|d| d.get("dr")))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let host = domain_host(domain_id);
    let mut hits = Vec::new();

    for row in rows {
        let current: Vec<i64> = row
            .get("current")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().map(|v| v.as_i64().unwrap_or(-1)).collect())
            .unwrap_or_default();

        // Best available price: Amazon > New FBA > marketplace new.
        let price = [series::AMAZON, series::NEW_FBA, series::MARKETPLACE_NEW]
            .iter()
            .filter_map(|index| current.get(*index))
            .copied()
            .find(|v| *v > 0)
            .map(|cents| cents as f64 / 100.0)
            .unwrap_or(0.0);
        if price <= 0.0 {
            continue;
        }

        let mut list_price = current
            .get(series::LIST_PRICE)
            .copied()
            .filter(|v| *v > 0)
            .map(|cents| cents as f64 / 100.0)
            .unwrap_or(0.0);
        if list_price <= 0.0 {
            list_price = price;
        }

        let mut discount = first_delta_percent(row.get("deltaPercent"));
        if discount == 0.0 && list_price > price {
            discount = ((1.0 - price / list_price) * 1000.0).round() / 10.0;
        }

        let rating = current
            .get(series::RATING)
            .copied()
            .filter(|v| *v > 0)
            .map(|v| v as f64 / 10.0)
            .unwrap_or(0.0);

        let reviews = current
            .get(series::REVIEW_COUNT)
            .copied()
            .filter(|v| *v > 0)
            .unwrap_or(0);

        let asin = row.get("asin").and_then(|v| v.as_str()).unwrap_or("").to_string();

        hits.push(DealHit {
            url: format!("https://{}/dp/{}", host, asin),
            asin,
            title: row
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            current_price: price,
            list_price,
            discount_percent: discount,
            rating,
            reviews,
        });
    }

    hits
}

/// `deltaPercent` arrives either as a flat array or as per-interval rows;
/// the first non-zero entry wins.
fn first_delta_percent(delta: Option<&Value>) -> f64 {
    let Some(rows) = delta.and_then(|v| v.as_array()) else {
        return 0.0;
    };
    for row in rows {
        match row {
            Value::Array(inner) => {
                if let Some(first) = inner.first().and_then(|v| v.as_f64()) {
                    if first != 0.0 {
                        return first.abs();
                    }
                }
            }
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    if v > 0.0 {
                        return v.abs();
                    }
                }
            }
            _ => {}
        }
    }
    0.0
}

fn positive_cents(value: Option<i64>) -> Option<f64> {
    value.filter(|v| *v > 0).map(|cents| cents as f64 / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: Value) -> RawProduct {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn asin_validation() {
        assert!(validate_asin("B07W6JN8V8").is_ok());
        assert!(matches!(
            validate_asin("SHORT"),
            Err(KeepaError::InvalidAsin(_))
        ));
        assert!(matches!(
            validate_asin("B07W6JN8V!"),
            Err(KeepaError::InvalidAsin(_))
        ));
    }

    #[test]
    fn domain_mapping() {
        assert_eq!(domain_code(3), Some("de"));
        assert_eq!(domain_code(2), Some("uk"));
        assert_eq!(domain_code(5), None);
        assert_eq!(domain_host(4), "amazon.fr");
        assert_eq!(domain_host(99), "amazon.de");
    }

    #[test]
    fn product_prices_come_from_the_packed_series() {
        let product = build_product(
            raw(json!({
                "title": "Logitech K380",
                "csv": [[100, 4499], null, null, [100, 1200], [100, 5999]],
                "rating": 45.0
            })),
            "B07W6JN8V8",
            3,
        );
        assert_eq!(product.current_price, Some(44.99));
        assert_eq!(product.list_price, Some(59.99));
        assert_eq!(product.rating, 4.5);
        assert_eq!(product.sales_rank, Some(1200));
        assert_eq!(product.url, "https://amazon.de/dp/B07W6JN8V8");
    }

    #[test]
    fn stats_array_backs_up_an_empty_series() {
        let mut current = vec![-1i64; 19];
        current[series::NEW_FBA] = 2350;
        let product = build_product(
            raw(json!({
                "title": "Cherry KC 1000",
                "csv": [[100, -1]],
                "stats": {"current": current}
            })),
            "B0058UR5GS",
            3,
        );
        assert_eq!(product.current_price, Some(23.50));
    }

    #[test]
    fn offers_and_root_buy_box_are_the_last_resorts() {
        let from_offers = build_product(
            raw(json!({
                "offers": [
                    {"offerCSV": [100, -1]},
                    {"offerCSV": [100, 1899]}
                ]
            })),
            "B005EOWBHC",
            3,
        );
        assert_eq!(from_offers.current_price, Some(18.99));

        let from_root = build_product(
            raw(json!({"buyBoxPrice": 3499})),
            "B005EOWBHC",
            3,
        );
        assert_eq!(from_root.current_price, Some(34.99));
    }

    #[test]
    fn all_sentinel_product_has_no_price() {
        let product = build_product(
            raw(json!({
                "title": "Ghost listing",
                "csv": [[100, -1], null, null, null, [100, -2]],
                "stats": {"current": [-1, -1, -1]}
            })),
            "B000000000",
            3,
        );
        assert_eq!(product.current_price, None);
        assert_eq!(product.list_price, None);
    }

    #[test]
    fn deal_rows_parse_prices_discount_and_rating() {
        let mut current = vec![-1i64; 19];
        current[series::AMAZON] = 4499;
        current[series::LIST_PRICE] = 8999;
        current[series::RATING] = 43;
        current[series::REVIEW_COUNT] = 512;

        let body = json!({"dr": [{
            "asin": "B07W6JN8V8",
            "title": "Logitech K380 QWERTZ",
            "current": current,
            "deltaPercent": [[50]]
        }]});

        let hits = parse_deal_hits(&body, 3);
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!(hit.current_price, 44.99);
        assert_eq!(hit.list_price, 89.99);
        assert_eq!(hit.discount_percent, 50.0);
        assert_eq!(hit.rating, 4.3);
        assert_eq!(hit.reviews, 512);
        assert_eq!(hit.url, "https://amazon.de/dp/B07W6JN8V8");
    }

    #[test]
    fn deal_discount_falls_back_to_price_derivation() {
        let mut current = vec![-1i64; 5];
        current[series::AMAZON] = 3000;
        current[series::LIST_PRICE] = 4000;

        let body = json!({"dr": [{"asin": "B00F34GN18", "current": current}]});
        let hits = parse_deal_hits(&body, 3);
        assert_eq!(hits[0].discount_percent, 25.0);
    }

    #[test]
    fn priceless_deal_rows_are_dropped() {
        let body = json!({"dr": [{"asin": "B00F34GN18", "current": [-1, -1]}]});
        assert!(parse_deal_hits(&body, 3).is_empty());
    }

    #[tokio::test]
    async fn denied_deal_endpoint_is_latched_off() {
        let client = KeepaClient::new("test-key", 20, 200)
            .unwrap()
            .with_base_url("http://127.0.0.1:1"); // nothing listens here
        client.disable_deal_endpoint();

        let err = client.search_deals(&DealFilters::default()).await.unwrap_err();
        assert!(matches!(err, KeepaError::DealAccessDenied));
        // No tokens were consumed by the short-circuit.
        assert_eq!(client.bucket.snapshot().await.total_consumed, 0);
    }
}
