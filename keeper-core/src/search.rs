use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing;

use crate::config::SearchConfig;

fn price_index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "asin": {"type": "keyword"},
                "product_title": {
                    "type": "text",
                    "analyzer": "standard",
                    "fields": {"keyword": {"type": "keyword"}}
                },
                "current_price": {"type": "float"},
                "target_price": {"type": "float"},
                "previous_price": {"type": "float"},
                "price_change": {"type": "float"},
                "domain": {"type": "keyword"},
                "currency": {"type": "keyword"},
                "timestamp": {"type": "date"},
                "event_type": {"type": "keyword"}
            }
        },
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0,
            "index": {"max_result_window": 50000}
        }
    })
}

fn deal_index_mapping() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0,
            "analysis": {
                "analyzer": {
                    "deal_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "german_stemmer", "asciifolding"]
                    }
                },
                "filter": {
                    "german_stemmer": {"type": "stemmer", "language": "german"}
                }
            }
        },
        "mappings": {
            "properties": {
                "asin": {"type": "keyword"},
                "title": {
                    "type": "text",
                    "analyzer": "deal_analyzer",
                    "fields": {
                        "keyword": {"type": "keyword"},
                        "suggest": {"type": "completion"}
                    }
                },
                "description": {"type": "text", "analyzer": "deal_analyzer"},
                "current_price": {"type": "float"},
                "original_price": {"type": "float"},
                "discount_percent": {"type": "float"},
                "rating": {"type": "float"},
                "review_count": {"type": "integer"},
                "sales_rank": {"type": "integer"},
                "domain": {"type": "keyword"},
                "category": {"type": "keyword"},
                "prime_eligible": {"type": "boolean"},
                "url": {"type": "keyword"},
                "deal_score": {"type": "float"},
                "timestamp": {"type": "date"},
                "event_type": {"type": "keyword"}
            }
        }
    })
}

/// Search-index writer. Best effort by design: the relational store is the
/// source of truth, so every public method degrades to a logged no-op when
/// the index endpoint is unreachable.
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
    pub index_prices: String,
    pub index_deals: String,
    ready: AtomicBool,
}

impl SearchClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create search HTTP client: {}", e))?;

        Ok(SearchClient {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            index_prices: config.index_prices.clone(),
            index_deals: config.index_deals.clone(),
            ready: AtomicBool::new(false),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Create-if-absent on both indexes with their declared mappings.
    pub async fn connect(&self) -> Result<()> {
        for (index, mapping) in [
            (&self.index_prices, price_index_mapping()),
            (&self.index_deals, deal_index_mapping()),
        ] {
            self.ensure_index(index, &mapping).await?;
        }
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Connected to search index at {}", self.base_url);
        Ok(())
    }

    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<()> {
        let url = format!("{}/{}", self.base_url, index);

        let head = self.http.head(&url).send().await?;
        if head.status().is_success() {
            return Ok(());
        }

        let response = self.http.put(&url).json(mapping).send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::info!("Created search index: {}", index);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        // A concurrent creator can win the race; that is fine.
        if body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(anyhow!("Failed to create index {}: {} {}", index, status, body))
    }

    async fn index_with_retry(&self, index: &str, document: &Value) -> bool {
        if !self.is_ready() {
            return false;
        }

        let url = format!("{}/{}/_doc", self.base_url, index);

        // Three retries on top of the first attempt, backing off 1s/2s/4s.
        for attempt in 0..4u32 {
            match self.http.post(&url).json(document).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => {
                    tracing::warn!(
                        "Index write to {} returned {} (attempt {}/4)",
                        index,
                        response.status(),
                        attempt + 1
                    );
                }
                Err(e) => {
                    tracing::warn!("Index write to {} failed (attempt {}/4): {}", index, attempt + 1, e);
                }
            }

            if attempt < 3 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }

        tracing::error!("Index write to {} gave up after 3 retries", index);
        false
    }

    pub async fn index_price_update(&self, document: &Value) -> bool {
        self.index_with_retry(&self.index_prices, document).await
    }

    pub async fn index_deal_update(&self, document: &Value) -> bool {
        self.index_with_retry(&self.index_deals, document).await
    }

    /// Retention pass: drop documents older than `days` from both indexes.
    pub async fn delete_old_documents(&self, days: i64) -> Result<u64> {
        if !self.is_ready() {
            return Ok(0);
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
        let url = format!(
            "{}/{},{}/_delete_by_query",
            self.base_url, self.index_prices, self.index_deals
        );
        let query = json!({
            "query": {"range": {"timestamp": {"lt": cutoff.to_rfc3339()}}}
        });

        let response = self.http.post(&url).json(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Retention delete returned {}", status));
        }

        let body: Value = response.json().await?;
        let deleted = body["deleted"].as_u64().unwrap_or(0);
        if deleted > 0 {
            tracing::info!("Deleted {} documents past retention", deleted);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_mapping_declares_exact_asin_and_result_window() {
        let mapping = price_index_mapping();
        assert_eq!(mapping["mappings"]["properties"]["asin"]["type"], "keyword");
        assert_eq!(mapping["settings"]["index"]["max_result_window"], 50000);
    }

    #[test]
    fn deal_mapping_wires_the_custom_analyzer() {
        let mapping = deal_index_mapping();
        let analyzer = &mapping["settings"]["analysis"]["analyzer"]["deal_analyzer"];
        assert_eq!(analyzer["tokenizer"], "standard");
        assert_eq!(
            analyzer["filter"],
            json!(["lowercase", "german_stemmer", "asciifolding"])
        );
        assert_eq!(
            mapping["mappings"]["properties"]["title"]["fields"]["suggest"]["type"],
            "completion"
        );
        assert_eq!(
            mapping["mappings"]["properties"]["description"]["analyzer"],
            "deal_analyzer"
        );
    }

    #[test]
    fn client_starts_not_ready() {
        let client = SearchClient::new(&crate::config::SearchConfig {
            url: "http://localhost:9200/".to_string(),
            index_prices: "keeper-prices".to_string(),
            index_deals: "keeper-deals".to_string(),
        })
        .unwrap();
        assert!(!client.is_ready());
        assert_eq!(client.base_url, "http://localhost:9200");
    }
}
