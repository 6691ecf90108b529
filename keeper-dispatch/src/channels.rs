use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing;

use keeper_core::config::DeliveryConfig;

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct EmailRequest {
    from: String,
    to: Vec<String>,
    subject: String,
    html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmailResponse {
    id: String,
}

pub struct EmailDelivery {
    client: Option<Arc<reqwest::Client>>,
    api_key: Option<String>,
    from_email: Option<String>,
}

impl EmailDelivery {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let (client, api_key, from_email) = if let (Some(api_key), Some(from_email)) =
            (&config.resend_api_key, &config.resend_from_email)
        {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
            tracing::info!("Email delivery channel initialized");
            (Some(Arc::new(client)), Some(api_key.clone()), Some(from_email.clone()))
        } else {
            tracing::warn!("Email delivery disabled (missing configuration)");
            (None, None, None)
        };

        Ok(Self { client, api_key, from_email })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub async fn send(&self, to: &str, subject: &str, html: &str, text: Option<&str>) -> Result<()> {
        let (client, api_key, from_email) = match (&self.client, &self.api_key, &self.from_email) {
            (Some(c), Some(k), Some(f)) => (c, k, f),
            _ => return Err(anyhow!("email channel not configured")),
        };

        let request = EmailRequest {
            from: from_email.clone(),
            to: vec![to.to_string()],
            subject: subject.to_string(),
            html: html.to_string(),
            text: text.map(|t| t.to_string()),
        };

        let response = client
            .post(RESEND_API_URL)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("email request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("email API returned {}: {}", status, body));
        }

        let parsed: EmailResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("email API response unreadable: {}", e))?;
        tracing::debug!("Email sent to {} (id: {})", to, parsed.id);
        Ok(())
    }
}

pub struct TelegramDelivery {
    client: Option<Arc<reqwest::Client>>,
    bot_token: Option<String>,
}

impl TelegramDelivery {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let (client, bot_token) = if let Some(token) = &config.telegram_bot_token {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
            tracing::info!("Messaging delivery channel initialized");
            (Some(Arc::new(client)), Some(token.clone()))
        } else {
            tracing::warn!("Messaging delivery disabled (missing bot token)");
            (None, None)
        };

        Ok(Self { client, bot_token })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        let (client, token) = match (&self.client, &self.bot_token) {
            (Some(c), Some(t)) => (c, t),
            _ => return Err(anyhow!("messaging channel not configured")),
        };

        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_URL, token);
        let response = client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await
            .map_err(|e| anyhow!("messaging request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("messaging API returned {}: {}", status, body));
        }
        Ok(())
    }
}

/// Plain JSON POST to a user-supplied webhook.
pub struct WebhookDelivery {
    client: Arc<reqwest::Client>,
}

impl WebhookDelivery {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client: Arc::new(client) })
    }

    pub async fn send(&self, webhook_url: &str, payload: &Value) -> Result<()> {
        let response = self
            .client
            .post(webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("webhook request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("webhook returned {}", status));
        }
        Ok(())
    }
}
