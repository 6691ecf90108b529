use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing;
use uuid::Uuid;

use keeper_core::models::{PriceAlert, User, WatchedProduct};
use keeper_core::store::{self, round_to_cents};
use keeper_core::KeeperContext;

use crate::channels::{EmailDelivery, TelegramDelivery, WebhookDelivery};
use crate::format::{format_digest, format_price_alert};

const DUPLICATE_WINDOW_SECS: i64 = 3600;
const MAX_ALERTS_PER_HOUR: i64 = 10;

fn duplicate_window() -> ChronoDuration {
    ChronoDuration::seconds(DUPLICATE_WINDOW_SECS)
}
const RETRY_DELAYS_SECS: [u64; 3] = [0, 30, 120];
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Preferred channel first, then the fixed fallback order, no repeats.
fn channel_order(preferred: Option<&str>) -> Vec<&'static str> {
    let mut order: Vec<&'static str> = Vec::new();
    if let Some(preferred) = preferred {
        for known in ["email", "telegram", "webhook"] {
            if preferred == known {
                order.push(known);
            }
        }
    }
    for channel in ["email", "telegram", "webhook"] {
        if !order.contains(&channel) {
            order.push(channel);
        }
    }
    order
}

/// Next full hour after `t`; digests for capped users go out there.
fn hour_boundary_after(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = t
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    truncated + ChronoDuration::hours(1)
}

fn prune_dedup(cache: &mut HashMap<(Uuid, i64), DateTime<Utc>>, now: DateTime<Utc>) {
    cache.retain(|_, sent_at| now - *sent_at < duplicate_window());
}

struct Channels {
    email: EmailDelivery,
    telegram: TelegramDelivery,
    webhook: WebhookDelivery,
}

/// Drains PENDING alerts: duplicate suppression, per-user rate cap with an
/// hourly digest, channel fallback with a fixed retry schedule, terminal
/// SENT/FAILED transitions.
pub struct AlertDispatcher {
    ctx: KeeperContext,
    channels: Channels,
    shutdown: watch::Receiver<bool>,
    // In-memory fast path for the duplicate window; the persisted SENT rows
    // remain the authoritative check.
    dedup_cache: HashMap<(Uuid, i64), DateTime<Utc>>,
    deferred: HashMap<Uuid, Vec<(PriceAlert, WatchedProduct, User)>>,
    deferred_since: HashMap<Uuid, DateTime<Utc>>,
    deferred_ids: HashSet<Uuid>,
}

pub async fn run(ctx: KeeperContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut dispatcher = AlertDispatcher::new(ctx, shutdown.clone())?;
    tracing::info!("Alert dispatcher started");

    let mut shutdown = shutdown;
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = dispatcher.process_pending().await {
            tracing::error!("Alert dispatch pass failed: {}", e);
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::info!("Alert dispatcher stopped");
    Ok(())
}

impl AlertDispatcher {
    pub fn new(ctx: KeeperContext, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let channels = Channels {
            email: EmailDelivery::new(&ctx.config.delivery)?,
            telegram: TelegramDelivery::new(&ctx.config.delivery)?,
            webhook: WebhookDelivery::new()?,
        };
        Ok(AlertDispatcher {
            ctx,
            channels,
            shutdown,
            dedup_cache: HashMap::new(),
            deferred: HashMap::new(),
            deferred_since: HashMap::new(),
            deferred_ids: HashSet::new(),
        })
    }

    async fn process_pending(&mut self) -> Result<()> {
        let now = Utc::now();
        prune_dedup(&mut self.dedup_cache, now);
        self.flush_due_digests(now).await;

        let pending = store::get_pending_alerts_with_context(&self.ctx.db_pool).await?;
        for (alert, watch, user) in pending {
            if *self.shutdown.borrow() {
                break;
            }
            if self.deferred_ids.contains(&alert.id) {
                continue;
            }
            if let Err(e) = self.dispatch_one(alert, watch, user).await {
                tracing::error!("Alert dispatch failed: {}", e);
            }
        }
        Ok(())
    }

    async fn dispatch_one(
        &mut self,
        alert: PriceAlert,
        watch: WatchedProduct,
        user: User,
    ) -> Result<()> {
        let dedup_key = (watch.id, round_to_cents(alert.triggered_price));

        let cached_duplicate = self
            .dedup_cache
            .get(&dedup_key)
            .map(|sent| Utc::now() - *sent < duplicate_window())
            .unwrap_or(false);
        let duplicate = cached_duplicate
            || store::has_sent_duplicate(
                &self.ctx.db_pool,
                watch.id,
                alert.triggered_price,
                duplicate_window(),
            )
            .await?;

        if duplicate {
            tracing::info!("duplicate blocked: {} at {:.2}", watch.asin, alert.triggered_price);
            store::mark_alert_failed(&self.ctx.db_pool, alert.id).await?;
            return Ok(());
        }

        let sent_this_hour =
            store::count_sent_alerts_for_user(&self.ctx.db_pool, user.id, ChronoDuration::hours(1))
                .await?;
        if sent_this_hour >= MAX_ALERTS_PER_HOUR {
            tracing::info!(
                "Rate cap reached for {}; queuing alert {} for the digest",
                user.email,
                alert.id
            );
            self.deferred_ids.insert(alert.id);
            self.deferred_since.entry(user.id).or_insert_with(Utc::now);
            self.deferred.entry(user.id).or_default().push((alert, watch, user));
            return Ok(());
        }

        match self.deliver_with_fallback(&alert, &watch, &user).await {
            Some(channel) => {
                store::mark_alert_sent(&self.ctx.db_pool, alert.id, channel).await?;
                self.dedup_cache.insert(dedup_key, Utc::now());
                tracing::info!("Alert {} delivered via {}", alert.id, channel);
            }
            None => {
                store::mark_alert_failed(&self.ctx.db_pool, alert.id).await?;
                tracing::warn!("Alert {} failed on every channel", alert.id);
            }
        }
        Ok(())
    }

    /// Walk the channel order; three timed attempts per channel, then fall
    /// through to the next. Returns the successful channel name.
    async fn deliver_with_fallback(
        &self,
        alert: &PriceAlert,
        watch: &WatchedProduct,
        user: &User,
    ) -> Option<&'static str> {
        for channel in channel_order(user.preferred_channel.as_deref()) {
            if !self.channel_usable(channel, user) {
                continue;
            }

            for (attempt, delay) in RETRY_DELAYS_SECS.iter().enumerate() {
                if *self.shutdown.borrow() {
                    return None;
                }
                if *delay > 0 {
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                }
                match self.send_via(channel, alert, watch, user).await {
                    Ok(()) => return Some(channel),
                    Err(e) => tracing::warn!(
                        "Channel {} attempt {}/{} failed for alert {}: {}",
                        channel,
                        attempt + 1,
                        RETRY_DELAYS_SECS.len(),
                        alert.id,
                        e
                    ),
                }
            }
        }
        None
    }

    fn channel_usable(&self, channel: &str, user: &User) -> bool {
        match channel {
            "email" => self.channels.email.is_configured() && !user.email.is_empty(),
            "telegram" => {
                self.channels.telegram.is_configured() && user.telegram_chat_id.is_some()
            }
            "webhook" => user.webhook_url.is_some(),
            _ => false,
        }
    }

    async fn send_via(
        &self,
        channel: &str,
        alert: &PriceAlert,
        watch: &WatchedProduct,
        user: &User,
    ) -> Result<()> {
        let product_name = watch.product_name.as_deref().unwrap_or(&watch.asin);
        let url = format!("https://amazon.de/dp/{}", watch.asin);
        let formatted =
            format_price_alert(channel, product_name, alert.triggered_price, alert.target_price, &url);

        match channel {
            "email" => {
                self.channels
                    .email
                    .send(&user.email, &formatted.subject, &formatted.body, None)
                    .await
            }
            "telegram" => {
                let chat_id = user
                    .telegram_chat_id
                    .as_deref()
                    .ok_or_else(|| anyhow!("no chat id"))?;
                self.channels.telegram.send(chat_id, &formatted.body).await
            }
            "webhook" => {
                let webhook_url = user
                    .webhook_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("no webhook url"))?;
                let payload = json!({
                    "alert_id": alert.id,
                    "asin": watch.asin,
                    "product_name": product_name,
                    "current_price": alert.triggered_price,
                    "target_price": alert.target_price,
                    "url": url,
                    "text": formatted.body,
                });
                self.channels.webhook.send(webhook_url, &payload).await
            }
            other => Err(anyhow!("unknown channel {}", other)),
        }
    }

    /// Deliver one digest per capped user once the next hour boundary has
    /// passed, then resolve the queued alerts.
    async fn flush_due_digests(&mut self, now: DateTime<Utc>) {
        let due: Vec<Uuid> = self
            .deferred_since
            .iter()
            .filter(|(_, since)| now >= hour_boundary_after(**since))
            .map(|(user_id, _)| *user_id)
            .collect();

        for user_id in due {
            let Some(batch) = self.deferred.remove(&user_id) else {
                self.deferred_since.remove(&user_id);
                continue;
            };
            self.deferred_since.remove(&user_id);

            let Some((_, _, user)) = batch.first() else {
                continue;
            };
            let user = user.clone();
            let pairs: Vec<(PriceAlert, WatchedProduct)> = batch
                .iter()
                .map(|(alert, watch, _)| (alert.clone(), watch.clone()))
                .collect();
            let digest = format_digest(&pairs);

            let mut delivered: Option<&'static str> = None;
            for channel in channel_order(user.preferred_channel.as_deref()) {
                if !self.channel_usable(channel, &user) {
                    continue;
                }
                let result = match channel {
                    "email" => {
                        self.channels
                            .email
                            .send(&user.email, &digest.subject, &digest.body, None)
                            .await
                    }
                    "telegram" => match user.telegram_chat_id.as_deref() {
                        Some(chat_id) => self.channels.telegram.send(chat_id, &digest.body).await,
                        None => Err(anyhow!("no chat id")),
                    },
                    "webhook" => match user.webhook_url.as_deref() {
                        Some(url) => {
                            self.channels
                                .webhook
                                .send(url, &json!({"subject": digest.subject, "body": digest.body}))
                                .await
                        }
                        None => Err(anyhow!("no webhook url")),
                    },
                    _ => Err(anyhow!("unknown channel")),
                };
                if result.is_ok() {
                    delivered = Some(channel);
                    break;
                }
            }

            for (alert, watch, _) in &batch {
                self.deferred_ids.remove(&alert.id);
                let outcome = match delivered {
                    Some(channel) => {
                        self.dedup_cache
                            .insert((watch.id, round_to_cents(alert.triggered_price)), now);
                        store::mark_alert_sent(&self.ctx.db_pool, alert.id, channel).await
                    }
                    None => store::mark_alert_failed(&self.ctx.db_pool, alert.id).await,
                };
                if let Err(e) = outcome {
                    tracing::error!("Failed to resolve digested alert {}: {}", alert.id, e);
                }
            }

            match delivered {
                Some(channel) => tracing::info!(
                    "Digest with {} alerts delivered to {} via {}",
                    batch.len(),
                    user.email,
                    channel
                ),
                None => tracing::warn!("Digest for {} failed on every channel", user.email),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn preferred_channel_leads_without_duplicates() {
        assert_eq!(channel_order(None), vec!["email", "telegram", "webhook"]);
        assert_eq!(
            channel_order(Some("telegram")),
            vec!["telegram", "email", "webhook"]
        );
        assert_eq!(
            channel_order(Some("email")),
            vec!["email", "telegram", "webhook"]
        );
        // Unknown preferences fall back to the default order.
        assert_eq!(
            channel_order(Some("carrier-pigeon")),
            vec!["email", "telegram", "webhook"]
        );
    }

    #[test]
    fn digest_fires_at_the_next_full_hour() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 14, 35, 10).unwrap();
        assert_eq!(
            hour_boundary_after(t),
            Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap()
        );
        let on_the_hour = Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap();
        assert_eq!(
            hour_boundary_after(on_the_hour),
            Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn dedup_cache_expires_entries_past_the_window() {
        let mut cache = HashMap::new();
        let now = Utc::now();
        let watch = Uuid::new_v4();
        cache.insert((watch, 4499), now - ChronoDuration::seconds(3599));
        cache.insert((watch, 4500), now - ChronoDuration::seconds(3601));
        prune_dedup(&mut cache, now);
        assert!(cache.contains_key(&(watch, 4499)));
        assert!(!cache.contains_key(&(watch, 4500)));
    }
}
