//! Webhook Dispatcher (spec §4.6): signed, at-least-once, per-endpoint
//! serialized delivery with exponential backoff.

pub mod signature;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{NewWebhookDelivery, Webhook, WebhookDelivery};
use crate::db::{audit, webhooks};
use crate::domain::EventName;
use crate::errors::Result;
use crate::queue::{self, QueueBus};

/// The lease window granted to a single delivery attempt; generous relative
/// to the 15 s HTTP deadline (spec §5) so a slow attempt is never double-sent.
const DELIVERY_LEASE_SECS: i64 = 60;

/// Exponential backoff upper bound — avoids an ever-growing `nextRetryAt`
/// for endpoints that stay down for days.
const MAX_RETRY_DELAY_SECS: i64 = 3600;

/// Job body enqueued on `webhook.send` (spec §4.7: handlers are idempotent on
/// business key — here, `(merchant_id, event, data)` is re-fanned-out to
/// subscribers deterministically, so redelivery just re-creates the same
/// per-endpoint delivery rows).
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookSendJob {
    pub merchant_id: Uuid,
    pub event: String,
    pub data: Json,
}

/// Enqueues `webhook.send` jobs. Used by every component that observes a
/// state change worth notifying a merchant about.
pub struct WebhookPublisher {
    queue: Arc<QueueBus>,
}

impl WebhookPublisher {
    pub fn new(queue: Arc<QueueBus>) -> Self {
        Self { queue }
    }

    pub async fn enqueue(&self, merchant_id: Uuid, event: EventName, data: Json) -> Result<()> {
        let job = WebhookSendJob { merchant_id, event: event.to_string(), data };
        self.queue.publish(queue::WEBHOOK_SEND, &job).await
    }
}

/// Consumes `webhook.send` jobs, fanning each out into one `WebhookDelivery`
/// row per ACTIVE subscribed endpoint, and separately runs the periodic
/// retry/backoff sweep that actually performs HTTP delivery. Retry timing is
/// driven by the sweep rather than broker-level delayed redelivery, since
/// plain RabbitMQ has no native delay primitive; timing precision here is
/// bounded by the sweep interval, not by message TTL.
pub struct WebhookDispatcher {
    pool: PgPool,
    http: Client,
    default_secret: String,
}

impl WebhookDispatcher {
    pub fn new(pool: PgPool, default_secret: String) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("webhook HTTP client must build");
        Self { pool, http, default_secret }
    }

    pub async fn handle_send_job(&self, job: WebhookSendJob) -> Result<()> {
        let merchant_id = job.merchant_id;
        let subscribers = webhooks::list_subscribed(&self.pool, merchant_id, &job.event).await?;
        if subscribers.is_empty() {
            return Ok(());
        }

        let payload = serde_json::json!({
            "event": job.event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": job.data,
        });

        for webhook in subscribers {
            webhooks::enqueue_delivery(
                &self.pool,
                &NewWebhookDelivery { webhook_id: webhook.id, event: job.event.clone(), payload: payload.clone() },
            )
            .await?;
        }
        Ok(())
    }

    /// One sweep tick: for every webhook with a due, undelivered delivery,
    /// claim the endpoint's lease and attempt exactly one delivery.
    pub async fn sweep_due_deliveries(&self, webhook: &Webhook) -> Result<()> {
        if webhook.status != "ACTIVE" {
            return Ok(());
        }
        if !webhooks::try_claim_lease(&self.pool, webhook.id, DELIVERY_LEASE_SECS).await? {
            return Ok(()); // another attempt is already in flight for this endpoint
        }

        let result = self.attempt_one(webhook).await;
        webhooks::release_lease(&self.pool, webhook.id).await?;
        result
    }

    async fn attempt_one(&self, webhook: &Webhook) -> Result<()> {
        let now = Utc::now();
        let due = webhooks::list_due_for_webhook(&self.pool, webhook.id, now, 1).await?;
        let Some(delivery) = due.into_iter().next() else { return Ok(()) };

        let secret = webhook.secret.clone().unwrap_or_else(|| self.default_secret.clone());
        let body = serde_json::to_string(&delivery.payload)
            .unwrap_or_else(|_| delivery.payload.to_string());
        let timestamp = now.timestamp();
        let sig = signature::sign(&secret, timestamp, &body)?;
        let nonce = Uuid::new_v4().to_string();

        let send_result = self
            .http
            .post(&webhook.url)
            .header("X-Signature", sig)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Nonce", nonce)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await;

        match send_result {
            Ok(resp) if resp.status().is_success() => {
                webhooks::mark_delivered(&self.pool, delivery.id).await?;
                webhooks::record_success(&self.pool, webhook.id, now).await?;
                info!(webhook_id = %webhook.id, event = %delivery.event, "webhook delivered");
                Ok(())
            }
            Ok(resp) => {
                self.record_failure(webhook, &delivery, now, format!("http status {}", resp.status()))
                    .await
            }
            Err(e) => self.record_failure(webhook, &delivery, now, e.to_string()).await,
        }
    }

    async fn record_failure(
        &self,
        webhook: &Webhook,
        delivery: &WebhookDelivery,
        now: chrono::DateTime<Utc>,
        reason: String,
    ) -> Result<()> {
        let attempts = delivery.attempts + 1;
        let next_delivery_retry = backoff_delay_secs(webhook.base_retry_interval_secs, attempts as u32);
        webhooks::record_delivery_attempt(
            &self.pool,
            delivery.id,
            now + chrono::Duration::seconds(next_delivery_retry),
        )
        .await?;

        let endpoint_failures = webhook.failed_attempts + 1;
        let endpoint_next_retry = if endpoint_failures >= webhook.max_retries {
            warn!(webhook_id = %webhook.id, "webhook endpoint exceeded max retries, marking FAILED");
            audit::record(
                &self.pool,
                "WEBHOOK_FAILED",
                "Webhook",
                webhook.id,
                Some(serde_json::json!({ "status": "ACTIVE" })),
                serde_json::json!({ "status": "FAILED", "reason": reason.clone() }),
                None,
            )
            .await;
            None
        } else {
            Some(now + chrono::Duration::seconds(next_delivery_retry))
        };
        webhooks::record_failure(&self.pool, webhook.id, now, endpoint_next_retry, &reason).await?;
        Ok(())
    }
}

/// `nextRetryAt = lastAttempt + base * 2^(attempts - 1)`, capped (spec §4.6,
/// §8 scenario 6: base=15s gives 15s, 30s, 60s... i.e. 15*2^0, 15*2^1, 15*2^2).
fn backoff_delay_secs(base_secs: i32, attempts: u32) -> i64 {
    let exponent = attempts.saturating_sub(1).min(20);
    let delay = (base_secs as i64).saturating_mul(2i64.saturating_pow(exponent));
    delay.min(MAX_RETRY_DELAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_spec_scenario() {
        assert_eq!(backoff_delay_secs(15, 1), 15);
        assert_eq!(backoff_delay_secs(15, 2), 30);
        assert_eq!(backoff_delay_secs(15, 3), 60);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay_secs(15, 20), MAX_RETRY_DELAY_SECS);
    }
}
