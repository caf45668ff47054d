//! Webhook endpoint + delivery queue queries (spec §4.6).

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{GatewayError, Result};

use super::models::{NewWebhook, NewWebhookDelivery, Webhook, WebhookDelivery};

pub async fn insert(pool: &PgPool, new: &NewWebhook) -> Result<Webhook> {
    sqlx::query_as::<_, Webhook>(
        r#"
        INSERT INTO webhooks
            (merchant_id, url, subscribed_events, status, secret, max_retries, base_retry_interval_secs)
        VALUES ($1, $2, $3, 'ACTIVE', $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(new.merchant_id)
    .bind(&new.url)
    .bind(&new.subscribed_events)
    .bind(&new.secret)
    .bind(new.max_retries)
    .bind(new.base_retry_interval_secs)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Webhook> {
    sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("webhook {id}")))
}

/// Every endpoint the delivery sweep should visit, regardless of status —
/// the sweeper itself checks `status == ACTIVE` per endpoint so a `FAILED`
/// one is skipped rather than never reconsidered.
pub async fn list_all(pool: &PgPool) -> Result<Vec<Webhook>> {
    sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

/// Subscribers for an event, excluding endpoints already in `FAILED` status.
pub async fn list_subscribed(pool: &PgPool, merchant_id: Uuid, event: &str) -> Result<Vec<Webhook>> {
    sqlx::query_as::<_, Webhook>(
        r#"
        SELECT * FROM webhooks
        WHERE merchant_id = $1 AND status = 'ACTIVE' AND $2 = ANY(subscribed_events)
        "#,
    )
    .bind(merchant_id)
    .bind(event)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Atomically claims the endpoint's delivery lease, returning `true` if
/// claimed. A stale lease (past `lease_secs`, e.g. a crashed dispatcher) is
/// reclaimable, not a permanent lock.
pub async fn try_claim_lease(pool: &PgPool, id: Uuid, lease_secs: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE webhooks
        SET delivery_lease_until = now() + make_interval(secs => $2)
        WHERE id = $1 AND (delivery_lease_until IS NULL OR delivery_lease_until < now())
        "#,
    )
    .bind(id)
    .bind(lease_secs as f64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn release_lease(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE webhooks SET delivery_lease_until = NULL WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_success(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE webhooks SET failed_attempts = 0, last_success_at = $2, last_attempt_at = $2, \
         next_retry_at = NULL, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_failure(
    pool: &PgPool,
    id: Uuid,
    at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    reason: &str,
) -> Result<()> {
    let status = if next_retry_at.is_none() { "FAILED" } else { "ACTIVE" };
    sqlx::query(
        r#"
        UPDATE webhooks
        SET failed_attempts = failed_attempts + 1, last_attempt_at = $2, last_failure_reason = $3,
            next_retry_at = $4, status = $5, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(at)
    .bind(reason)
    .bind(next_retry_at)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn enqueue_delivery(pool: &PgPool, new: &NewWebhookDelivery) -> Result<WebhookDelivery> {
    sqlx::query_as::<_, WebhookDelivery>(
        r#"
        INSERT INTO webhook_deliveries (webhook_id, event, payload, attempts, next_retry_at, delivered)
        VALUES ($1, $2, $3, 0, now(), false)
        RETURNING *
        "#,
    )
    .bind(new.webhook_id)
    .bind(&new.event)
    .bind(&new.payload)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}

/// Due, undelivered deliveries for a single endpoint, oldest first — the
/// per-endpoint serialization point for the webhook dispatcher (spec §5
/// ordering guarantee (b)).
pub async fn list_due_for_webhook(
    pool: &PgPool,
    webhook_id: Uuid,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<WebhookDelivery>> {
    sqlx::query_as::<_, WebhookDelivery>(
        r#"
        SELECT * FROM webhook_deliveries
        WHERE webhook_id = $1 AND delivered = false AND next_retry_at <= $2
        ORDER BY created_at ASC
        LIMIT $3
        "#,
    )
    .bind(webhook_id)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn mark_delivered(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE webhook_deliveries SET delivered = true, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_delivery_attempt(
    pool: &PgPool,
    id: Uuid,
    next_retry_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE webhook_deliveries SET attempts = attempts + 1, next_retry_at = $2, updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(next_retry_at)
    .execute(pool)
    .await?;
    Ok(())
}
