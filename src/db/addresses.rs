//! PaymentAddress queries (spec §3, §4.1).

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{GatewayError, Result};

use super::models::{HdIndexCounter, NewPaymentAddress, PaymentAddress};

pub async fn insert(pool: &PgPool, new: &NewPaymentAddress) -> Result<PaymentAddress> {
    sqlx::query_as::<_, PaymentAddress>(
        r#"
        INSERT INTO payment_addresses
            (merchant_id, address, address_type, encrypted_private_key, hd_derivation_path,
             hd_index, status, expected_amount, currency, expires_at, monitored,
             callback_url, external_reference, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, 'ACTIVE', $7, $8, $9, true, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(new.merchant_id)
    .bind(&new.address)
    .bind(&new.address_type)
    .bind(&new.encrypted_private_key)
    .bind(&new.hd_derivation_path)
    .bind(new.hd_index)
    .bind(new.expected_amount)
    .bind(&new.currency)
    .bind(new.expires_at)
    .bind(&new.callback_url)
    .bind(&new.external_reference)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<PaymentAddress> {
    sqlx::query_as::<_, PaymentAddress>("SELECT * FROM payment_addresses WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("payment address {id}")))
}

pub async fn get_by_address(pool: &PgPool, address: &str) -> Result<Option<PaymentAddress>> {
    sqlx::query_as::<_, PaymentAddress>("SELECT * FROM payment_addresses WHERE address = $1")
        .bind(address)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

/// Addresses currently being watched by the blockchain monitor.
pub async fn list_monitored(pool: &PgPool) -> Result<Vec<PaymentAddress>> {
    sqlx::query_as::<_, PaymentAddress>(
        "SELECT * FROM payment_addresses WHERE monitored = true AND status = 'ACTIVE'",
    )
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Oldest-first batch of expired-but-still-ACTIVE addresses with no inbound
/// transactions recorded against them (spec §4.1 `SweepExpired`).
pub async fn list_expirable(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<PaymentAddress>> {
    sqlx::query_as::<_, PaymentAddress>(
        r#"
        SELECT pa.* FROM payment_addresses pa
        WHERE pa.status = 'ACTIVE'
          AND pa.expires_at < $1
          AND NOT EXISTS (SELECT 1 FROM transactions t WHERE t.address_id = pa.id)
        ORDER BY pa.expires_at ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Idempotent: `Ok(true)` only when this call is the one that flipped
/// ACTIVE -> EXPIRED, `Ok(false)` when the address was already non-ACTIVE.
pub async fn mark_expired(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE payment_addresses SET status = 'EXPIRED', monitored = false, updated_at = now() \
         WHERE id = $1 AND status = 'ACTIVE'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Atomic ACTIVE -> USED transition; no-op if already USED (spec §4.1 `MarkUsed`).
pub async fn mark_used(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE payment_addresses SET status = 'USED', updated_at = now() \
         WHERE id = $1 AND status IN ('ACTIVE', 'USED')",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically reserves and returns the next unused HD index for a merchant.
/// Returns `CapacityExhausted` once the index space is consumed.
pub async fn next_hd_index(pool: &PgPool, merchant_id: Uuid, capacity: i64) -> Result<i64> {
    let row = sqlx::query_as::<_, HdIndexCounter>(
        r#"
        INSERT INTO hd_index_counters (merchant_id, next_index)
        VALUES ($1, 1)
        ON CONFLICT (merchant_id) DO UPDATE SET next_index = hd_index_counters.next_index + 1
        RETURNING merchant_id, next_index - 1 AS next_index
        "#,
    )
    .bind(merchant_id)
    .fetch_one(pool)
    .await?;

    if row.next_index >= capacity {
        return Err(GatewayError::Conflict(format!(
            "HD index space exhausted for merchant {merchant_id} (capacity {capacity})"
        )));
    }
    Ok(row.next_index)
}

/// The process-wide operational hot wallet, if one has been provisioned
/// (spec Glossary: "Hot wallet / cold wallet"). Used by the Settlement
/// Engine's `TransferToColdStorage` rebalance.
pub async fn get_hot_wallet(pool: &PgPool) -> Result<Option<PaymentAddress>> {
    sqlx::query_as::<_, PaymentAddress>(
        "SELECT * FROM payment_addresses WHERE address_type = 'HOT_WALLET' LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(Into::into)
}

/// §3 invariant: at most one ACTIVE merchant address per (merchant, external
/// reference) when a reference is supplied.
pub async fn active_exists_for_reference(
    pool: &PgPool,
    merchant_id: Uuid,
    external_reference: &str,
) -> Result<bool> {
    let exists: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM payment_addresses
            WHERE merchant_id = $1 AND external_reference = $2 AND status = 'ACTIVE'
        )
        "#,
    )
    .bind(merchant_id)
    .bind(external_reference)
    .fetch_one(pool)
    .await?;
    Ok(exists.0)
}
