//! Transaction queries (spec §3, §4.3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::TransactionStatus;
use crate::errors::{GatewayError, Result};

use super::models::{NewTransaction, Transaction};

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("transaction {id}")))
}

pub async fn get_by_tx_hash(pool: &PgPool, tx_hash: &str) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE tx_hash = $1")
        .bind(tx_hash)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

/// Conditional insert used by `OnDetect`: the `tx_hash` unique constraint
/// makes this the single-flight point for a given hash — a concurrent
/// duplicate detection loses the race and falls through to an UPDATE of the
/// existing row instead (spec §4.3, §8 invariant 2).
pub async fn insert_if_absent(pool: &PgPool, new: &NewTransaction) -> Result<Transaction> {
    let row = sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions
            (merchant_id, address_id, tx_hash, log_index, status, transaction_type,
             amount, fee_amount, currency, network, from_address, to_address,
             external_reference, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (tx_hash) WHERE tx_hash IS NOT NULL DO NOTHING
        RETURNING *
        "#,
    )
    .bind(new.merchant_id)
    .bind(new.address_id)
    .bind(&new.tx_hash)
    .bind(new.log_index)
    .bind(&new.status)
    .bind(&new.transaction_type)
    .bind(new.amount)
    .bind(new.fee_amount)
    .bind(&new.currency)
    .bind(&new.network)
    .bind(&new.from_address)
    .bind(&new.to_address)
    .bind(&new.external_reference)
    .bind(&new.metadata)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(tx) => Ok(tx),
        None => {
            let tx_hash = new
                .tx_hash
                .as_deref()
                .ok_or_else(|| GatewayError::Internal("insert_if_absent requires tx_hash".into()))?;
            get_by_tx_hash(pool, tx_hash)
                .await?
                .ok_or_else(|| GatewayError::Internal("conflicting row vanished".into()))
        }
    }
}

/// Updates rolling confirmation/block fields without touching `status`.
pub async fn update_confirmation_progress(
    pool: &PgPool,
    id: Uuid,
    confirmations: i32,
    block_number: Option<i64>,
    block_hash: Option<&str>,
    block_timestamp: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET confirmations = $2, block_number = $3, block_hash = $4, block_timestamp = $5,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(confirmations)
    .bind(block_number)
    .bind(block_hash)
    .bind(block_timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

/// Row-level-locked read for serialized state transitions (spec §5 ordering
/// guarantee (a): per `txHash`, transitions are totally ordered; guarantee
/// (c): settlement execution for a given source address is serialized).
/// Takes the caller's open transaction so the lock is held until that
/// transaction commits — callers must recheck whatever field they locked on
/// (e.g. `settlement_tx_hash`) and commit promptly.
pub async fn lock_for_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("transaction {id}")))
}

/// Same write as `set_settlement_tx_hash`, but against an already-open
/// transaction — used to persist the sweep hash before releasing the
/// `lock_for_update` lock, so the window in which a redelivered
/// `settlement.execute` job could resubmit the same sweep is only the time
/// between the on-chain transfer returning and this statement committing,
/// not the whole remainder of `sweep_one`.
pub async fn set_settlement_tx_hash_locked(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    settlement_tx_hash: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE transactions SET settlement_tx_hash = $2, status = 'SETTLED', updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(settlement_tx_hash)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// Only transitions if `from_status` still matches — guards against two
/// confirmation ticks racing to apply the same edge twice. Rejects any edge
/// `can_advance_to` doesn't allow (spec §4.3 DAG) before touching the row.
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from_status: &str,
    to_status: &str,
) -> Result<bool> {
    let from: TransactionStatus = from_status.parse()?;
    let to: TransactionStatus = to_status.parse()?;
    if !from.can_advance_to(to) {
        return Err(GatewayError::Conflict(format!(
            "illegal transition {from_status} -> {to_status}"
        )));
    }

    let result = sqlx::query(
        "UPDATE transactions SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from_status)
    .bind(to_status)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_metadata(pool: &PgPool, id: Uuid, metadata: serde_json::Value) -> Result<()> {
    sqlx::query("UPDATE transactions SET metadata = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(metadata)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_settlement_tx_hash(pool: &PgPool, id: Uuid, settlement_tx_hash: &str) -> Result<()> {
    sqlx::query(
        "UPDATE transactions SET settlement_tx_hash = $2, status = 'SETTLED', updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(settlement_tx_hash)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_webhook_sent(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE transactions SET webhook_sent = true, updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// CONFIRMED PAYMENT rows awaiting settlement, grouped by merchant by the
/// caller (spec §4.4 `ScheduleSettlements`).
pub async fn list_confirmed_unsettled_payments(pool: &PgPool) -> Result<Vec<Transaction>> {
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE status = 'CONFIRMED' AND transaction_type = 'PAYMENT' AND settlement_tx_hash IS NULL
        ORDER BY updated_at ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn sum_merchant_volume_since(
    pool: &PgPool,
    merchant_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Decimal> {
    let row: (Option<Decimal>,) = sqlx::query_as(
        r#"
        SELECT SUM(amount) FROM transactions
        WHERE merchant_id = $1 AND transaction_type = 'PAYOUT'
          AND status NOT IN ('FAILED', 'EXPIRED') AND created_at >= $2
        "#,
    )
    .bind(merchant_id)
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(row.0.unwrap_or(Decimal::ZERO))
}

/// Transactions the Blockchain Monitor still needs to track confirmations
/// for (spec §4.2: confirmation count is read, never baked into the monitor).
pub async fn list_confirming(pool: &PgPool) -> Result<Vec<Transaction>> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE status = 'CONFIRMING'")
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

/// CONFIRMING PAYOUT rows the Payout Engine still needs to poll via its
/// backend's `getTxStatus` (spec §4.5).
pub async fn list_confirming_payouts(pool: &PgPool) -> Result<Vec<Transaction>> {
    sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE status = 'CONFIRMING' AND transaction_type = 'PAYOUT'",
    )
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Whether a REFUND transaction already exists for `original_tx_id` — the
/// single-flight guard `RefundEngine::try_refund` checks before submitting an
/// on-chain transfer, so a redelivered `refund.process` job never sends funds
/// twice (spec §4.7: "every handler is expected to be idempotent on the
/// message's business key").
pub async fn refund_exists_for(pool: &PgPool, original_tx_id: Uuid) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM transactions
            WHERE transaction_type = 'REFUND' AND metadata->>'refundOf' = $1
        )
        "#,
    )
    .bind(original_tx_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn insert_transfer(pool: &PgPool, new: &NewTransaction) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions
            (merchant_id, address_id, tx_hash, status, transaction_type, amount, fee_amount,
             currency, network, from_address, to_address, external_reference, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING *
        "#,
    )
    .bind(new.merchant_id)
    .bind(new.address_id)
    .bind(&new.tx_hash)
    .bind(&new.status)
    .bind(&new.transaction_type)
    .bind(new.amount)
    .bind(new.fee_amount)
    .bind(&new.currency)
    .bind(&new.network)
    .bind(&new.from_address)
    .bind(&new.to_address)
    .bind(&new.external_reference)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}
