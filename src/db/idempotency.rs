//! Idempotency key persistence (spec §4.8, §6 `Idempotency-Key` header contract).

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::errors::Result;

use super::models::{IdempotencyKey, NewIdempotencyKey};

/// Reserves a key for `(client_key, method, path)`. Returns `None` if a row
/// already exists — the caller then decides between "replay the stored
/// response" (fingerprint matches) and "conflicting reuse" (it doesn't).
pub async fn try_begin(pool: &PgPool, new: &NewIdempotencyKey) -> Result<Option<IdempotencyKey>> {
    sqlx::query_as::<_, IdempotencyKey>(
        r#"
        INSERT INTO idempotency_keys (client_key, method, path, request_fingerprint, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (client_key, method, path) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(&new.client_key)
    .bind(&new.method)
    .bind(&new.path)
    .bind(&new.request_fingerprint)
    .bind(new.expires_at)
    .fetch_optional(pool)
    .await
    .map_err(Into::into)
}

pub async fn find(
    pool: &PgPool,
    client_key: &str,
    method: &str,
    path: &str,
) -> Result<Option<IdempotencyKey>> {
    sqlx::query_as::<_, IdempotencyKey>(
        "SELECT * FROM idempotency_keys WHERE client_key = $1 AND method = $2 AND path = $3",
    )
    .bind(client_key)
    .bind(method)
    .bind(path)
    .fetch_optional(pool)
    .await
    .map_err(Into::into)
}

pub async fn complete(
    pool: &PgPool,
    id: uuid::Uuid,
    response_status: i32,
    response_body: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE idempotency_keys
        SET response_status = $2, response_body = $3, completed_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(response_status)
    .bind(response_body)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn sweep_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < $1")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
