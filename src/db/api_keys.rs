//! API key queries (credential persistence; issuance/revocation flow lives in
//! the out-of-scope auth surface — see spec §1).

use sqlx::PgPool;

use crate::errors::{GatewayError, Result};

use super::models::{ApiKey, NewApiKey};

pub async fn insert(pool: &PgPool, new: &NewApiKey) -> Result<ApiKey> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        INSERT INTO api_keys (merchant_id, public_key_id, hashed_secret, status, read_only)
        VALUES ($1, $2, $3, 'ACTIVE', $4)
        RETURNING *
        "#,
    )
    .bind(new.merchant_id)
    .bind(&new.public_key_id)
    .bind(&new.hashed_secret)
    .bind(new.read_only)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}

pub async fn find_by_public_id(pool: &PgPool, public_key_id: &str) -> Result<ApiKey> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE public_key_id = $1")
        .bind(public_key_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::Auth("unknown API key".into()))
}

pub async fn record_use(pool: &PgPool, id: uuid::Uuid) -> Result<()> {
    sqlx::query("UPDATE api_keys SET use_count = use_count + 1, last_used_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
