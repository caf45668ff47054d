//! Merchant queries.

use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{GatewayError, Result};

use super::models::{Merchant, NewMerchant};

pub async fn insert(pool: &PgPool, new: &NewMerchant) -> Result<Merchant> {
    sqlx::query_as::<_, Merchant>(
        r#"
        INSERT INTO merchants (business_name, contact_email, status, risk_level, fee_percent, fee_fixed)
        VALUES ($1, $2, 'PENDING', 'LOW', $3, $4)
        RETURNING *
        "#,
    )
    .bind(&new.business_name)
    .bind(&new.contact_email)
    .bind(new.fee_percent)
    .bind(new.fee_fixed)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Merchant> {
    sqlx::query_as::<_, Merchant>("SELECT * FROM merchants WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("merchant {id}")))
}

pub async fn is_active(pool: &PgPool, id: Uuid) -> Result<bool> {
    let merchant = get(pool, id).await?;
    Ok(merchant.status == "ACTIVE")
}
