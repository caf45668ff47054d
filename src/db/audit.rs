//! Audit log writes (spec §3 AuditLog: append-only, never mutated).

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;

use super::models::{AuditLog, NewAuditLog};

pub async fn insert(pool: &PgPool, new: &NewAuditLog) -> Result<AuditLog> {
    sqlx::query_as::<_, AuditLog>(
        r#"
        INSERT INTO audit_logs
            (action, entity_type, entity_id, prior_state, new_state, actor_id, merchant_id, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(&new.action)
    .bind(&new.entity_type)
    .bind(new.entity_id)
    .bind(&new.prior_state)
    .bind(&new.new_state)
    .bind(new.actor_id)
    .bind(new.merchant_id)
    .bind(&new.description)
    .fetch_one(pool)
    .await
    .map_err(Into::into)
}

/// Writes an audit row and logs (but does not propagate) any failure: an
/// audit-write hiccup must never block the business transition it records.
#[allow(clippy::too_many_arguments)]
pub async fn record(
    pool: &PgPool,
    action: &str,
    entity_type: &str,
    entity_id: Uuid,
    prior_state: Option<serde_json::Value>,
    new_state: serde_json::Value,
    merchant_id: Option<Uuid>,
) {
    let new = NewAuditLog {
        action: action.to_string(),
        entity_type: entity_type.to_string(),
        entity_id,
        prior_state,
        new_state: Some(new_state),
        actor_id: None,
        merchant_id,
        description: None,
    };
    if let Err(e) = insert(pool, &new).await {
        warn!(entity_id = %entity_id, error = %e, "failed to write audit log entry");
    }
}

pub async fn list_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: uuid::Uuid,
) -> Result<Vec<AuditLog>> {
    sqlx::query_as::<_, AuditLog>(
        "SELECT * FROM audit_logs WHERE entity_type = $1 AND entity_id = $2 ORDER BY created_at ASC",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}
