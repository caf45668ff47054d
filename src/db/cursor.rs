//! Chain cursor persistence — the monitor's durable "last processed block"
//! bookmark, restored on restart so a crash doesn't re-scan from genesis or
//! silently skip blocks (spec §4.2).

use sqlx::PgPool;

use crate::errors::Result;

use super::models::ChainCursor;

pub async fn get(pool: &PgPool, chain_id: i64) -> Result<Option<ChainCursor>> {
    sqlx::query_as::<_, ChainCursor>("SELECT * FROM chain_cursors WHERE chain_id = $1")
        .bind(chain_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
}

pub async fn upsert(pool: &PgPool, chain_id: i64, last_processed_block: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chain_cursors (chain_id, last_processed_block)
        VALUES ($1, $2)
        ON CONFLICT (chain_id) DO UPDATE
        SET last_processed_block = $2, updated_at = now()
        WHERE chain_cursors.last_processed_block < $2
        "#,
    )
    .bind(chain_id)
    .bind(last_processed_block)
    .execute(pool)
    .await?;
    Ok(())
}

/// Rewinds the cursor for reorg recovery — unlike `upsert`, this allows
/// moving backward (spec §4.2 `reorgRewindBlocks`).
pub async fn rewind(pool: &PgPool, chain_id: i64, to_block: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chain_cursors (chain_id, last_processed_block)
        VALUES ($1, $2)
        ON CONFLICT (chain_id) DO UPDATE SET last_processed_block = $2, updated_at = now()
        "#,
    )
    .bind(chain_id)
    .bind(to_block)
    .execute(pool)
    .await?;
    Ok(())
}
