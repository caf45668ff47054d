//! Idempotency Store (spec §4.8): wraps a mutating handler so that a retried
//! request with the same `Idempotency-Key` replays the first response instead
//! of re-executing, and a request that arrives while the first is still in
//! flight is rejected rather than double-run.

use std::future::Future;

use chrono::{Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::db::idempotency;
use crate::db::models::{IdempotencyKey, NewIdempotencyKey};
use crate::errors::{GatewayError, Result};

const TTL_HOURS: i64 = 24;

/// Outcome of [`begin`] — tells the caller whether to run the handler or
/// short-circuit with a previously captured response.
pub enum Guard {
    /// No prior row: run the handler, then call [`complete`] with `row.id`.
    Run { row: IdempotencyKey },
    /// A completed prior request with the same fingerprint: replay it.
    Replay { status: u16, body: serde_json::Value },
}

/// Fingerprints `body` so that a key reused with a *different* payload is
/// distinguishable from a genuine retry (spec §4.8, §6 `Idempotency-Key`).
pub fn fingerprint<T: Serialize>(body: &T) -> Result<String> {
    let bytes = serde_json::to_vec(body).map_err(|e| GatewayError::Internal(format!("fingerprint: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// *Begin* — reserves `(client_key, method, path)`. A second request for the
/// same key while the first is still running (no `response_status` yet) is
/// rejected with `Conflict` ("InProgress" in spec terms); a second request
/// after completion replays the stored response.
pub async fn begin(pool: &PgPool, client_key: &str, method: &str, path: &str, request_fingerprint: &str) -> Result<Guard> {
    let new = NewIdempotencyKey {
        client_key: client_key.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        request_fingerprint: request_fingerprint.to_string(),
        expires_at: Utc::now() + Duration::hours(TTL_HOURS),
    };

    if let Some(row) = idempotency::try_begin(pool, &new).await? {
        return Ok(Guard::Run { row });
    }

    let existing = idempotency::find(pool, client_key, method, path)
        .await?
        .ok_or_else(|| GatewayError::Internal("idempotency row vanished after insert conflict".into()))?;

    if existing.request_fingerprint != request_fingerprint {
        return Err(GatewayError::Conflict(
            "idempotency key reused with a different request body".into(),
        ));
    }

    match (existing.response_status, existing.response_body.clone()) {
        (Some(status), Some(body)) => Ok(Guard::Replay { status: status as u16, body }),
        _ => Err(GatewayError::Conflict("a request with this idempotency key is already in progress".into())),
    }
}

pub async fn complete(pool: &PgPool, id: uuid::Uuid, status: u16, body: serde_json::Value) -> Result<()> {
    idempotency::complete(pool, id, status as i32, body).await
}

/// Runs `handler` under an idempotency guard, capturing its response for
/// replay. `handler` must return the `(status, body)` pair that will be sent
/// to the client.
pub async fn run<F, Fut>(
    pool: &PgPool,
    client_key: &str,
    method: &str,
    path: &str,
    request_fingerprint: &str,
    handler: F,
) -> Result<(u16, serde_json::Value)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(u16, serde_json::Value)>>,
{
    match begin(pool, client_key, method, path, request_fingerprint).await? {
        Guard::Replay { status, body } => Ok((status, body)),
        Guard::Run { row } => {
            let (status, body) = handler().await?;
            complete(pool, row.id, status, body.clone()).await?;
            Ok((status, body))
        }
    }
}

/// Periodic sweeper entry point (spec §4.8 "a sweeper deletes expired rows").
pub async fn sweep_expired(pool: &PgPool) -> Result<u64> {
    idempotency::sweep_expired(pool, Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_equal_payloads() {
        let a = serde_json::json!({ "amount": 50, "address": "0xabc" });
        let b = serde_json::json!({ "amount": 50, "address": "0xabc" });
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_differs_for_different_payloads() {
        let a = serde_json::json!({ "amount": 50 });
        let b = serde_json::json!({ "amount": 51 });
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }
}
