//! Payout Engine (spec §4.5): merchant-initiated outbound USDT transfers,
//! executed by one of two polymorphic backends (direct on-chain signer or
//! custodial exchange), reusing the Blockchain Monitor's generic confirmation
//! tracking rather than a bespoke poller.

pub mod backend;

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address as EvmAddress;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{NewTransaction, Transaction};
use crate::db::{audit, merchants, transactions};
use crate::domain::money::to_raw_units;
use crate::domain::EventName;
use crate::errors::{GatewayError, Result};
use crate::queue::{self, QueueBus};
use crate::webhook::WebhookPublisher;

pub use backend::{PayoutBackend, PayoutStatus};

const USDT_TOKEN_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayoutParams {
    pub merchant_id: Uuid,
    pub currency: String,
    pub amount: Decimal,
    pub destination: String,
    pub network: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutExecuteJob {
    pub transaction_id: Uuid,
}

pub struct PayoutEngine {
    pool: PgPool,
    queue: Arc<QueueBus>,
    webhooks: Arc<WebhookPublisher>,
    backend: Arc<dyn PayoutBackend>,
}

impl PayoutEngine {
    pub fn new(pool: PgPool, queue: Arc<QueueBus>, webhooks: Arc<WebhookPublisher>, backend: Arc<dyn PayoutBackend>) -> Self {
        Self { pool, queue, webhooks, backend }
    }

    /// *CreatePayout* — validates destination format, per-tx and rolling
    /// volume caps, merchant gates, and hot-wallet/custodial balance, then
    /// persists a PENDING PAYOUT transaction and enqueues execution.
    ///
    /// Wrapped by the caller in [`idempotency::run`] keyed on the client's
    /// `Idempotency-Key` header (spec §8 scenario 5), so this function itself
    /// performs no dedup beyond the state it persists.
    pub async fn create_payout(&self, params: CreatePayoutParams) -> Result<Uuid> {
        let merchant = merchants::get(&self.pool, params.merchant_id).await?;
        if merchant.status != "ACTIVE" {
            return Err(GatewayError::Conflict("merchant is not ACTIVE".into()));
        }
        if params.amount <= Decimal::ZERO {
            return Err(GatewayError::Validation("payout amount must be > 0".into()));
        }
        if let Some(min) = merchant.min_tx_amount {
            if params.amount < min {
                return Err(GatewayError::Validation(format!("amount below merchant minimum {min}")));
            }
        }
        if let Some(max) = merchant.max_tx_amount {
            if params.amount > max {
                return Err(GatewayError::Validation(format!("amount exceeds merchant maximum {max}")));
            }
        }
        validate_destination(&params.destination, &params.network)?;

        if let Some(cap) = merchant.daily_volume_cap {
            let since = Utc::now() - chrono::Duration::days(1);
            let spent = transactions::sum_merchant_volume_since(&self.pool, merchant.id, since).await?;
            if spent + params.amount > cap {
                return Err(GatewayError::Conflict("daily payout volume cap exceeded".into()));
            }
        }
        if let Some(cap) = merchant.monthly_volume_cap {
            let since = Utc::now() - chrono::Duration::days(30);
            let spent = transactions::sum_merchant_volume_since(&self.pool, merchant.id, since).await?;
            if spent + params.amount > cap {
                return Err(GatewayError::Conflict("monthly payout volume cap exceeded".into()));
            }
        }

        let balance = self.backend.get_balance().await?;
        if balance < params.amount {
            return Err(GatewayError::Conflict("insufficient balance for payout".into()));
        }

        let tx = transactions::insert_transfer(
            &self.pool,
            &NewTransaction {
                merchant_id: merchant.id,
                address_id: None,
                tx_hash: None,
                log_index: None,
                status: "PENDING".to_string(),
                transaction_type: "PAYOUT".to_string(),
                amount: params.amount,
                fee_amount: Decimal::ZERO,
                currency: params.currency,
                network: params.network,
                from_address: None,
                to_address: Some(params.destination),
                external_reference: None,
                metadata: params.metadata,
            },
        )
        .await?;

        self.queue.publish(queue::PAYOUT_EXECUTE, &PayoutExecuteJob { transaction_id: tx.id }).await?;
        self.webhooks.enqueue(merchant.id, EventName::PayoutInitiated, payout_event_payload(&tx)).await?;
        audit::record(
            &self.pool,
            "PAYOUT_CREATED",
            "Transaction",
            tx.id,
            None,
            payout_event_payload(&tx),
            Some(merchant.id),
        )
        .await;
        info!(transaction_id = %tx.id, merchant_id = %merchant.id, "payout accepted");
        Ok(tx.id)
    }

    /// Consumer for `payout.execute`: submits the transfer through the
    /// configured backend and transitions PENDING → CONFIRMING.
    pub async fn execute(&self, job: PayoutExecuteJob) -> Result<()> {
        let tx = transactions::get(&self.pool, job.transaction_id).await?;
        if tx.status != "PENDING" {
            return Ok(()); // already submitted by a prior attempt
        }
        let destination = tx
            .to_address
            .as_deref()
            .ok_or_else(|| GatewayError::Internal(format!("payout {} has no destination", tx.id)))?;

        let raw_amount = to_raw_units(tx.amount, USDT_TOKEN_DECIMALS);
        let tx_ref = self.backend.submit_transfer(destination, raw_amount).await?;
        sqlx_set_tx_hash(&self.pool, tx.id, &tx_ref).await?;

        let advanced = transactions::transition_status(&self.pool, tx.id, "PENDING", "CONFIRMING").await?;
        if advanced {
            self.webhooks.enqueue(tx.merchant_id, EventName::PayoutProcessing, payout_event_payload(&tx)).await?;
        }
        info!(transaction_id = %tx.id, tx_hash = %tx_ref, "payout submitted");
        Ok(())
    }

    /// *PollConfirmations* — periodic sweep: a payout has no deposit address
    /// for the Blockchain Monitor to watch, so confirmation tracking is
    /// driven directly through the backend's `getTxStatus` capability instead
    /// (spec §4.5: "relies on the same confirmation tracking as inbound
    /// payments", generalized here to whichever backend is configured).
    pub async fn poll_confirmations(&self) -> Result<()> {
        let pending = transactions::list_confirming_payouts(&self.pool).await?;
        for tx in pending {
            if let Err(e) = self.poll_one(&tx).await {
                warn!(transaction_id = %tx.id, error = %e, "payout confirmation poll failed");
            }
        }
        Ok(())
    }

    async fn poll_one(&self, tx: &Transaction) -> Result<()> {
        let Some(tx_hash) = tx.tx_hash.as_deref() else { return Ok(()) };
        match self.backend.get_tx_status(tx_hash).await? {
            PayoutStatus::Pending => Ok(()),
            PayoutStatus::Completed => {
                let advanced = transactions::transition_status(&self.pool, tx.id, "CONFIRMING", "COMPLETED").await?;
                if advanced {
                    self.webhooks.enqueue(tx.merchant_id, EventName::PayoutCompleted, payout_event_payload(tx)).await?;
                    audit::record(
                        &self.pool,
                        "PAYOUT_COMPLETED",
                        "Transaction",
                        tx.id,
                        Some(serde_json::json!({ "status": "CONFIRMING" })),
                        serde_json::json!({ "status": "COMPLETED" }),
                        Some(tx.merchant_id),
                    )
                    .await;
                    info!(transaction_id = %tx.id, "payout completed");
                }
                Ok(())
            }
            PayoutStatus::Failed => {
                let advanced = transactions::transition_status(&self.pool, tx.id, "CONFIRMING", "FAILED").await?;
                if advanced {
                    self.webhooks.enqueue(tx.merchant_id, EventName::PayoutFailed, payout_event_payload(tx)).await?;
                    audit::record(
                        &self.pool,
                        "PAYOUT_FAILED",
                        "Transaction",
                        tx.id,
                        Some(serde_json::json!({ "status": "CONFIRMING" })),
                        serde_json::json!({ "status": "FAILED" }),
                        Some(tx.merchant_id),
                    )
                    .await;
                    warn!(transaction_id = %tx.id, "payout failed on-chain");
                }
                Ok(())
            }
        }
    }
}

async fn sqlx_set_tx_hash(pool: &PgPool, id: Uuid, tx_hash: &str) -> Result<()> {
    sqlx::query("UPDATE transactions SET tx_hash = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(tx_hash)
        .execute(pool)
        .await?;
    Ok(())
}

/// Destination format check for the networks the gateway actually supports
/// (spec §1 Non-goal: no general address-book/multi-chain routing, but a
/// malformed destination must still be rejected before funds move).
fn validate_destination(destination: &str, network: &str) -> Result<()> {
    match network {
        "BSC" => EvmAddress::from_str(destination)
            .map(|_| ())
            .map_err(|_| GatewayError::Validation(format!("invalid BSC address: {destination}"))),
        other => Err(GatewayError::Validation(format!("unsupported payout network: {other}"))),
    }
}

fn payout_event_payload(tx: &crate::db::models::Transaction) -> serde_json::Value {
    serde_json::json!({
        "transaction": {
            "id": tx.id,
            "txHash": tx.tx_hash,
            "status": tx.status,
            "amount": tx.amount,
            "currency": tx.currency,
            "destination": tx.to_address,
        },
        "merchant": { "id": tx.merchant_id },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_bsc_destination() {
        assert!(validate_destination("not-an-address", "BSC").is_err());
    }

    #[test]
    fn accepts_well_formed_bsc_destination() {
        assert!(validate_destination("0x0000000000000000000000000000000000000001", "BSC").is_ok());
    }

    #[test]
    fn rejects_unsupported_network() {
        assert!(validate_destination("0x0000000000000000000000000000000000000001", "ETH").is_err());
    }
}
