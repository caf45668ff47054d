//! Refund Engine: reverses the overpaid excess of a confirmed payment back to
//! the payer's address (spec §4.3 overpayment branch, §4.6 `refund.*` events).
//! Consumes the `RefundJob`s the Transaction State Machine enqueues on
//! `refund.process`.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::db::models::NewTransaction;
use crate::db::{addresses, audit, transactions};
use crate::domain::money::to_raw_units;
use crate::domain::EventName;
use crate::errors::{GatewayError, Result};
use crate::secrets::SecretRegistry;
use crate::state_machine::RefundJob;
use crate::webhook::WebhookPublisher;

const USDT_TOKEN_DECIMALS: u32 = 18;

pub struct RefundEngine {
    pool: PgPool,
    webhooks: Arc<WebhookPublisher>,
    secrets: Arc<SecretRegistry>,
    chain: ChainClient,
}

impl RefundEngine {
    pub fn new(pool: PgPool, webhooks: Arc<WebhookPublisher>, secrets: Arc<SecretRegistry>, chain: ChainClient) -> Self {
        Self { pool, webhooks, secrets, chain }
    }

    /// Consumer for `refund.process`: sweeps `job.amount` from the original
    /// payment's deposit address back to `job.destination`. Failure is
    /// reported via `RefundFailed` rather than propagated as retryable —
    /// overpayment refunds are best-effort, not guaranteed delivery.
    pub async fn process(&self, job: RefundJob) -> Result<()> {
        match self.try_refund(&job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(transaction_id = %job.transaction_id, error = %e, "refund failed");
                let tx = transactions::get(&self.pool, job.transaction_id).await?;
                self.webhooks
                    .enqueue(
                        tx.merchant_id,
                        EventName::RefundFailed,
                        serde_json::json!({ "transactionId": job.transaction_id, "reason": e.to_string() }),
                    )
                    .await
            }
        }
    }

    async fn try_refund(&self, job: &RefundJob) -> Result<()> {
        let tx = transactions::get(&self.pool, job.transaction_id).await?;

        // Single-flight guard: `refund.process` is delivered at-least-once
        // (spec §4.7), so a redelivery of this job must not re-send funds for
        // a transaction already refunded, mirroring the guards already used
        // in settlement (`settlement_tx_hash.is_some()`) and payout
        // (`tx.status != "PENDING"`).
        if transactions::refund_exists_for(&self.pool, tx.id).await? {
            info!(transaction_id = %tx.id, "refund already recorded, skipping");
            return Ok(());
        }

        let address_id = tx
            .address_id
            .ok_or_else(|| GatewayError::Internal(format!("transaction {} has no source address", tx.id)))?;
        let address = addresses::get(&self.pool, address_id).await?;
        let encrypted_key = address
            .encrypted_private_key
            .as_ref()
            .ok_or_else(|| GatewayError::Internal(format!("address {address_id} has no stored key")))?;
        let signer = self.secrets.decrypt_private_key(encrypted_key)?;

        let to = Address::from_str(&job.destination)
            .map_err(|e| GatewayError::Validation(format!("invalid refund destination: {e}")))?;
        let raw_amount = U256::from(to_raw_units(job.amount, USDT_TOKEN_DECIMALS));
        let hash = self.chain.transfer(&signer, to, raw_amount).await?;
        let hash_str = format!("{hash:#x}");

        record_refund_transaction(&self.pool, &tx, job, &hash_str).await?;
        audit::record(
            &self.pool,
            "REFUND_COMPLETED",
            "Transaction",
            tx.id,
            None,
            serde_json::json!({ "refundTxHash": hash_str.clone(), "amount": job.amount, "destination": job.destination.clone() }),
            Some(tx.merchant_id),
        )
        .await;

        self.webhooks
            .enqueue(
                tx.merchant_id,
                EventName::RefundCompleted,
                serde_json::json!({
                    "transactionId": job.transaction_id,
                    "refundTxHash": hash_str,
                    "amount": job.amount,
                }),
            )
            .await?;

        info!(transaction_id = %job.transaction_id, refund_tx_hash = %hash_str, "refund swept");
        Ok(())
    }
}

async fn record_refund_transaction(
    pool: &PgPool,
    original: &crate::db::models::Transaction,
    job: &RefundJob,
    refund_tx_hash: &str,
) -> Result<()> {
    transactions::insert_transfer(
        pool,
        &NewTransaction {
            merchant_id: original.merchant_id,
            address_id: original.address_id,
            tx_hash: Some(refund_tx_hash.to_string()),
            log_index: None,
            status: "COMPLETED".to_string(),
            transaction_type: "REFUND".to_string(),
            amount: job.amount,
            fee_amount: Decimal::ZERO,
            currency: original.currency.clone(),
            network: original.network.clone(),
            from_address: original.to_address.clone(),
            to_address: Some(job.destination.clone()),
            external_reference: None,
            metadata: Some(serde_json::json!({ "refundOf": original.id })),
        },
    )
    .await?;
    Ok(())
}
