//! Transaction State Machine (spec §4.3): advances a payment through
//! PENDING→CONFIRMING→CONFIRMED/UNDERPAID→SETTLED→COMPLETED.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::db::models::{NewTransaction, Transaction};
use crate::db::{addresses, audit, merchants, transactions};
use crate::domain::money::{classify_amount, AmountClass};
use crate::domain::{EventName, TransactionStatus};
use crate::errors::{GatewayError, Result};
use crate::queue::{self, QueueBus};
use crate::webhook::WebhookPublisher;

/// Detection event surfaced by the Blockchain Monitor (spec §4.2 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub address: String,
    pub address_id: Uuid,
    pub merchant_id: Uuid,
    pub tx_hash: String,
    pub log_index: i32,
    pub from_address: String,
    pub amount: Decimal,
    pub block_number: i64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub raw_confirmations: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementScheduleJob {
    pub merchant_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundJob {
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub destination: String,
}

pub struct StateMachine {
    pool: PgPool,
    queue: Arc<QueueBus>,
    webhooks: Arc<WebhookPublisher>,
    required_confirmations: u32,
}

impl StateMachine {
    pub fn new(
        pool: PgPool,
        queue: Arc<QueueBus>,
        webhooks: Arc<WebhookPublisher>,
        required_confirmations: u32,
    ) -> Self {
        Self { pool, queue, webhooks, required_confirmations }
    }

    /// *OnDetect* — upserts a Transaction keyed by `txHash`, single-flight via
    /// the unique constraint on `tx_hash` (spec §4.3, §8 invariant 2 and 5).
    pub async fn on_detect(&self, event: DetectionEvent) -> Result<Transaction> {
        let address = addresses::get(&self.pool, event.address_id).await?;
        let expected_amount = address.expected_amount.unwrap_or(Decimal::ZERO);

        let new_tx = NewTransaction {
            merchant_id: event.merchant_id,
            address_id: Some(event.address_id),
            tx_hash: Some(event.tx_hash.clone()),
            log_index: Some(event.log_index),
            status: TransactionStatus::Confirming.to_string(),
            transaction_type: "PAYMENT".to_string(),
            amount: event.amount,
            fee_amount: Decimal::ZERO,
            currency: address.currency.clone(),
            network: "BSC".to_string(),
            from_address: Some(event.from_address.clone()),
            to_address: Some(event.address.clone()),
            external_reference: address.external_reference.clone(),
            metadata: Some(serde_json::json!({ "expectedAmount": expected_amount })),
        };

        let is_new = transactions::get_by_tx_hash(&self.pool, &event.tx_hash).await?.is_none();
        let tx = transactions::insert_if_absent(&self.pool, &new_tx).await?;

        transactions::update_confirmation_progress(
            &self.pool,
            tx.id,
            event.raw_confirmations,
            Some(event.block_number),
            Some(&event.block_hash),
            Some(event.block_timestamp),
        )
        .await?;

        if is_new {
            self.queue
                .publish(queue::TRANSACTION_MONITOR, &ConfirmationTickJob { transaction_id: tx.id })
                .await?;
            self.webhooks
                .enqueue(tx.merchant_id, EventName::PaymentReceived, transaction_event_payload(&tx))
                .await?;
            audit::record(
                &self.pool,
                "TRANSACTION_DETECTED",
                "Transaction",
                tx.id,
                None,
                transaction_event_payload(&tx),
                Some(tx.merchant_id),
            )
            .await;
            info!(tx_id = %tx.id, tx_hash = %event.tx_hash, "payment detected");
        }

        Ok(tx)
    }

    /// *OnConfirmationTick* — reloads the transaction and, once enough
    /// confirmations are present, classifies the amount and advances state.
    /// Idempotent under repeated ticks (spec §4.3 invariant, §8 round-trip law).
    pub async fn on_confirmation_tick(&self, transaction_id: Uuid) -> Result<()> {
        let tx = transactions::get(&self.pool, transaction_id).await?;
        if tx.transaction_type != "PAYMENT" {
            return Ok(()); // payouts/refunds track confirmations through their own engines
        }

        let current_status: TransactionStatus = tx.status.parse()?;
        if current_status.is_terminal() || matches!(current_status, TransactionStatus::Underpaid) {
            return Ok(());
        }
        if tx.confirmations < self.required_confirmations as i32 {
            return Ok(());
        }
        if !matches!(current_status, TransactionStatus::Confirming) {
            return Ok(()); // already advanced past CONFIRMING by a prior tick
        }

        let address = match tx.address_id {
            Some(id) => Some(addresses::get(&self.pool, id).await?),
            None => None,
        };
        let expected = address.as_ref().and_then(|a| a.expected_amount).unwrap_or(tx.amount);

        match classify_amount(tx.amount, expected) {
            AmountClass::Exact | AmountClass::Over => {
                let overpaid = (tx.amount - expected).max(Decimal::ZERO);
                let advanced = transactions::transition_status(
                    &self.pool,
                    tx.id,
                    &TransactionStatus::Confirming.to_string(),
                    &TransactionStatus::Confirmed.to_string(),
                )
                .await?;
                if !advanced {
                    return Ok(());
                }
                audit::record(
                    &self.pool,
                    "TRANSACTION_CONFIRMED",
                    "Transaction",
                    tx.id,
                    Some(serde_json::json!({ "status": "CONFIRMING" })),
                    serde_json::json!({ "status": "CONFIRMED", "overpaid": overpaid }),
                    Some(tx.merchant_id),
                )
                .await;

                if overpaid > Decimal::ZERO {
                    // spec §4.3: "enqueue a REFUND job for the excess if the
                    // merchant's policy is refund-overpay (default on)". Whether
                    // the job actually went out is recorded on the transaction
                    // itself (`refundEnqueued`) so Settlement knows to carve the
                    // excess out of its sweep rather than draining the deposit
                    // address twice (spec §5: the address only ever holds the
                    // amount actually received).
                    let merchant = merchants::get(&self.pool, tx.merchant_id).await?;
                    let refund_enqueued = merchant.refund_overpay_by_default && tx.from_address.is_some();

                    let mut metadata = tx.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
                    metadata["overpaid"] = serde_json::json!(overpaid);
                    metadata["refundEnqueued"] = serde_json::json!(refund_enqueued);
                    transactions::set_metadata(&self.pool, tx.id, metadata).await?;

                    if refund_enqueued {
                        let from_address = tx.from_address.clone().expect("checked above");
                        self.queue
                            .publish(
                                queue::REFUND_PROCESS,
                                &RefundJob { transaction_id: tx.id, amount: overpaid, destination: from_address },
                            )
                            .await?;
                        self.webhooks
                            .enqueue(tx.merchant_id, EventName::RefundInitiated, transaction_event_payload(&tx))
                            .await?;
                    }
                }

                self.queue
                    .publish(queue::SETTLEMENT_SCHEDULE, &SettlementScheduleJob { merchant_id: tx.merchant_id })
                    .await?;
                self.webhooks
                    .enqueue(tx.merchant_id, EventName::PaymentConfirmed, transaction_event_payload(&tx))
                    .await?;
                if let Some(address_id) = tx.address_id {
                    crate::db::addresses::mark_used(&self.pool, address_id).await?;
                }
            }
            AmountClass::Under => {
                let advanced = transactions::transition_status(
                    &self.pool,
                    tx.id,
                    &TransactionStatus::Confirming.to_string(),
                    &TransactionStatus::Underpaid.to_string(),
                )
                .await?;
                if advanced {
                    audit::record(
                        &self.pool,
                        "TRANSACTION_UNDERPAID",
                        "Transaction",
                        tx.id,
                        Some(serde_json::json!({ "status": "CONFIRMING" })),
                        serde_json::json!({ "status": "UNDERPAID" }),
                        Some(tx.merchant_id),
                    )
                    .await;
                    self.webhooks
                        .enqueue(tx.merchant_id, EventName::PaymentUnderpaid, transaction_event_payload(&tx))
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// *OnSettlementComplete* — status→SETTLED.
    pub async fn on_settlement_complete(&self, transaction_id: Uuid, sweep_tx_hash: &str) -> Result<()> {
        let tx = transactions::get(&self.pool, transaction_id).await?;
        transactions::set_settlement_tx_hash(&self.pool, tx.id, sweep_tx_hash).await?;
        audit::record(
            &self.pool,
            "TRANSACTION_SETTLED",
            "Transaction",
            tx.id,
            Some(serde_json::json!({ "status": tx.status.clone() })),
            serde_json::json!({ "status": "SETTLED", "settlementTxHash": sweep_tx_hash }),
            Some(tx.merchant_id),
        )
        .await;
        self.webhooks
            .enqueue(tx.merchant_id, EventName::TransactionSettled, transaction_event_payload(&tx))
            .await
    }

    /// *OnAcknowledged* — status→COMPLETED; terminal.
    pub async fn on_acknowledged(&self, transaction_id: Uuid) -> Result<()> {
        let advanced = transactions::transition_status(
            &self.pool,
            transaction_id,
            &TransactionStatus::Settled.to_string(),
            &TransactionStatus::Completed.to_string(),
        )
        .await?;
        if advanced {
            let tx = transactions::get(&self.pool, transaction_id).await?;
            audit::record(
                &self.pool,
                "TRANSACTION_COMPLETED",
                "Transaction",
                tx.id,
                Some(serde_json::json!({ "status": "SETTLED" })),
                serde_json::json!({ "status": "COMPLETED" }),
                Some(tx.merchant_id),
            )
            .await;
            self.webhooks
                .enqueue(tx.merchant_id, EventName::PaymentCompleted, transaction_event_payload(&tx))
                .await?;
        }
        Ok(())
    }

    /// *Expire* — only valid while PENDING.
    pub async fn expire(&self, transaction_id: Uuid) -> Result<()> {
        let advanced = transactions::transition_status(
            &self.pool,
            transaction_id,
            &TransactionStatus::Pending.to_string(),
            &TransactionStatus::Expired.to_string(),
        )
        .await?;
        if !advanced {
            return Err(GatewayError::Conflict("transaction is not PENDING".into()));
        }
        let tx = transactions::get(&self.pool, transaction_id).await?;
        audit::record(
            &self.pool,
            "TRANSACTION_EXPIRED",
            "Transaction",
            transaction_id,
            Some(serde_json::json!({ "status": "PENDING" })),
            serde_json::json!({ "status": "EXPIRED" }),
            Some(tx.merchant_id),
        )
        .await;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationTickJob {
    pub transaction_id: Uuid,
}

fn transaction_event_payload(tx: &Transaction) -> serde_json::Value {
    serde_json::json!({
        "transaction": {
            "id": tx.id,
            "txHash": tx.tx_hash,
            "status": tx.status,
            "amount": tx.amount,
            "currency": tx.currency,
            "confirmations": tx.confirmations,
            "metadata": tx.metadata,
        },
        "merchant": { "id": tx.merchant_id },
    })
}
