//! Settlement Engine (spec §4.4): sweeps confirmed payments into the
//! merchant's settlement address (or hot wallet) and rebalances hot-wallet
//! excess into cold storage.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chain::ChainClient;
use crate::config::WalletConfig;
use crate::db::models::NewTransaction;
use crate::db::{addresses, audit, merchants, transactions};
use crate::domain::money::{from_raw_units, to_raw_units};
use crate::errors::{GatewayError, Result};
use crate::queue::{self, QueueBus};
use crate::secrets::SecretRegistry;
use crate::state_machine::{SettlementScheduleJob, StateMachine};
use crate::webhook::WebhookPublisher;
use crate::domain::EventName;

/// USDT BEP-20 on-chain decimals.
const USDT_TOKEN_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementExecuteJob {
    pub merchant_id: Uuid,
    pub transaction_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdStorageTransferJob;

pub struct SettlementEngine {
    pool: PgPool,
    queue: Arc<QueueBus>,
    webhooks: Arc<WebhookPublisher>,
    state_machine: Arc<StateMachine>,
    secrets: Arc<SecretRegistry>,
    chain: ChainClient,
    wallets: WalletConfig,
    /// Serializes cold-storage transfers across the process (spec §5:
    /// "Settlement execution for a given source address is serialized" and
    /// "at most one cold-storage transfer in flight across the process").
    cold_storage_lock: Mutex<()>,
}

impl SettlementEngine {
    pub fn new(
        pool: PgPool,
        queue: Arc<QueueBus>,
        webhooks: Arc<WebhookPublisher>,
        state_machine: Arc<StateMachine>,
        secrets: Arc<SecretRegistry>,
        chain: ChainClient,
        wallets: WalletConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            webhooks,
            state_machine,
            secrets,
            chain,
            wallets,
            cold_storage_lock: Mutex::new(()),
        }
    }

    /// *ScheduleSettlements* — periodic sweeper: groups every CONFIRMED,
    /// unsettled PAYMENT transaction by merchant and fans out one
    /// `settlement.execute` job per group, FIFO by confirmation time.
    pub async fn schedule_settlements(&self) -> Result<()> {
        let pending = transactions::list_confirmed_unsettled_payments(&self.pool).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_merchant: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for tx in pending {
            by_merchant.entry(tx.merchant_id).or_default().push(tx.id);
        }

        for (merchant_id, transaction_ids) in by_merchant {
            self.queue
                .publish(queue::SETTLEMENT_EXECUTE, &SettlementExecuteJob { merchant_id, transaction_ids })
                .await?;
        }
        Ok(())
    }

    /// Consumer entry point for the `settlement.schedule` queue — a
    /// confirmation tick that just advanced a payment nudges an immediate
    /// pass rather than waiting for the next sweeper tick.
    pub async fn on_schedule_job(&self, _job: SettlementScheduleJob) -> Result<()> {
        self.schedule_settlements().await
    }

    /// *Execute* — sweeps each referenced PaymentAddress's balance to the
    /// merchant's settlement address (or hot wallet if auto-settlement is
    /// disabled), records the hash, and marks the source addresses USED.
    pub async fn execute(&self, job: SettlementExecuteJob) -> Result<()> {
        let merchant = merchants::get(&self.pool, job.merchant_id).await?;
        let destination = if merchant.auto_settlement {
            match merchant.settlement_address.clone() {
                Some(addr) => addr,
                None => self.hot_wallet_address().await?,
            }
        } else {
            self.hot_wallet_address().await?
        };
        let destination_addr = Address::from_str(&destination)
            .map_err(|e| GatewayError::Internal(format!("invalid settlement destination: {e}")))?;

        for transaction_id in job.transaction_ids {
            if let Err(e) = self.sweep_one(transaction_id, destination_addr, &destination).await {
                warn!(transaction_id = %transaction_id, error = %e, "settlement sweep failed for transaction");
            }
        }
        Ok(())
    }

    /// Resolves the process-wide hot wallet's address — the sweep destination
    /// when a merchant has no settlement address on file or has disabled
    /// auto-settlement (spec §4.4).
    async fn hot_wallet_address(&self) -> Result<String> {
        addresses::get_hot_wallet(&self.pool)
            .await?
            .map(|a| a.address)
            .ok_or_else(|| GatewayError::Internal("no hot wallet provisioned".into()))
    }

    async fn sweep_one(&self, transaction_id: Uuid, destination_addr: Address, destination: &str) -> Result<()> {
        // Acquired for the life of this transaction block so a concurrent or
        // redelivered `settlement.execute` job targeting the same source
        // address blocks on this row until we commit, then sees
        // `settlement_tx_hash` already set and bails (spec §5: "settlement
        // execution for a given source address is serialized").
        let mut db_tx = self.pool.begin().await?;
        let tx = transactions::lock_for_update(&mut db_tx, transaction_id).await?;
        if tx.settlement_tx_hash.is_some() {
            db_tx.commit().await?;
            return Ok(()); // already settled by a prior attempt
        }
        let address_id = tx
            .address_id
            .ok_or_else(|| GatewayError::Internal(format!("transaction {transaction_id} has no source address")))?;
        let address = addresses::get(&self.pool, address_id).await?;
        let encrypted_key = address
            .encrypted_private_key
            .as_ref()
            .ok_or_else(|| GatewayError::Internal(format!("address {address_id} has no stored key")))?;
        let signer = self.secrets.decrypt_private_key(encrypted_key)?;

        // An overpaid payment with an enqueued refund only leaves `tx.amount -
        // overpaid` on the deposit address for settlement to sweep — the
        // excess is reserved for the Refund Engine. Sweeping the full
        // `tx.amount` here would double-spend the address (spec §5).
        let sweep_amount = if refund_was_enqueued(&tx.metadata) {
            (tx.amount - overpaid_amount(&tx.metadata)).max(Decimal::ZERO)
        } else {
            tx.amount
        };
        let raw_amount = U256::from(to_raw_units(sweep_amount, USDT_TOKEN_DECIMALS));
        let sweep_hash = self.chain.transfer(&signer, destination_addr, raw_amount).await?;
        let sweep_hash_str = format!("{sweep_hash:#x}");

        // Persist the hash and release the lock immediately: everything
        // after this point (fee/settlement records, webhook) is derived from
        // a sweep that's already durably recorded as done.
        transactions::set_settlement_tx_hash_locked(&mut db_tx, transaction_id, &sweep_hash_str).await?;
        db_tx.commit().await?;

        let fee = fee_for(&sweep_amount, &self.pool, tx.merchant_id).await.unwrap_or(Decimal::ZERO);
        if fee > Decimal::ZERO {
            transactions::insert_transfer(
                &self.pool,
                &NewTransaction {
                    merchant_id: tx.merchant_id,
                    address_id: tx.address_id,
                    tx_hash: None,
                    log_index: None,
                    status: "COMPLETED".to_string(),
                    transaction_type: "FEE".to_string(),
                    amount: fee,
                    fee_amount: Decimal::ZERO,
                    currency: tx.currency.clone(),
                    network: tx.network.clone(),
                    from_address: Some(address.address.clone()),
                    to_address: Some(destination.to_string()),
                    external_reference: None,
                    metadata: Some(serde_json::json!({ "settlementOf": transaction_id })),
                },
            )
            .await?;
        }

        transactions::insert_transfer(
            &self.pool,
            &NewTransaction {
                merchant_id: tx.merchant_id,
                address_id: tx.address_id,
                tx_hash: Some(sweep_hash_str.clone()),
                log_index: None,
                status: "COMPLETED".to_string(),
                transaction_type: "SETTLEMENT".to_string(),
                amount: sweep_amount,
                fee_amount: fee,
                currency: tx.currency.clone(),
                network: tx.network.clone(),
                from_address: Some(address.address.clone()),
                to_address: Some(destination.to_string()),
                external_reference: None,
                metadata: None,
            },
        )
        .await?;

        self.state_machine.on_settlement_complete(transaction_id, &sweep_hash_str).await?;
        addresses::mark_used(&self.pool, address_id).await?;
        audit::record(
            &self.pool,
            "SETTLEMENT_SWEPT",
            "Transaction",
            transaction_id,
            None,
            serde_json::json!({ "settlementTxHash": sweep_hash_str.clone(), "fee": fee, "sourceAddress": address.address.clone() }),
            Some(tx.merchant_id),
        )
        .await;
        self.webhooks
            .enqueue(
                tx.merchant_id,
                EventName::SettlementCompleted,
                serde_json::json!({ "transactionId": transaction_id, "settlementTxHash": sweep_hash_str }),
            )
            .await?;

        info!(transaction_id = %transaction_id, settlement_tx_hash = %sweep_hash_str, "settlement swept");
        Ok(())
    }

    /// *TransferToColdStorage* — rebalances hot-wallet excess above
    /// `hotWalletThreshold` down to `hotWalletTargetReserve`. A no-op under
    /// threshold. Serialized via `cold_storage_lock` (spec §5, §4.4).
    pub async fn transfer_to_cold_storage(&self, hot_wallet_signer_encrypted: &str) -> Result<()> {
        let _guard = self.cold_storage_lock.lock().await;

        let signer = self.secrets.decrypt_private_key(hot_wallet_signer_encrypted)?;
        let raw_balance = self.chain.balance_of(signer.address()).await?;
        let balance = from_raw_units(raw_balance.to::<u128>(), USDT_TOKEN_DECIMALS);

        if balance <= self.wallets.hot_wallet_threshold {
            return Ok(());
        }

        let excess = balance - self.wallets.hot_wallet_target_reserve;
        if excess <= Decimal::ZERO {
            return Ok(());
        }

        let cold_addr = Address::from_str(&self.wallets.cold_wallet_address)
            .map_err(|e| GatewayError::Internal(format!("invalid cold wallet address: {e}")))?;
        let raw_excess = U256::from(to_raw_units(excess, USDT_TOKEN_DECIMALS));
        let hash = self.chain.transfer(&signer, cold_addr, raw_excess).await?;
        let hash_str = format!("{hash:#x}");

        audit::record(
            &self.pool,
            "COLD_STORAGE_TRANSFER",
            "PaymentAddress",
            Uuid::nil(),
            None,
            serde_json::json!({ "amount": excess, "txHash": hash_str.clone() }),
            None,
        )
        .await;
        info!(amount = %excess, tx_hash = %hash_str, "rebalanced hot wallet to cold storage");
        Ok(())
    }
}

/// Percent + fixed fee schedule applied at settlement time (SPEC_FULL §B).
async fn fee_for(amount: &Decimal, pool: &PgPool, merchant_id: Uuid) -> Result<Decimal> {
    let merchant = merchants::get(pool, merchant_id).await?;
    Ok(amount * merchant.fee_percent / Decimal::from(100) + merchant.fee_fixed)
}

/// Reads back the excess the State Machine recorded on an overpaid
/// transaction's metadata (`state_machine::on_confirmation_tick`).
fn overpaid_amount(metadata: &Option<serde_json::Value>) -> Decimal {
    metadata
        .as_ref()
        .and_then(|m| m.get("overpaid"))
        .and_then(|v| serde_json::from_value::<Decimal>(v.clone()).ok())
        .unwrap_or(Decimal::ZERO)
}

/// Whether the State Machine actually published a `refund.process` job for
/// this transaction's overpaid excess, as opposed to merely recording the
/// overpaid amount for a merchant with auto-refund disabled.
fn refund_was_enqueued(metadata: &Option<serde_json::Value>) -> bool {
    metadata
        .as_ref()
        .and_then(|m| m.get("refundEnqueued"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}
