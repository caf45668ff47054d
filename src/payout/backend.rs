//! Payout execution backends (spec §4.5 capability set: `{submitTransfer,
//! getTxStatus, getBalance}`). Two are provided — a direct on-chain signer and
//! a custodial-exchange adapter — selected per deployment in `Config`.

use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;

use crate::chain::ChainClient;
use crate::config::CustodialConfig;
use crate::domain::money::from_raw_units;
use crate::errors::{GatewayError, Result};
use crate::secrets::SecretRegistry;

const USDT_TOKEN_DECIMALS: u32 = 18;

type HmacSha256 = Hmac<Sha256>;

/// Coarse outcome of polling a submitted payout reference (spec §4.5
/// `getTxStatus`) — deliberately opaque to whether the backend is an
/// on-chain confirmation count or a custodial exchange's withdrawal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

#[async_trait]
pub trait PayoutBackend: Send + Sync {
    /// Submits a transfer of `raw_amount` (on-chain integer units) to
    /// `destination`, returning an opaque reference — a tx hash for the
    /// on-chain backend, an exchange withdrawal id for the custodial one.
    async fn submit_transfer(&self, destination: &str, raw_amount: u128) -> Result<String>;

    /// Current status of a previously submitted transfer reference.
    async fn get_tx_status(&self, tx_ref: &str) -> Result<PayoutStatus>;

    /// Available payout balance, in gateway decimal units.
    async fn get_balance(&self) -> Result<Decimal>;
}

/// Signs and submits payouts directly from the process-wide hot wallet.
pub struct OnChainPayoutBackend {
    chain: ChainClient,
    secrets: SecretRegistry,
    hot_wallet_encrypted_key: String,
    required_confirmations: u32,
}

impl OnChainPayoutBackend {
    pub fn new(
        chain: ChainClient,
        secrets: SecretRegistry,
        hot_wallet_encrypted_key: String,
        required_confirmations: u32,
    ) -> Self {
        Self { chain, secrets, hot_wallet_encrypted_key, required_confirmations }
    }
}

#[async_trait]
impl PayoutBackend for OnChainPayoutBackend {
    async fn submit_transfer(&self, destination: &str, raw_amount: u128) -> Result<String> {
        let signer = self.secrets.decrypt_private_key(&self.hot_wallet_encrypted_key)?;
        let to = Address::from_str(destination)
            .map_err(|e| GatewayError::Validation(format!("invalid destination address: {e}")))?;
        let hash = self.chain.transfer(&signer, to, U256::from(raw_amount)).await?;
        Ok(format!("{hash:#x}"))
    }

    /// Mirrors the same confirmation tracking the Blockchain Monitor applies
    /// to inbound transfers (spec §4.5): a mined-but-shallow receipt is still
    /// `Pending`, a reverted one is `Failed`, and depth past
    /// `required_confirmations` is `Completed`.
    async fn get_tx_status(&self, tx_ref: &str) -> Result<PayoutStatus> {
        let hash: B256 = tx_ref
            .parse()
            .map_err(|e| GatewayError::Internal(format!("malformed payout tx hash {tx_ref}: {e}")))?;
        let Some(receipt) = self.chain.transaction_receipt(hash).await? else {
            return Ok(PayoutStatus::Pending);
        };
        if !receipt.success {
            return Ok(PayoutStatus::Failed);
        }
        let current_block = self.chain.current_block_number().await?;
        let confirmations = current_block.saturating_sub(receipt.block_number);
        if confirmations >= self.required_confirmations as u64 {
            Ok(PayoutStatus::Completed)
        } else {
            Ok(PayoutStatus::Pending)
        }
    }

    async fn get_balance(&self) -> Result<Decimal> {
        let signer = self.secrets.decrypt_private_key(&self.hot_wallet_encrypted_key)?;
        let raw = self.chain.balance_of(signer.address()).await?;
        Ok(from_raw_units(raw.to::<u128>(), USDT_TOKEN_DECIMALS))
    }
}

/// Routes payouts through a custodial exchange's withdrawal API instead of a
/// self-custodied signer. Request signing follows the same HMAC-SHA256
/// construction the gateway already uses for webhook delivery, applied here
/// to outbound exchange requests instead of outbound webhook bodies.
pub struct CustodialPayoutBackend {
    http: Client,
    config: CustodialConfig,
}

impl CustodialPayoutBackend {
    pub fn new(config: CustodialConfig) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("custodial HTTP client must build");
        Self { http, config }
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.binance_api_secret.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("invalid custodial HMAC key: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl PayoutBackend for CustodialPayoutBackend {
    async fn submit_transfer(&self, destination: &str, raw_amount: u128) -> Result<String> {
        let amount = from_raw_units(raw_amount, USDT_TOKEN_DECIMALS);
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("coin=USDT&network=BSC&address={destination}&amount={amount}&timestamp={timestamp}");
        let signature = self.sign(&query)?;
        let url = format!("{}/sapi/v1/capital/withdraw/apply?{query}&signature={signature}", self.config.binance_api_url);

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.config.binance_api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(GatewayError::External(format!("custodial withdrawal request failed: {}", resp.status())));
        }
        let body: serde_json::Value = resp.json().await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GatewayError::External("custodial withdrawal response missing id".into()))
    }

    /// Maps Binance's withdrawal status codes (0 Email Sent, 1 Cancelled,
    /// 2 Awaiting Approval, 3 Rejected, 4 Processing, 5 Failure, 6 Completed)
    /// onto the backend-agnostic `PayoutStatus`.
    async fn get_tx_status(&self, tx_ref: &str) -> Result<PayoutStatus> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("id={tx_ref}&timestamp={timestamp}");
        let signature = self.sign(&query)?;
        let url = format!("{}/sapi/v1/capital/withdraw/history?{query}&signature={signature}", self.config.binance_api_url);

        let resp = self.http.get(&url).header("X-MBX-APIKEY", &self.config.binance_api_key).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::External(format!("custodial status query failed: {}", resp.status())));
        }
        let body: serde_json::Value = resp.json().await?;
        let status = body.get("status").and_then(|v| v.as_i64()).unwrap_or(-1);
        Ok(match status {
            6 => PayoutStatus::Completed,
            1 | 3 | 5 => PayoutStatus::Failed,
            _ => PayoutStatus::Pending,
        })
    }

    async fn get_balance(&self) -> Result<Decimal> {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("timestamp={timestamp}");
        let signature = self.sign(&query)?;
        let url = format!("{}/sapi/v3/asset/getUserAsset?{query}&signature={signature}", self.config.binance_api_url);

        let resp = self.http.post(&url).header("X-MBX-APIKEY", &self.config.binance_api_key).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::External(format!("custodial balance query failed: {}", resp.status())));
        }
        let body: Vec<serde_json::Value> = resp.json().await?;
        let free = body
            .into_iter()
            .find(|a| a.get("asset").and_then(|v| v.as_str()) == Some("USDT"))
            .and_then(|a| a.get("free").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .unwrap_or_else(|| "0".to_string());
        Decimal::from_str(&free).map_err(|e| GatewayError::External(format!("malformed custodial balance: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let cfg = CustodialConfig {
            binance_api_key: "key".into(),
            binance_api_secret: "secret".into(),
            binance_api_url: "https://example.test".into(),
        };
        let backend = CustodialPayoutBackend::new(cfg);
        let a = backend.sign("coin=USDT&amount=1").unwrap();
        let b = backend.sign("coin=USDT&amount=1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_query() {
        let cfg = CustodialConfig {
            binance_api_key: "key".into(),
            binance_api_secret: "secret".into(),
            binance_api_url: "https://example.test".into(),
        };
        let backend = CustodialPayoutBackend::new(cfg);
        let a = backend.sign("amount=1").unwrap();
        let b = backend.sign("amount=2").unwrap();
        assert_ne!(a, b);
    }
}
