//! Thin on-chain execution layer: wraps a derived signer in a wallet-filled
//! alloy provider and exposes the USDT operations the Settlement and Payout
//! Engines need (submitTransfer/getBalance from spec §4.5's execution backend
//! capability set).

pub mod erc20;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;

use crate::errors::{GatewayError, Result};
use erc20::ERC20;

/// A signer bound to a single RPC endpoint and the USDT contract, capable of
/// submitting one transfer. Built fresh per operation from the decrypted
/// signer — it is never held beyond the call that needs it (spec §5:
/// "derivation obtains a short-lived key that is zeroed after use").
#[derive(Clone)]
pub struct ChainClient {
    rpc_url: String,
    usdt_contract: Address,
}

impl ChainClient {
    pub fn new(rpc_url: String, usdt_contract: Address) -> Self {
        Self { rpc_url, usdt_contract }
    }

    /// Submits a USDT transfer from `signer`'s address to `to` for
    /// `raw_amount` (on-chain integer units) and waits for the receipt.
    pub async fn transfer(&self, signer: &PrivateKeySigner, to: Address, raw_amount: U256) -> Result<B256> {
        let wallet = EthereumWallet::from(signer.clone());
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().wallet(wallet).on_http(url);
        let contract = ERC20::new(self.usdt_contract, provider);

        let pending = contract
            .transfer(to, raw_amount)
            .send()
            .await
            .map_err(|e| GatewayError::External(format!("USDT transfer submission failed: {e}")))?;

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| GatewayError::External(format!("USDT transfer confirmation failed: {e}")))?;

        Ok(receipt.transaction_hash)
    }

    /// Reads the USDT balance of `owner` (raw on-chain units).
    pub async fn balance_of(&self, owner: Address) -> Result<U256> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);
        let contract = ERC20::new(self.usdt_contract, provider);

        contract
            .balanceOf(owner)
            .call()
            .await
            .map(|r| r._0)
            .map_err(|e| GatewayError::External(format!("balance query failed: {e}")))
    }

    /// Native-gas (BNB) balance of `owner` — needed before a sweep to confirm
    /// the source address can pay its own transfer's gas.
    pub async fn native_balance_of(&self, owner: Address) -> Result<U256> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);
        provider
            .get_balance(owner)
            .await
            .map_err(|e| GatewayError::External(format!("native balance query failed: {e}")))
    }

    /// Looks up a previously submitted transaction's receipt, if mined yet.
    /// Used by the Payout Engine to poll confirmation depth the same way the
    /// Blockchain Monitor tracks inbound transfers (spec §4.5).
    pub async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceiptInfo>> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);
        let receipt = provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| GatewayError::External(format!("receipt query failed: {e}")))?;
        Ok(receipt.map(|r| TxReceiptInfo {
            block_number: r.block_number.unwrap_or_default(),
            success: r.status(),
        }))
    }

    /// Current chain tip, used alongside `transaction_receipt` to compute
    /// confirmation depth for a submitted payout.
    pub async fn current_block_number(&self) -> Result<u64> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);
        provider
            .get_block_number()
            .await
            .map_err(|e| GatewayError::External(format!("block number query failed: {e}")))
    }
}

/// Mined status of a submitted transaction (spec §4.5 `getTxStatus`).
pub struct TxReceiptInfo {
    pub block_number: u64,
    pub success: bool,
}
