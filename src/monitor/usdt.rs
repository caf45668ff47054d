//! USDT (BEP-20) `Transfer` event ABI and filter construction (spec §4.2).

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    /// Standard ERC-20 Transfer event (BEP-20 is ERC-20-compatible).
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Builds the log filter for inbound transfers to any of `watched` addresses
/// on the USDT contract, across `[from_block, to_block]`.
pub fn transfer_filter(usdt_contract: Address, watched: &[Address], from_block: u64, to_block: u64) -> Filter {
    let to_topics: Vec<B256> = watched.iter().map(|a| B256::left_padding_from(a.as_slice())).collect();
    Filter::new()
        .address(usdt_contract)
        .event_signature(Transfer::SIGNATURE_HASH)
        .topic2(to_topics)
        .from_block(from_block)
        .to_block(to_block)
}

/// A decoded inbound transfer, still in raw on-chain units.
pub struct DecodedTransfer {
    pub from: Address,
    pub to: Address,
    pub raw_value: U256,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
}

pub fn decode_transfer(log: &Log) -> Option<DecodedTransfer> {
    let decoded = log.log_decode::<Transfer>().ok()?;
    let tx_hash = log.transaction_hash?;
    let block_number = log.block_number?;
    let block_hash = log.block_hash?;
    let log_index = log.log_index?;
    Some(DecodedTransfer {
        from: decoded.inner.from,
        to: decoded.inner.to,
        raw_value: decoded.inner.value,
        tx_hash,
        log_index,
        block_number,
        block_hash,
    })
}
