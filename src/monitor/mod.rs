//! Blockchain Monitor (spec §4.2): watches the USDT contract for inbound
//! transfers to issued addresses and surfaces detections to the state
//! machine via the Queue Bus.

pub mod usdt;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::Address;
use alloy::providers::Provider;
use chrono::{TimeZone, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::address_manager::AddressManager;
use crate::bounded_cache::{BoundedHashCache, CacheConfig};
use crate::config::ChainConfig;
use crate::db::{cursor, transactions};
use crate::domain::money;
use crate::errors::{GatewayError, Result};
use crate::queue::{self, QueueBus};
use crate::state_machine::{ConfirmationTickJob, DetectionEvent};

/// USDT BEP-20 uses 18 fractional decimals on-chain.
const USDT_TOKEN_DECIMALS: u32 = 18;

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

pub struct MonitorManager {
    providers: Vec<alloy::providers::RootProvider<alloy::transports::http::Http<alloy::transports::http::Client>>>,
    usdt_contract: Address,
    chain_id: i64,
    reorg_rewind_blocks: u64,
    poll_interval: Duration,
    pool: sqlx::PgPool,
    queue: Arc<QueueBus>,
    address_manager: Arc<AddressManager>,
    dedup: Mutex<BoundedHashCache>,
    failure_streak: AtomicU32,
    /// Set once the first tick of this process has applied the reorg-rewind
    /// window to a persisted cursor (spec §4.2: "on restart, the monitor
    /// resumes from the last persisted cursor minus a small rewind window").
    /// Subsequent ticks advance normally from `last_processed_block + 1`.
    startup_rewound: AtomicBool,
}

impl MonitorManager {
    pub fn new(
        chain: &ChainConfig,
        pool: sqlx::PgPool,
        queue: Arc<QueueBus>,
        address_manager: Arc<AddressManager>,
    ) -> Result<Self> {
        let mut urls = vec![chain.rpc_url.clone()];
        urls.extend(chain.rpc_fallback_urls.clone());
        let providers = crate::rpc_fallback::create_providers(&urls)
            .map_err(|e| GatewayError::Internal(format!("failed to build chain providers: {e}")))?;

        let usdt_contract = Address::from_str(&chain.usdt_contract_address)
            .map_err(|e| GatewayError::Internal(format!("invalid USDT contract address: {e}")))?;

        let cache_config = CacheConfig::from_env();

        Ok(Self {
            providers,
            usdt_contract,
            chain_id: chain.chain_id as i64,
            reorg_rewind_blocks: chain.reorg_rewind_blocks,
            poll_interval: Duration::from_millis(chain.poll_interval_ms),
            pool,
            queue,
            address_manager,
            dedup: Mutex::new(BoundedHashCache::new(cache_config.detection_cache_size, cache_config.ttl_secs)),
            failure_streak: AtomicU32::new(0),
            startup_rewound: AtomicBool::new(false),
        })
    }

    /// Runs the detection poll loop and the confirmation re-check loop
    /// concurrently until `shutdown` fires (spec §5: these are two of the
    /// "small number of long-lived tasks").
    pub async fn run(&self, mut shutdown: tokio::sync::mpsc::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("blockchain monitor shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.poll_tick().await {
                        self.note_failure(&e).await;
                    } else {
                        self.failure_streak.store(0, Ordering::SeqCst);
                    }
                    if let Err(e) = self.track_confirmations().await {
                        warn!(error = %e, "confirmation tracking tick failed");
                    }
                }
            }
        }
    }

    async fn note_failure(&self, err: &GatewayError) {
        let attempt = self.failure_streak.fetch_add(1, Ordering::SeqCst);
        let backoff = backoff_for_attempt(attempt);
        error!(error = %err, backoff_secs = backoff.as_secs(), "monitor tick failed, backing off");
        tokio::time::sleep(backoff).await;
    }

    /// One detection sweep: push-vs-poll is collapsed here into a single
    /// `get_logs` pass over `[cursor+1, currentBlock]`; a WebSocket push
    /// subscription would feed the same `on_log` path in a fuller build.
    async fn poll_tick(&self) -> Result<()> {
        let watched = self.address_manager.list_monitored().await?;
        if watched.is_empty() {
            return Ok(());
        }

        let mut by_address: HashMap<String, uuid::Uuid> = HashMap::new();
        let mut watched_addrs = Vec::with_capacity(watched.len());
        for addr in &watched {
            if let Ok(parsed) = Address::from_str(&addr.address) {
                by_address.insert(parsed.to_string().to_lowercase(), addr.id);
                watched_addrs.push(parsed);
            }
        }

        let current_block = self.current_block_number().await?;
        let existing_cursor = cursor::get(&self.pool, self.chain_id).await?;

        // First tick after process start: rewind a persisted cursor by
        // `reorg_rewind_blocks` to absorb any reorg that happened while this
        // process was down (spec §4.2). A never-before-seen chain has no
        // persisted cursor to rewind, so it just starts from the rewind
        // window behind the current tip, same as today.
        let from_block = if !self.startup_rewound.swap(true, Ordering::SeqCst) {
            match existing_cursor {
                Some(c) => {
                    let rewound_to = (c.last_processed_block as u64).saturating_sub(self.reorg_rewind_blocks);
                    cursor::rewind(&self.pool, self.chain_id, rewound_to as i64).await?;
                    info!(
                        chain_id = self.chain_id,
                        from = rewound_to + 1,
                        "rewound chain cursor on startup to absorb reorgs"
                    );
                    rewound_to + 1
                }
                None => current_block.saturating_sub(self.reorg_rewind_blocks),
            }
        } else {
            existing_cursor
                .map(|c| (c.last_processed_block as u64) + 1)
                .unwrap_or_else(|| current_block.saturating_sub(self.reorg_rewind_blocks))
        };

        if from_block > current_block {
            return Ok(());
        }

        let filter = usdt::transfer_filter(self.usdt_contract, &watched_addrs, from_block, current_block);
        let logs = self.get_logs(&filter).await?;

        for log in &logs {
            let Some(decoded) = usdt::decode_transfer(log) else { continue };
            let to_key = decoded.to.to_string().to_lowercase();
            let Some(&address_id) = by_address.get(&to_key) else { continue };

            let dedup_key = dedup_hash(&decoded.tx_hash.0, decoded.log_index);
            {
                let mut cache = self.dedup.lock().await;
                if cache.contains_key(&dedup_key) {
                    continue;
                }
                cache.insert(dedup_key);
            }

            let address = watched.iter().find(|a| a.id == address_id).expect("looked up by id");
            let amount = money::from_raw_units(decoded.raw_value.to::<u128>(), USDT_TOKEN_DECIMALS);
            let block_timestamp = self.block_timestamp(decoded.block_number).await.unwrap_or_else(|_| Utc::now());

            let event = DetectionEvent {
                address: address.address.clone(),
                address_id,
                merchant_id: address.merchant_id,
                tx_hash: format!("{:#x}", decoded.tx_hash),
                log_index: decoded.log_index as i32,
                from_address: decoded.from.to_string(),
                amount,
                block_number: decoded.block_number as i64,
                block_hash: format!("{:#x}", decoded.block_hash),
                block_timestamp,
                raw_confirmations: current_block.saturating_sub(decoded.block_number) as i32,
            };

            self.queue.publish(queue::TRANSACTION_DETECT, &event).await?;
        }

        cursor::upsert(&self.pool, self.chain_id, current_block as i64).await?;
        Ok(())
    }

    /// Re-checks confirmation counts for every in-flight (CONFIRMING)
    /// transaction and nudges the state machine once counts change.
    async fn track_confirmations(&self) -> Result<()> {
        let current_block = self.current_block_number().await?;
        let pending = transactions::list_confirming(&self.pool).await?;

        for tx in pending {
            let Some(block_number) = tx.block_number else { continue };
            let confirmations = current_block.saturating_sub(block_number as u64) as i32;
            if confirmations == tx.confirmations {
                continue;
            }
            transactions::update_confirmation_progress(
                &self.pool,
                tx.id,
                confirmations,
                tx.block_number,
                tx.block_hash.as_deref(),
                tx.block_timestamp,
            )
            .await?;
            self.queue
                .publish(queue::TRANSACTION_MONITOR, &ConfirmationTickJob { transaction_id: tx.id })
                .await?;
        }
        Ok(())
    }

    async fn current_block_number(&self) -> Result<u64> {
        for provider in &self.providers {
            match provider.get_block_number().await {
                Ok(n) => return Ok(n),
                Err(e) => warn!(error = %e, "RPC provider failed, trying fallback"),
            }
        }
        Err(GatewayError::External("all RPC providers failed to return block number".into()))
    }

    async fn get_logs(&self, filter: &alloy::rpc::types::Filter) -> Result<Vec<alloy::rpc::types::Log>> {
        for provider in &self.providers {
            match provider.get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => warn!(error = %e, "RPC provider failed on get_logs, trying fallback"),
            }
        }
        Err(GatewayError::External("all RPC providers failed to fetch logs".into()))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<chrono::DateTime<Utc>> {
        for provider in &self.providers {
            if let Ok(Some(block)) =
                provider.get_block_by_number(BlockNumberOrTag::Number(block_number), false).await
            {
                let ts = block.header.timestamp as i64;
                return Ok(Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now));
            }
        }
        Err(GatewayError::External(format!("failed to fetch block {block_number} timestamp")))
    }
}

fn dedup_hash(tx_hash: &[u8; 32], log_index: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tx_hash);
    hasher.update(log_index.to_be_bytes());
    hasher.finalize().into()
}

/// Exponential backoff with jitter (base 1s, cap 60s — spec §4.2 Failure handling).
fn backoff_for_attempt(attempt: u32) -> Duration {
    let base = (BACKOFF_BASE_SECS as f64) * 2f64.powi(attempt.min(10) as i32);
    let capped = base.min(BACKOFF_CAP_SECS as f64);
    let jitter = rand::thread_rng().gen_range(0.0..capped * 0.25);
    Duration::from_secs_f64(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        assert!(backoff_for_attempt(0).as_secs_f64() < backoff_for_attempt(3).as_secs_f64());
        assert!(backoff_for_attempt(20).as_secs_f64() <= BACKOFF_CAP_SECS as f64 * 1.25);
    }

    #[test]
    fn dedup_hash_is_stable() {
        let a = dedup_hash(&[1u8; 32], 3);
        let b = dedup_hash(&[1u8; 32], 3);
        let c = dedup_hash(&[1u8; 32], 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
