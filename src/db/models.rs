#![allow(dead_code)]

//! Persistence shapes for the data model in spec §3. Status/type columns are
//! `TEXT` and are parsed through `domain::*` enums at the service boundary
//! rather than as native Postgres enums, so a service that dereferences a row
//! it didn't just validate always goes through `FromStr` again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Merchant {
    pub id: Uuid,
    pub business_name: String,
    pub contact_email: String,
    pub status: String,
    pub risk_level: String,
    pub daily_volume_cap: Option<Decimal>,
    pub monthly_volume_cap: Option<Decimal>,
    pub min_tx_amount: Option<Decimal>,
    pub max_tx_amount: Option<Decimal>,
    pub fee_percent: Decimal,
    pub fee_fixed: Decimal,
    pub settlement_address: Option<String>,
    pub ip_whitelist: Option<Vec<String>>,
    pub test_mode: bool,
    pub refund_overpay_by_default: bool,
    pub auto_settlement: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMerchant {
    pub business_name: String,
    pub contact_email: String,
    pub fee_percent: Decimal,
    pub fee_fixed: Decimal,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub public_key_id: String,
    pub hashed_secret: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
    pub ip_allow_list: Option<Vec<String>>,
    pub read_only: bool,
    pub permissions: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub merchant_id: Uuid,
    pub public_key_id: String,
    pub hashed_secret: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentAddress {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub address: String,
    pub address_type: String,
    pub encrypted_private_key: Option<String>,
    pub hd_derivation_path: Option<String>,
    pub hd_index: Option<i64>,
    pub status: String,
    pub expected_amount: Option<Decimal>,
    pub currency: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub monitored: bool,
    pub callback_url: Option<String>,
    pub external_reference: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentAddress {
    pub merchant_id: Uuid,
    pub address: String,
    pub address_type: String,
    pub encrypted_private_key: Option<String>,
    pub hd_derivation_path: Option<String>,
    pub hd_index: Option<i64>,
    pub expected_amount: Option<Decimal>,
    pub currency: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
    pub external_reference: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub address_id: Option<Uuid>,
    pub tx_hash: Option<String>,
    pub log_index: Option<i32>,
    pub status: String,
    pub transaction_type: String,
    pub amount: Decimal,
    pub fee_amount: Decimal,
    pub currency: String,
    pub network: String,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub confirmations: i32,
    pub block_number: Option<i64>,
    pub block_hash: Option<String>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub webhook_sent: bool,
    pub settlement_tx_hash: Option<String>,
    pub external_reference: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub merchant_id: Uuid,
    pub address_id: Option<Uuid>,
    pub tx_hash: Option<String>,
    pub log_index: Option<i32>,
    pub status: String,
    pub transaction_type: String,
    pub amount: Decimal,
    pub fee_amount: Decimal,
    pub currency: String,
    pub network: String,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub external_reference: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub url: String,
    pub subscribed_events: Vec<String>,
    pub status: String,
    pub secret: Option<String>,
    pub failed_attempts: i32,
    pub last_failure_reason: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub max_retries: i32,
    pub base_retry_interval_secs: i32,
    pub send_payload: bool,
    /// Non-transactional delivery lease: set while a delivery attempt is in
    /// flight so a concurrent dispatcher tick skips this endpoint rather than
    /// sending twice (spec §5 ordering guarantee (b), without holding a DB
    /// transaction across the outbound HTTP call).
    pub delivery_lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub merchant_id: Uuid,
    pub url: String,
    pub subscribed_events: Vec<String>,
    pub secret: Option<String>,
    pub max_retries: i32,
    pub base_retry_interval_secs: i32,
}

/// A queued delivery attempt, one row per (webhook, event, attempt cycle).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub webhook_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub id: Uuid,
    pub client_key: String,
    pub method: String,
    pub path: String,
    pub request_fingerprint: String,
    pub response_body: Option<serde_json::Value>,
    pub response_status: Option<i32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIdempotencyKey {
    pub client_key: String,
    pub method: String,
    pub path: String,
    pub request_fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub prior_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub actor_id: Option<Uuid>,
    pub merchant_id: Option<Uuid>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub prior_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub actor_id: Option<Uuid>,
    pub merchant_id: Option<Uuid>,
    pub description: Option<String>,
}

/// Tracks the last processed BSC block (per chain id) for the monitor's
/// recovery-path polling cursor (spec §4.2).
#[derive(Debug, Clone, FromRow)]
pub struct ChainCursor {
    pub chain_id: i64,
    pub last_processed_block: i64,
    pub updated_at: DateTime<Utc>,
}

/// Counter used by `AddressManager` to derive the next unused HD index for a
/// merchant (spec §4.1 `CapacityExhausted`).
#[derive(Debug, Clone, FromRow)]
pub struct HdIndexCounter {
    pub merchant_id: Uuid,
    pub next_index: i64,
}
