//! Address Manager (spec §4.1): HD derivation, issuance, expiry sweep,
//! monitoring registration.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::Value as Json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{NewPaymentAddress, PaymentAddress};
use crate::db::{addresses, audit, merchants};
use crate::domain::EventName;
use crate::errors::{GatewayError, Result};
use crate::secrets::SecretRegistry;
use crate::webhook::WebhookPublisher;

/// `expiresInSec` is clamped into this range before being honored (spec §8
/// Boundary behaviors).
const MIN_EXPIRES_IN_SECS: i64 = 300;
const MAX_EXPIRES_IN_SECS: i64 = 86_400;

/// Upper bound on the merchant's HD index space. A merchant that exhausts
/// this needs a new mnemonic namespace; this is deliberately conservative
/// compared to BIP-32's own 2^31 hardened-index ceiling.
const HD_INDEX_CAPACITY: i64 = 1_000_000;

/// Oldest-first batch size for `SweepExpired` (spec §4.1).
const SWEEP_BATCH_SIZE: i64 = 500;

pub struct IssueAddressParams {
    pub merchant_id: Uuid,
    pub currency: String,
    pub expected_amount: Decimal,
    pub expires_in_secs: i64,
    pub metadata: Option<Json>,
    pub callback_url: Option<String>,
    pub external_reference: Option<String>,
}

pub struct AddressManager {
    pool: PgPool,
    secrets: Arc<SecretRegistry>,
    webhooks: Arc<WebhookPublisher>,
}

impl AddressManager {
    pub fn new(pool: PgPool, secrets: Arc<SecretRegistry>, webhooks: Arc<WebhookPublisher>) -> Self {
        Self { pool, secrets, webhooks }
    }

    /// *Issue* — derives the next unused HD path for the merchant and
    /// persists a new ACTIVE address (spec §4.1).
    pub async fn issue(&self, params: IssueAddressParams) -> Result<PaymentAddress> {
        if params.expected_amount <= Decimal::ZERO {
            return Err(GatewayError::Validation("expected amount must be > 0".into()));
        }
        if !(MIN_EXPIRES_IN_SECS..=MAX_EXPIRES_IN_SECS).contains(&params.expires_in_secs) {
            return Err(GatewayError::Validation(format!(
                "expiresInSec must be within [{MIN_EXPIRES_IN_SECS}, {MAX_EXPIRES_IN_SECS}]"
            )));
        }
        if !merchants::is_active(&self.pool, params.merchant_id).await? {
            return Err(GatewayError::Conflict("merchant is not ACTIVE".into()));
        }
        if let Some(reference) = &params.external_reference {
            if addresses::active_exists_for_reference(&self.pool, params.merchant_id, reference)
                .await?
            {
                return Err(GatewayError::Conflict(format!(
                    "an ACTIVE address already exists for reference {reference}"
                )));
            }
        }

        let hd_index = addresses::next_hd_index(&self.pool, params.merchant_id, HD_INDEX_CAPACITY)
            .await
            .map_err(|e| match e {
                GatewayError::Conflict(msg) => GatewayError::Conflict(format!("CapacityExhausted: {msg}")),
                other => other,
            })?;

        let signer = self.secrets.derive(hd_index)?;
        let encrypted_private_key = self.secrets.encrypt_private_key(&signer)?;
        let hd_derivation_path = self.secrets.derivation_path(hd_index);
        let address = signer.address().to_string();

        let expires_at = Utc::now() + ChronoDuration::seconds(params.expires_in_secs);

        let new_address = NewPaymentAddress {
            merchant_id: params.merchant_id,
            address,
            address_type: "MERCHANT_PAYMENT".to_string(),
            encrypted_private_key: Some(encrypted_private_key),
            hd_derivation_path: Some(hd_derivation_path),
            hd_index: Some(hd_index),
            expected_amount: Some(params.expected_amount),
            currency: params.currency,
            expires_at: Some(expires_at),
            callback_url: params.callback_url,
            external_reference: params.external_reference,
            metadata: params.metadata,
        };

        let saved = addresses::insert(&self.pool, &new_address).await?;

        info!(address_id = %saved.id, merchant_id = %saved.merchant_id, "address issued");
        audit::record(
            &self.pool,
            "ADDRESS_ISSUED",
            "PaymentAddress",
            saved.id,
            None,
            address_event_payload(&saved),
            Some(saved.merchant_id),
        )
        .await;
        self.webhooks
            .enqueue(saved.merchant_id, EventName::AddressCreated, address_event_payload(&saved))
            .await?;

        Ok(saved)
    }

    /// *Expire* — idempotent; marks EXPIRED and deregisters monitoring. Only
    /// the call that actually flips ACTIVE->EXPIRED fires the webhook, so two
    /// overlapping `SweepExpired` batches picking up the same row don't each
    /// emit `ADDRESS_EXPIRED`.
    pub async fn expire(&self, address_id: Uuid) -> Result<()> {
        let address = addresses::get(&self.pool, address_id).await?;
        let advanced = addresses::mark_expired(&self.pool, address_id).await?;
        if !advanced {
            return Ok(());
        }
        audit::record(
            &self.pool,
            "ADDRESS_EXPIRED",
            "PaymentAddress",
            address.id,
            Some(serde_json::json!({ "status": address.status.clone() })),
            serde_json::json!({ "status": "EXPIRED" }),
            Some(address.merchant_id),
        )
        .await;
        self.webhooks
            .enqueue(address.merchant_id, EventName::AddressExpired, address_event_payload(&address))
            .await?;
        Ok(())
    }

    /// *MarkUsed* — transitions ACTIVE→USED atomically; no-op if already USED.
    pub async fn mark_used(&self, address_id: Uuid) -> Result<()> {
        let address = addresses::get(&self.pool, address_id).await?;
        addresses::mark_used(&self.pool, address_id).await?;
        if address.status == "ACTIVE" {
            audit::record(
                &self.pool,
                "ADDRESS_USED",
                "PaymentAddress",
                address_id,
                Some(serde_json::json!({ "status": "ACTIVE" })),
                serde_json::json!({ "status": "USED" }),
                Some(address.merchant_id),
            )
            .await;
        }
        Ok(())
    }

    /// *SweepExpired* — periodic task: expires every ACTIVE address past its
    /// `expiresAt` with no inbound transactions, oldest-first, bounded batch.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let candidates = addresses::list_expirable(&self.pool, now, SWEEP_BATCH_SIZE).await?;
        let count = candidates.len();
        for address in candidates {
            if let Err(e) = self.expire(address.id).await {
                warn!(address_id = %address.id, error = %e, "failed to expire address during sweep");
            }
        }
        Ok(count)
    }

    /// Addresses the Blockchain Monitor should currently be watching.
    pub async fn list_monitored(&self) -> Result<Vec<PaymentAddress>> {
        addresses::list_monitored(&self.pool).await
    }
}

fn address_event_payload(address: &PaymentAddress) -> Json {
    serde_json::json!({
        "address": {
            "id": address.id,
            "address": address.address,
            "status": address.status,
            "currency": address.currency,
            "expectedAmount": address.expected_amount,
            "expiresAt": address.expires_at,
        }
    })
}
