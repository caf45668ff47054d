//! Closed-set enumerations and value types from the data model (spec §3).
//!
//! Unknown values are rejected at ingress: every enum here round-trips through
//! `sqlx` as `TEXT` via `#[sqlx(type_name = "text", rename_all = "UPPERCASE")]`-style
//! `Display`/`FromStr` pairs rather than native Postgres enums, matching the
//! teacher's string-status columns (`db::models` stores `status: String` and the
//! service layer is the one place that interprets it).

pub mod money;

use std::fmt;
use std::str::FromStr;

use crate::errors::GatewayError;

macro_rules! closed_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $($name::$variant => $s),+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $name {
            type Err = GatewayError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant)),+,
                    other => Err(GatewayError::Validation(format!(
                        concat!("unknown ", stringify!($name), " value: {}"),
                        other
                    ))),
                }
            }
        }
    };
}

closed_enum!(MerchantStatus { Pending => "PENDING", Active => "ACTIVE", Suspended => "SUSPENDED" });
closed_enum!(RiskLevel { Low => "LOW", Medium => "MEDIUM", High => "HIGH" });

closed_enum!(ApiKeyStatus { Active => "ACTIVE", Revoked => "REVOKED", Expired => "EXPIRED" });

closed_enum!(AddressType {
    MerchantPayment => "MERCHANT_PAYMENT",
    HotWallet => "HOT_WALLET",
    ColdWallet => "COLD_WALLET",
    Settlement => "SETTLEMENT",
});

closed_enum!(AddressStatus { Active => "ACTIVE", Expired => "EXPIRED", Used => "USED", Blacklisted => "BLACKLISTED" });

closed_enum!(TransactionType { Payment => "PAYMENT", Payout => "PAYOUT", Refund => "REFUND", Settlement => "SETTLEMENT", Fee => "FEE", Transfer => "TRANSFER" });

closed_enum!(TransactionStatus {
    Pending => "PENDING",
    Confirming => "CONFIRMING",
    Confirmed => "CONFIRMED",
    Failed => "FAILED",
    Expired => "EXPIRED",
    Settled => "SETTLED",
    Completed => "COMPLETED",
    Underpaid => "UNDERPAID",
});

closed_enum!(WebhookStatus { Active => "ACTIVE", Inactive => "INACTIVE", Failed => "FAILED" });

/// Closed set of webhook event names (spec §4.6).
///
/// The source ambiguously fires both `payment.confirmed` and `payment.completed`
/// for the same transition in different handlers (spec §9 Open Questions). This
/// implementation resolves it: `PAYMENT_CONFIRMED` is the canonical event emitted
/// by `OnConfirmationTick`; `PAYMENT_COMPLETED` is reserved for the terminal
/// `OnAcknowledged` transition and is never emitted as an alias of the former.
closed_enum!(EventName {
    PaymentReceived => "payment.received",
    PaymentConfirmed => "payment.confirmed",
    PaymentCompleted => "payment.completed",
    PaymentFailed => "payment.failed",
    PaymentUnderpaid => "payment.underpaid",
    AddressCreated => "address.created",
    AddressExpired => "address.expired",
    SettlementCompleted => "settlement.completed",
    TransactionSettled => "transaction.settled",
    RefundInitiated => "refund.initiated",
    RefundCompleted => "refund.completed",
    RefundFailed => "refund.failed",
    PayoutInitiated => "payout.initiated",
    PayoutProcessing => "payout.processing",
    PayoutCompleted => "payout.completed",
    PayoutFailed => "payout.failed",
});

impl TransactionStatus {
    /// §4.3 invariant: no edge leaves a terminal status backward.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Expired
                | TransactionStatus::Failed
        )
    }

    /// Whether `self -> next` is an allowed edge in the state DAG (spec §4.3).
    pub fn can_advance_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Confirming) => true,
            (Pending, Expired) => true,
            (Pending, Failed) => true,
            (Confirming, Confirmed) => true,
            (Confirming, Underpaid) => true,
            (Confirming, Failed) => true,
            (Confirming, Completed) => true, // PAYOUT/REFUND transactions skip settlement
            (Confirmed, Settled) => true,
            (Confirmed, Confirmed) => true, // idempotent re-application
            (Settled, Completed) => true,
            (same, other) if same == other => true, // repeated tick, no-op
            _ => false,
        }
    }
}
