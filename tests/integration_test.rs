//! Integration tests for the USDT payment gateway core.
//!
//! Run with: cargo test --test integration_test -- --nocapture
//!
//! Prerequisites for the `#[ignore]`d tests:
//! - Postgres running and reachable at DATABASE_URL, with migrations applied
//! - RabbitMQ running and reachable at RABBITMQ_URL
//!
//! The unignored tests exercise pure domain logic and need no infrastructure.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use usdt_gateway::address_manager::{AddressManager, IssueAddressParams};
use usdt_gateway::db::models::{NewMerchant, NewWebhook};
use usdt_gateway::db::{merchants, webhooks};
use usdt_gateway::domain::{EventName, TransactionStatus};
use usdt_gateway::idempotency;
use usdt_gateway::queue::QueueBus;
use usdt_gateway::secrets::SecretRegistry;
use usdt_gateway::settlement::SettlementEngine;
use usdt_gateway::state_machine::{DetectionEvent, StateMachine};
use usdt_gateway::webhook::WebhookPublisher;

mod helpers {
    use std::time::Duration;

    /// Test configuration loaded from environment variables.
    pub struct TestConfig {
        pub database_url: String,
        pub rabbitmq_url: String,
    }

    impl TestConfig {
        pub fn from_env() -> Option<Self> {
            Some(TestConfig {
                database_url: std::env::var("DATABASE_URL").ok()?,
                rabbitmq_url: std::env::var("RABBITMQ_URL").ok()?,
            })
        }
    }

    /// Check Postgres connectivity.
    pub async fn check_database_connectivity(database_url: &str) -> bool {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .is_ok()
    }
}

const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

fn test_secrets() -> SecretRegistry {
    SecretRegistry::new(TEST_MNEMONIC.to_string(), "m/44'/60'/0'/0/{index}".to_string(), [11u8; 32])
}

async fn new_active_merchant(pool: &sqlx::PgPool, suffix: &str) -> Uuid {
    let merchant = merchants::insert(
        pool,
        &NewMerchant {
            business_name: format!("Test Merchant {suffix}"),
            contact_email: format!("merchant-{suffix}@example.test"),
            fee_percent: dec!(1.5),
            fee_fixed: dec!(0.10),
        },
    )
    .await
    .expect("merchant insert");

    sqlx::query("UPDATE merchants SET status = 'ACTIVE' WHERE id = $1")
        .bind(merchant.id)
        .execute(pool)
        .await
        .expect("activate merchant");

    merchant.id
}

// ============================================================================
// Environment tests (require running infrastructure)
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_environment_setup() {
    let config = helpers::TestConfig::from_env();
    assert!(
        config.is_some(),
        "Test configuration not found. Set DATABASE_URL and RABBITMQ_URL"
    );
    let config = config.unwrap();

    assert!(
        helpers::check_database_connectivity(&config.database_url).await,
        "Failed to connect to Postgres at {}",
        config.database_url
    );
    println!("Database OK");

    let bus = QueueBus::connect(&config.rabbitmq_url).await;
    assert!(bus.is_ok(), "Failed to connect to RabbitMQ at {}", config.rabbitmq_url);
    println!("Queue bus OK");
}

/// Walks a payment from address issuance through detection and confirmation,
/// asserting the transaction lands CONFIRMED and a settlement job is
/// scheduled (spec §8 scenario 1: "deposit exactly the expected amount").
#[tokio::test]
#[ignore]
async fn test_payment_detection_and_confirmation_flow() {
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL and RABBITMQ_URL required");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("connect to database");

    let queue = std::sync::Arc::new(QueueBus::connect(&config.rabbitmq_url).await.expect("connect to queue"));
    let secrets = std::sync::Arc::new(test_secrets());
    let webhook_publisher = std::sync::Arc::new(WebhookPublisher::new(queue.clone()));

    let merchant_id = new_active_merchant(&pool, "detect-confirm").await;

    let address_manager = AddressManager::new(pool.clone(), secrets.clone(), webhook_publisher.clone());
    let address = address_manager
        .issue(IssueAddressParams {
            merchant_id,
            currency: "USDT".to_string(),
            expected_amount: dec!(100),
            expires_in_secs: 3600,
            metadata: None,
            callback_url: None,
            external_reference: None,
        })
        .await
        .expect("issue address");

    let state_machine = StateMachine::new(pool.clone(), queue.clone(), webhook_publisher.clone(), 2);

    let tx = state_machine
        .on_detect(DetectionEvent {
            address: address.address.clone(),
            address_id: address.id,
            merchant_id,
            tx_hash: format!("0x{:064x}", rand::random::<u128>()),
            log_index: 0,
            from_address: "0x000000000000000000000000000000000000aa".to_string(),
            amount: dec!(100),
            block_number: 1,
            block_hash: format!("0x{:064x}", rand::random::<u128>()),
            block_timestamp: Utc::now(),
            raw_confirmations: 0,
        })
        .await
        .expect("on_detect");

    assert_eq!(tx.status, TransactionStatus::Confirming.to_string());

    // A detection event below the required confirmation count doesn't advance.
    state_machine.on_confirmation_tick(tx.id).await.expect("tick below threshold");
    let still_confirming = usdt_gateway::db::transactions::get(&pool, tx.id).await.expect("reload");
    assert_eq!(still_confirming.status, TransactionStatus::Confirming.to_string());

    // Bring it up to the required confirmation depth, then tick again.
    sqlx::query("UPDATE transactions SET confirmations = 2 WHERE id = $1")
        .bind(tx.id)
        .execute(&pool)
        .await
        .expect("bump confirmations");
    state_machine.on_confirmation_tick(tx.id).await.expect("tick at threshold");

    let confirmed = usdt_gateway::db::transactions::get(&pool, tx.id).await.expect("reload");
    assert_eq!(confirmed.status, TransactionStatus::Confirmed.to_string());

    let settlement_engine = SettlementEngine::new(
        pool.clone(),
        queue.clone(),
        webhook_publisher.clone(),
        std::sync::Arc::new(state_machine),
        secrets.clone(),
        usdt_gateway::chain::ChainClient::new(
            "http://localhost:8545".to_string(),
            alloy::primitives::Address::ZERO,
        ),
        usdt_gateway::config::WalletConfig {
            cold_wallet_address: "0x000000000000000000000000000000000000bb".to_string(),
            hot_wallet_threshold: dec!(1000),
            hot_wallet_target_reserve: dec!(100),
        },
    );
    settlement_engine.schedule_settlements().await.expect("schedule settlements");
}

/// A second `OnDetect` for the same `tx_hash` must not create a second
/// transaction row (spec §8 invariant 2: single-flight on tx_hash).
#[tokio::test]
#[ignore]
async fn test_duplicate_detection_is_single_flight() {
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL and RABBITMQ_URL required");
    let pool = PgPoolOptions::new().max_connections(5).connect(&config.database_url).await.expect("connect");
    let queue = std::sync::Arc::new(QueueBus::connect(&config.rabbitmq_url).await.expect("connect to queue"));
    let secrets = std::sync::Arc::new(test_secrets());
    let webhook_publisher = std::sync::Arc::new(WebhookPublisher::new(queue.clone()));

    let merchant_id = new_active_merchant(&pool, "dup-detect").await;
    let address_manager = AddressManager::new(pool.clone(), secrets.clone(), webhook_publisher.clone());
    let address = address_manager
        .issue(IssueAddressParams {
            merchant_id,
            currency: "USDT".to_string(),
            expected_amount: dec!(50),
            expires_in_secs: 3600,
            metadata: None,
            callback_url: None,
            external_reference: None,
        })
        .await
        .expect("issue address");

    let state_machine = StateMachine::new(pool.clone(), queue.clone(), webhook_publisher.clone(), 2);
    let tx_hash = format!("0x{:064x}", rand::random::<u128>());

    let event = DetectionEvent {
        address: address.address.clone(),
        address_id: address.id,
        merchant_id,
        tx_hash: tx_hash.clone(),
        log_index: 0,
        from_address: "0x000000000000000000000000000000000000aa".to_string(),
        amount: dec!(50),
        block_number: 1,
        block_hash: format!("0x{:064x}", rand::random::<u128>()),
        block_timestamp: Utc::now(),
        raw_confirmations: 1,
    };

    let first = state_machine.on_detect(event.clone()).await.expect("first detect");
    let second = state_machine.on_detect(event).await.expect("redelivered detect");
    assert_eq!(first.id, second.id, "redelivery must resolve to the same transaction");
}

/// A retried idempotency key with an identical body replays the first
/// response rather than re-running the handler (spec §4.8).
#[tokio::test]
#[ignore]
async fn test_idempotency_replays_identical_retry() {
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL and RABBITMQ_URL required");
    let pool = PgPoolOptions::new().max_connections(5).connect(&config.database_url).await.expect("connect");

    let client_key = format!("test-key-{}", Uuid::new_v4());
    let body = serde_json::json!({ "amount": 10 });
    let fingerprint = idempotency::fingerprint(&body).unwrap();

    let run_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let call = |run_count: std::sync::Arc<std::sync::atomic::AtomicUsize>| async move {
        run_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok::<_, usdt_gateway::errors::GatewayError>((201u16, serde_json::json!({ "ok": true })))
    };

    let (status1, _) = idempotency::run(&pool, &client_key, "POST", "/test", &fingerprint, {
        let run_count = run_count.clone();
        || call(run_count)
    })
    .await
    .expect("first run");

    let (status2, _) = idempotency::run(&pool, &client_key, "POST", "/test", &fingerprint, {
        let run_count = run_count.clone();
        || call(run_count)
    })
    .await
    .expect("replayed run");

    assert_eq!(status1, status2);
    assert_eq!(run_count.load(std::sync::atomic::Ordering::SeqCst), 1, "handler must run exactly once");
}

/// Webhook delivery rows fan out to every ACTIVE subscriber of an event
/// (spec §4.6).
#[tokio::test]
#[ignore]
async fn test_webhook_fanout_creates_one_delivery_per_subscriber() {
    // Only Postgres is exercised here: WebhookDispatcher writes delivery rows
    // directly and the RabbitMQ-backed WebhookPublisher is a separate seam
    // (see test_payment_detection_and_confirmation_flow for that path).
    let config = helpers::TestConfig::from_env().expect("DATABASE_URL and RABBITMQ_URL required");
    let pool = PgPoolOptions::new().max_connections(5).connect(&config.database_url).await.expect("connect");

    let merchant_id = new_active_merchant(&pool, "webhook-fanout").await;

    for n in 0..2 {
        webhooks::insert(
            &pool,
            &NewWebhook {
                merchant_id,
                url: format!("https://example.test/hook-{n}"),
                subscribed_events: vec![EventName::PaymentReceived.to_string()],
                secret: Some("shh".to_string()),
                max_retries: 5,
                base_retry_interval_secs: 15,
            },
        )
        .await
        .expect("insert webhook endpoint");
    }

    let dispatcher = usdt_gateway::webhook::WebhookDispatcher::new(pool.clone(), "default-secret".to_string());
    dispatcher
        .handle_send_job(usdt_gateway::webhook::WebhookSendJob {
            merchant_id,
            event: EventName::PaymentReceived.to_string(),
            data: serde_json::json!({ "transactionId": Uuid::new_v4() }),
        })
        .await
        .expect("fan out send job");

    let endpoints = webhooks::list_all(&pool).await.expect("list webhooks");
    let ours: Vec<_> = endpoints.into_iter().filter(|w| w.merchant_id == merchant_id).collect();
    assert_eq!(ours.len(), 2);

    let mut total_deliveries = 0;
    for endpoint in &ours {
        let due = webhooks::list_due_for_webhook(&pool, endpoint.id, Utc::now(), 10).await.expect("list due");
        total_deliveries += due.len();
    }
    assert_eq!(total_deliveries, 2, "each subscriber gets exactly one delivery row");
}

// ============================================================================
// Pure domain logic tests (no infrastructure required)
// ============================================================================

#[test]
fn transaction_status_dag_rejects_backward_and_skipping_edges() {
    use TransactionStatus::*;

    assert!(Pending.can_advance_to(Confirming));
    assert!(Confirming.can_advance_to(Confirmed));
    assert!(Confirmed.can_advance_to(Settled));
    assert!(Settled.can_advance_to(Completed));

    // Terminal statuses never advance further.
    assert!(!Completed.can_advance_to(Confirming));
    assert!(!Failed.can_advance_to(Confirming));
    assert!(!Expired.can_advance_to(Confirming));

    // No skipping straight from PENDING to CONFIRMED.
    assert!(!Pending.can_advance_to(Confirmed));

    // Repeated tick to the same status is a no-op, not rejected.
    assert!(Confirmed.can_advance_to(Confirmed));
}

#[test]
fn amount_classification_matches_spec_tolerance() {
    use usdt_gateway::domain::money::{classify_amount, AmountClass};

    assert_eq!(classify_amount(dec!(100), dec!(100)), AmountClass::Exact);
    assert_eq!(classify_amount(dec!(100.000001), dec!(100)), AmountClass::Over);
    assert_eq!(classify_amount(dec!(99.5), dec!(100)), AmountClass::Under);
}

#[test]
fn event_name_round_trips_through_display_and_from_str() {
    use std::str::FromStr;

    for event in [
        EventName::PaymentReceived,
        EventName::PaymentConfirmed,
        EventName::PaymentCompleted,
        EventName::SettlementCompleted,
        EventName::RefundInitiated,
    ] {
        let s = event.to_string();
        let parsed = EventName::from_str(&s).expect("known event name parses");
        assert_eq!(parsed, event);
    }

    assert!(EventName::from_str("not.a.real.event").is_err());
}

#[test]
fn decimal_amounts_never_use_floating_point() {
    // USDT (BEP-20) carries 18 on-chain decimals; money must never round
    // through f64 (spec §3, §4.4 "Money" glossary entry).
    let a = Decimal::from_str_exact("0.000000000000000001").unwrap();
    let b = Decimal::from_str_exact("0.000000000000000001").unwrap();
    assert_eq!(a + b, Decimal::from_str_exact("0.000000000000000002").unwrap());
}
