use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::mpsc;

use usdt_gateway::config::Config;
use usdt_gateway::payout::backend::{CustodialPayoutBackend, OnChainPayoutBackend, PayoutBackend};
use usdt_gateway::queue::QueueBus;
use usdt_gateway::{
    address_manager, chain, db, errors, idempotency, monitor, payout, queue, refund, secrets, settlement,
    state_machine, webhook,
};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("starting usdt gateway");

    let config = Config::load()?;
    tracing::info!(chain_id = config.chain.chain_id, "configuration loaded");

    let db_pool = db::create_pool(&config.database.url).await?;
    tracing::info!("database connected");
    db::run_migrations(&db_pool).await?;
    tracing::info!("database migrations complete");

    let queue = Arc::new(QueueBus::connect(&config.queue.rabbitmq_url).await?);
    tracing::info!("queue bus connected");

    let secrets = Arc::new(secrets::SecretRegistry::new(
        config.hd_wallet.mnemonic.clone(),
        config.hd_wallet.path_template.clone(),
        config.hd_wallet.encryption_key,
    ));

    let usdt_contract = Address::from_str(&config.chain.usdt_contract_address)?;
    let chain_client = chain::ChainClient::new(config.chain.rpc_url.clone(), usdt_contract);

    let webhook_publisher = Arc::new(webhook::WebhookPublisher::new(queue.clone()));
    let webhook_dispatcher =
        Arc::new(webhook::WebhookDispatcher::new(db_pool.clone(), config.webhook.default_secret.clone()));

    let address_manager = Arc::new(address_manager::AddressManager::new(
        db_pool.clone(),
        secrets.clone(),
        webhook_publisher.clone(),
    ));

    let state_machine = Arc::new(state_machine::StateMachine::new(
        db_pool.clone(),
        queue.clone(),
        webhook_publisher.clone(),
        config.chain.required_confirmations,
    ));

    let settlement_engine = Arc::new(settlement::SettlementEngine::new(
        db_pool.clone(),
        queue.clone(),
        webhook_publisher.clone(),
        state_machine.clone(),
        secrets.clone(),
        chain_client.clone(),
        config.wallets.clone(),
    ));

    let refund_engine = Arc::new(refund::RefundEngine::new(
        db_pool.clone(),
        webhook_publisher.clone(),
        secrets.clone(),
        chain_client.clone(),
    ));

    let payout_backend: Arc<dyn PayoutBackend> = match &config.custodial {
        Some(custodial) => Arc::new(CustodialPayoutBackend::new(custodial.clone())),
        None => {
            let hot_wallet_key = db::addresses::get_hot_wallet(&db_pool)
                .await?
                .and_then(|a| a.encrypted_private_key)
                .ok_or_else(|| eyre::eyre!("no hot wallet provisioned and no custodial backend configured"))?;
            let backend_secrets = secrets::SecretRegistry::new(
                config.hd_wallet.mnemonic.clone(),
                config.hd_wallet.path_template.clone(),
                config.hd_wallet.encryption_key,
            );
            Arc::new(OnChainPayoutBackend::new(
                chain_client.clone(),
                backend_secrets,
                hot_wallet_key,
                config.chain.required_confirmations,
            ))
        }
    };
    let payout_engine = Arc::new(payout::PayoutEngine::new(
        db_pool.clone(),
        queue.clone(),
        webhook_publisher.clone(),
        payout_backend,
    ));

    let monitor_manager = Arc::new(monitor::MonitorManager::new(
        &config.chain,
        db_pool.clone(),
        queue.clone(),
        address_manager.clone(),
    )?);

    let mut shutdown_txs: Vec<mpsc::Sender<()>> = Vec::new();
    let mut tasks: tokio::task::JoinSet<errors::Result<()>> = tokio::task::JoinSet::new();

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let state_machine = state_machine.clone();
        move |rx| async move {
            queue
                .consume(queue::TRANSACTION_DETECT, rx, move |event: state_machine::DetectionEvent| {
                    let state_machine = state_machine.clone();
                    async move { state_machine.on_detect(event).await.map(|_| ()) }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let state_machine = state_machine.clone();
        move |rx| async move {
            queue
                .consume(queue::TRANSACTION_MONITOR, rx, move |job: state_machine::ConfirmationTickJob| {
                    let state_machine = state_machine.clone();
                    async move { state_machine.on_confirmation_tick(job.transaction_id).await }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let settlement_engine = settlement_engine.clone();
        move |rx| async move {
            queue
                .consume(queue::SETTLEMENT_SCHEDULE, rx, move |job: state_machine::SettlementScheduleJob| {
                    let settlement_engine = settlement_engine.clone();
                    async move { settlement_engine.on_schedule_job(job).await }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let settlement_engine = settlement_engine.clone();
        move |rx| async move {
            queue
                .consume(queue::SETTLEMENT_EXECUTE, rx, move |job: settlement::SettlementExecuteJob| {
                    let settlement_engine = settlement_engine.clone();
                    async move { settlement_engine.execute(job).await }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let payout_engine = payout_engine.clone();
        move |rx| async move {
            queue
                .consume(queue::PAYOUT_EXECUTE, rx, move |job: payout::PayoutExecuteJob| {
                    let payout_engine = payout_engine.clone();
                    async move { payout_engine.execute(job).await }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let refund_engine = refund_engine.clone();
        move |rx| async move {
            queue
                .consume(queue::REFUND_PROCESS, rx, move |job: state_machine::RefundJob| {
                    let refund_engine = refund_engine.clone();
                    async move { refund_engine.process(job).await }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let webhook_dispatcher = webhook_dispatcher.clone();
        move |rx| async move {
            queue
                .consume(queue::WEBHOOK_SEND, rx, move |job: webhook::WebhookSendJob| {
                    let webhook_dispatcher = webhook_dispatcher.clone();
                    async move { webhook_dispatcher.handle_send_job(job).await }
                })
                .await
        }
    });

    spawn_consumer(&mut tasks, &mut shutdown_txs, {
        let queue = queue.clone();
        let settlement_engine = settlement_engine.clone();
        let pool = db_pool.clone();
        move |rx| async move {
            queue
                .consume(queue::COLDSTORAGE_TRANSFER, rx, move |_job: settlement::ColdStorageTransferJob| {
                    let settlement_engine = settlement_engine.clone();
                    let pool = pool.clone();
                    async move {
                        let hot_wallet_key = db::addresses::get_hot_wallet(&pool)
                            .await?
                            .and_then(|a| a.encrypted_private_key)
                            .ok_or_else(|| errors::GatewayError::Internal("no hot wallet provisioned".into()))?;
                        settlement_engine.transfer_to_cold_storage(&hot_wallet_key).await
                    }
                })
                .await
        }
    });

    let (monitor_shutdown_tx, monitor_shutdown_rx) = mpsc::channel::<()>(1);
    shutdown_txs.push(monitor_shutdown_tx);
    tasks.spawn({
        let monitor_manager = monitor_manager.clone();
        async move { monitor_manager.run(monitor_shutdown_rx).await }
    });

    let (sweep_shutdown_tx, mut sweep_shutdown_rx) = mpsc::channel::<()>(1);
    shutdown_txs.push(sweep_shutdown_tx);
    tasks.spawn({
        let pool = db_pool.clone();
        let queue = queue.clone();
        let address_manager = address_manager.clone();
        let settlement_engine = settlement_engine.clone();
        let payout_engine = payout_engine.clone();
        let webhook_dispatcher = webhook_dispatcher.clone();
        async move {
            loop {
                tokio::select! {
                    _ = sweep_shutdown_rx.recv() => {
                        tracing::info!("periodic sweeper shutting down");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        if let Err(e) = address_manager.sweep_expired().await {
                            tracing::warn!(error = %e, "address expiry sweep failed");
                        }
                        if let Err(e) = settlement_engine.schedule_settlements().await {
                            tracing::warn!(error = %e, "settlement scheduling sweep failed");
                        }
                        if let Err(e) = queue.publish(queue::COLDSTORAGE_TRANSFER, &settlement::ColdStorageTransferJob).await {
                            tracing::warn!(error = %e, "cold storage rebalance trigger failed");
                        }
                        if let Err(e) = payout_engine.poll_confirmations().await {
                            tracing::warn!(error = %e, "payout confirmation poll failed");
                        }
                        if let Err(e) = idempotency::sweep_expired(&pool).await {
                            tracing::warn!(error = %e, "idempotency key sweep failed");
                        }
                        if let Err(e) = run_webhook_delivery_sweep(&pool, &webhook_dispatcher).await {
                            tracing::warn!(error = %e, "webhook delivery sweep failed");
                        }
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        for tx in shutdown_txs {
            let _ = tx.send(()).await;
        }
    });

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "background task returned an error"),
            Err(e) => tracing::error!(error = %e, "background task panicked"),
        }
    }

    tracing::info!("usdt gateway stopped");
    Ok(())
}

/// One tick of the webhook delivery sweep: visits every endpoint and lets the
/// dispatcher claim its lease, so a crashed process never leaves an endpoint
/// permanently stuck (spec §4.6: a stale lease is reclaimable).
async fn run_webhook_delivery_sweep(
    pool: &sqlx::PgPool,
    dispatcher: &webhook::WebhookDispatcher,
) -> errors::Result<()> {
    let endpoints = db::webhooks::list_all(pool).await?;
    for endpoint in endpoints {
        if let Err(e) = dispatcher.sweep_due_deliveries(&endpoint).await {
            tracing::warn!(webhook_id = %endpoint.id, error = %e, "webhook sweep tick failed for endpoint");
        }
    }
    Ok(())
}

/// Spawns a queue consumer with its own shutdown channel, registering the
/// sender so the top-level signal handler fans a single shutdown out across
/// every long-lived task (spec §5: "a small number of long-lived tasks, not
/// one task per request").
fn spawn_consumer<F, Fut>(
    tasks: &mut tokio::task::JoinSet<errors::Result<()>>,
    shutdown_txs: &mut Vec<mpsc::Sender<()>>,
    make_future: F,
) where
    F: FnOnce(mpsc::Receiver<()>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = errors::Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<()>(1);
    shutdown_txs.push(tx);
    tasks.spawn(make_future(rx));
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,usdt_gateway=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
