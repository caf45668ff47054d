//! Queue Bus (spec §4.7): named durable queues over RabbitMQ with
//! at-least-once publish and single-consumer-per-message semantics.

use std::time::Duration;

use deadpool_lapin::{Config as PoolConfig, Pool, Runtime};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::errors::{GatewayError, Result};

/// The closed set of queues required by spec §4.7.
pub const TRANSACTION_DETECT: &str = "transaction.detect";
pub const TRANSACTION_MONITOR: &str = "transaction.monitor";
pub const SETTLEMENT_SCHEDULE: &str = "settlement.schedule";
pub const SETTLEMENT_EXECUTE: &str = "settlement.execute";
pub const COLDSTORAGE_TRANSFER: &str = "coldstorage.transfer";
pub const PAYOUT_EXECUTE: &str = "payout.execute";
pub const REFUND_PROCESS: &str = "refund.process";
pub const WEBHOOK_SEND: &str = "webhook.send";

pub const ALL_QUEUES: &[&str] = &[
    TRANSACTION_DETECT,
    TRANSACTION_MONITOR,
    SETTLEMENT_SCHEDULE,
    SETTLEMENT_EXECUTE,
    COLDSTORAGE_TRANSFER,
    PAYOUT_EXECUTE,
    REFUND_PROCESS,
    WEBHOOK_SEND,
];

/// Thin wrapper over a pooled AMQP connection. Every handler the gateway
/// registers is expected to be idempotent on the message's business key
/// (spec §4.7), so a redelivered message is always safe to reprocess.
#[derive(Clone)]
pub struct QueueBus {
    pool: Pool,
}

impl QueueBus {
    pub async fn connect(amqp_url: &str) -> Result<Self> {
        let mut cfg = PoolConfig::default();
        cfg.url = Some(amqp_url.to_string());
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| GatewayError::External(format!("failed to build AMQP pool: {e}")))?;

        let bus = Self { pool };
        bus.declare_all_queues().await?;
        Ok(bus)
    }

    async fn declare_all_queues(&self) -> Result<()> {
        let conn = self.pool.get().await.map_err(pool_err)?;
        let channel = conn.create_channel().await?;
        for queue in ALL_QUEUES {
            channel
                .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
                .await?;
        }
        info!(queues = ALL_QUEUES.len(), "queue bus initialized");
        Ok(())
    }

    /// Publishes `payload` to `queue`, durable and persistent. At-least-once:
    /// callers never assume this is the only copy a consumer will see.
    pub async fn publish<T: Serialize>(&self, queue: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| GatewayError::Internal(format!("job payload serialization failed: {e}")))?;

        let conn = self.pool.get().await.map_err(pool_err)?;
        let channel = conn.create_channel().await?;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2), // persistent
            )
            .await?
            .await?;
        Ok(())
    }

    /// Runs `handler` against every delivery on `queue` until `shutdown` fires.
    /// A handler returning an `External` error nacks with requeue (broker
    /// redelivers); any other error nacks without requeue and the caller is
    /// expected to have already recorded the terminal failure.
    pub async fn consume<T, F, Fut>(
        &self,
        queue: &'static str,
        mut shutdown: tokio::sync::mpsc::Receiver<()>,
        handler: F,
    ) -> Result<()>
    where
        T: DeserializeOwned,
        F: Fn(T) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let conn = self.pool.get().await.map_err(pool_err)?;
        let channel = conn.create_channel().await?;
        let consumer_tag = format!("gateway-{queue}");
        let mut consumer = channel
            .basic_consume(queue, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(queue, "queue consumer shutting down");
                    return Ok(());
                }
                delivery = futures::StreamExt::next(&mut consumer) => {
                    let Some(delivery) = delivery else { return Ok(()) };
                    let delivery = delivery.map_err(|e| GatewayError::External(format!("delivery error: {e}")))?;

                    let parsed: std::result::Result<T, _> = serde_json::from_slice(&delivery.data);
                    let outcome = match parsed {
                        Ok(job) => handler(job).await,
                        Err(e) => Err(GatewayError::Internal(format!("malformed job payload: {e}"))),
                    };

                    match outcome {
                        Ok(()) => {
                            delivery.ack(BasicAckOptions::default()).await?;
                        }
                        Err(err) if err.retryable() => {
                            warn!(queue, error = %err, "job failed, requeueing");
                            delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                        Err(err) => {
                            error!(queue, error = %err, "job failed terminally, not requeueing");
                            delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?;
                        }
                    }
                }
            }
        }
    }
}

fn pool_err(e: deadpool_lapin::PoolError) -> GatewayError {
    GatewayError::External(format!("AMQP pool error: {e}"))
}
