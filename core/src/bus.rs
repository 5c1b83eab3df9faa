//! Invalidation-bus subscription.
//!
//! The coordinator is a subscribe-only client of a topic exchange
//! (`infinitune.events`, durable) carrying `songs.<playlistId>` and
//! `playlists` notifications. Publication is someone else's problem; this
//! module only declares the exchange, binds a transient exclusive queue, and
//! hands decoded events to [`crate::sync_bridge::SyncBridge`].

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Topic exchange the coordinator subscribes to.
pub const EVENTS_EXCHANGE: &str = "infinitune.events";

/// Routing keys the sync bridge cares about; `settings` is bound but ignored.
pub const ROUTING_KEYS: [&str; 3] = ["songs.*", "playlists", "settings"];

/// A single decoded invalidation-bus notification.
///
/// Only the routing key is interpreted; the message body is opaque to this
/// service (external interfaces, invalidation bus).
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub routing_key: String,
}

/// Subscribe-only handle to the invalidation bus.
///
/// Implementations own their own reconnect policy internally is *not*
/// required — [`crate::sync_bridge::SyncBridge`] drives the exponential
/// backoff reconnect loop and calls [`InvalidationBus::connect`] again after
/// a [`InvalidationBus::next_event`] failure, per the concurrency model's
/// cancellation-and-timeouts rule.
#[async_trait]
pub trait InvalidationBus: Send {
    /// Waits for and returns the next event. Returns `Err` on any connection
    /// failure; the caller is expected to reconnect rather than retry reads.
    async fn next_event(&mut self) -> CoordinatorResult<InvalidationEvent>;
}

/// Factory used by the sync bridge to (re)establish a bus connection.
#[async_trait]
pub trait InvalidationBusConnector: Send + Sync {
    async fn connect(&self) -> CoordinatorResult<Box<dyn InvalidationBus>>;
}

/// RabbitMQ-backed [`InvalidationBus`] over AMQP 0-9-1 via `lapin`.
pub struct LapinInvalidationBus {
    consumer: lapin::Consumer,
    _connection: Connection,
}

/// Connects to `amqp_url`, declaring the durable topic exchange and binding
/// an exclusive transient queue to the routing keys this service consumes.
pub struct LapinConnector {
    amqp_url: String,
}

impl LapinConnector {
    pub fn new(amqp_url: impl Into<String>) -> Self {
        Self {
            amqp_url: amqp_url.into(),
        }
    }
}

#[async_trait]
impl InvalidationBusConnector for LapinConnector {
    async fn connect(&self) -> CoordinatorResult<Box<dyn InvalidationBus>> {
        let props = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(&self.amqp_url, props)
            .await
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;

        channel
            .exchange_declare(
                EVENTS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;

        for routing_key in ROUTING_KEYS {
            channel
                .queue_bind(
                    queue.name().as_str(),
                    EVENTS_EXCHANGE,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| CoordinatorError::Bus(e.to_string()))?;
        }

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "roomcast-sync-bridge",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;

        log::info!(
            "[SyncBridge] Connected to {}, bound queue {} to {:?}",
            EVENTS_EXCHANGE,
            queue.name(),
            ROUTING_KEYS
        );

        Ok(Box::new(LapinInvalidationBus {
            consumer,
            _connection: connection,
        }))
    }
}

#[async_trait]
impl InvalidationBus for LapinInvalidationBus {
    async fn next_event(&mut self) -> CoordinatorResult<InvalidationEvent> {
        let delivery = self
            .consumer
            .next()
            .await
            .ok_or_else(|| CoordinatorError::Bus("consumer stream closed".into()))?
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;

        let routing_key = delivery.routing_key.to_string();

        delivery
            .ack(lapin::options::BasicAckOptions::default())
            .await
            .map_err(|e| CoordinatorError::Bus(e.to_string()))?;

        Ok(InvalidationEvent { routing_key })
    }
}

/// Reconnect backoff schedule: 1s, 2s, 4s, 8s, 16s, capped at 30s, plus up to
/// 20% jitter so a fleet of instances reconnecting after a shared outage
/// doesn't retry in lockstep.
///
/// Mirrors the hand-rolled retry-delay table this codebase uses for
/// transient SOAP faults, generalized to an uncapped attempt count with a
/// ceiling instead of a fixed delay array.
pub fn reconnect_backoff(attempt: u32) -> std::time::Duration {
    let capped_attempt = attempt.min(5);
    let base_secs = (1u64 << capped_attempt).min(30);
    let jitter_ms = base_secs * 1000 / 5;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_ms)
    };
    std::time::Duration::from_millis(base_secs * 1000 + jitter)
}
