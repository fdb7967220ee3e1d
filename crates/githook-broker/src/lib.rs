//! Broker layer: transports, the publisher cache, and the subscriber
//! factory.
//!
//! Publishers and subscribers are declared by [`DriverConfig`] parsed
//! from a stored driver record. The [`PublisherCache`] owns live
//! publishers keyed by `(tenant, driver_id)`; the [`SubscriberFactory`]
//! builds process-side consumers for the worker runtime.

pub mod cache;
pub mod config;
pub mod factory;
pub mod transport;

pub use cache::PublisherCache;
pub use config::{
    AmqpConfig, AmqpMode, ChannelConfig, DriverConfig, HttpConfig, KafkaConfig, NatsConfig,
    RiverConfig, SqlConfig, SqlDialect,
};
pub use factory::{MultiSubscriber, SubscriberFactory};
pub use transport::channel::ChannelHub;

use async_trait::async_trait;
use futures::future::BoxFuture;
use githook_core::{Message, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback invoked for every received message.
///
/// Returning `Err` signals nack; `Ok` signals ack. The callback blocks
/// the transport's delivery loop, which is how handler backpressure
/// reaches the broker (AMQP prefetch, Kafka pause, NATS pull limits).
pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Process-side handle for sending messages to one transport.
#[async_trait]
pub trait Publisher: Send + Sync + std::fmt::Debug {
    /// Publish `payload` to `topic`, blocking until the transport
    /// reports acceptance (not end-to-end delivery).
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &std::collections::HashMap<String, String>,
    ) -> Result<()>;

    /// Close the underlying connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Process-side handle for receiving messages from one transport.
#[async_trait]
pub trait Subscriber: Send + Sync + std::fmt::Debug {
    /// Consume `topic`, invoking `handler` per message until `ctx` is
    /// cancelled. Handler errors nack where the transport supports it.
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()>;

    /// Close the underlying connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Whether a driver supports redelivery on nack.
///
/// Only AMQP can requeue today; other transports ack and rely on the
/// event log keeping the `failed` state.
#[must_use]
pub fn supports_requeue(driver_name: &str) -> bool {
    driver_name == "amqp"
}
