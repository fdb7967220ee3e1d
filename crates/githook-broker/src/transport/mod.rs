//! Transport implementations.

pub mod amqp;
pub mod channel;
pub mod http;
pub mod kafka;
pub mod nats;
pub mod river;
pub mod sql;

use githook_core::Result;
use std::sync::Arc;

use crate::config::DriverConfig;
use crate::transport::channel::ChannelHub;
use crate::{Publisher, Subscriber};

/// Instantiate a publisher for `config`.
///
/// Connects eagerly; a broker that is down surfaces here rather than on
/// the first publish.
///
/// # Errors
///
/// [`githook_core::Error::Transport`] when the connection fails.
pub async fn build_publisher(
    config: &DriverConfig,
    hub: &Arc<ChannelHub>,
) -> Result<Arc<dyn Publisher>> {
    Ok(match config {
        DriverConfig::Amqp(c) => Arc::new(amqp::AmqpPublisher::connect(c.clone()).await?),
        DriverConfig::Nats(c) => Arc::new(nats::NatsPublisher::connect(c.clone()).await?),
        DriverConfig::Kafka(c) => Arc::new(kafka::KafkaPublisher::connect(c.clone())?),
        DriverConfig::Sql(c) => Arc::new(sql::SqlQueue::connect(c.clone()).await?),
        DriverConfig::River(c) => Arc::new(river::RiverPublisher::connect(c.clone()).await?),
        DriverConfig::Channel(c) => Arc::new(channel::ChannelPublisher::new(hub.clone(), c.buffer)),
        DriverConfig::Http(c) => Arc::new(http::HttpPublisher::new(c.clone())),
    })
}

/// Instantiate a subscriber for `config`.
///
/// # Errors
///
/// [`githook_core::Error::InvalidConfig`] for publisher-only drivers,
/// [`githook_core::Error::Transport`] when the connection fails.
pub async fn build_subscriber(
    config: &DriverConfig,
    hub: &Arc<ChannelHub>,
) -> Result<Arc<dyn Subscriber>> {
    Ok(match config {
        DriverConfig::Amqp(c) => Arc::new(amqp::AmqpSubscriber::connect(c.clone()).await?),
        DriverConfig::Nats(c) => Arc::new(nats::NatsSubscriber::connect(c.clone()).await?),
        DriverConfig::Kafka(c) => Arc::new(kafka::KafkaSubscriber::connect(c.clone())?),
        DriverConfig::Sql(c) => Arc::new(sql::SqlQueue::connect(c.clone()).await?),
        DriverConfig::Channel(c) => {
            Arc::new(channel::ChannelSubscriber::new(hub.clone(), c.buffer))
        }
        DriverConfig::River(_) | DriverConfig::Http(_) => {
            return Err(githook_core::Error::InvalidConfig {
                scope: config.name().to_string(),
                message: "driver is publisher-only".to_string(),
            });
        }
    })
}
