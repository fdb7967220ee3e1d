//! AMQP (RabbitMQ) transport over lapin.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use githook_core::{Error, Message, Result};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AmqpConfig, AmqpMode};
use crate::{MessageHandler, Publisher, Subscriber};

fn metadata_headers(metadata: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in metadata {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn headers_metadata(table: Option<&FieldTable>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(table) = table {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                metadata.insert(key.to_string(), s.to_string());
            }
        }
    }
    metadata
}

async fn open_channel(config: &AmqpConfig) -> Result<(Connection, Channel)> {
    let connection = Connection::connect(&config.url, ConnectionProperties::default())
        .await
        .map_err(Error::transport)?;
    let channel = connection.create_channel().await.map_err(Error::transport)?;

    if !config.exchange.is_empty() {
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: config.mode == AmqpMode::DurableQueue,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(Error::transport)?;
    }
    Ok((connection, channel))
}

/// AMQP publisher with publisher confirms.
#[derive(Debug)]
pub struct AmqpPublisher {
    config: AmqpConfig,
    connection: Mutex<Option<Connection>>,
    channel: Channel,
}

impl AmqpPublisher {
    /// Connect and declare the exchange.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the broker is unreachable.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let (connection, channel) = open_channel(&config).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(Error::transport)?;
        Ok(Self {
            config,
            connection: Mutex::new(Some(connection)),
            channel,
        })
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.connection.lock().await.is_none() {
            return Err(Error::Closed("amqp publisher"));
        }
        let routing_key = self.config.routing_key(topic);
        let properties = BasicProperties::default()
            .with_headers(metadata_headers(metadata))
            .with_delivery_mode(match self.config.mode {
                AmqpMode::DurableQueue => 2, // persistent
                AmqpMode::Transient => 1,
            });

        // Wait for the broker confirm; that is the acceptance contract.
        let confirm = self
            .channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(Error::transport)?
            .await
            .map_err(Error::transport)?;
        if confirm.is_nack() {
            return Err(Error::Transport("amqp broker nacked publish".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.close(200, "shutdown").await.map_err(Error::transport)?;
        }
        Ok(())
    }
}

/// AMQP subscriber; the only transport that can requeue on nack.
#[derive(Debug)]
pub struct AmqpSubscriber {
    config: AmqpConfig,
    connection: Mutex<Option<Connection>>,
    channel: Channel,
}

impl AmqpSubscriber {
    /// Connect and declare the exchange.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the broker is unreachable.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let (connection, channel) = open_channel(&config).await?;
        Ok(Self {
            config,
            connection: Mutex::new(Some(connection)),
            channel,
        })
    }
}

#[async_trait]
impl Subscriber for AmqpSubscriber {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        if self.connection.lock().await.is_none() {
            return Err(Error::Closed("amqp subscriber"));
        }
        let durable = self.config.mode == AmqpMode::DurableQueue;
        let queue_name = format!("githook.{topic}");

        self.channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable,
                    auto_delete: !durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(Error::transport)?;

        if !self.config.exchange.is_empty() {
            self.channel
                .queue_bind(
                    &queue_name,
                    &self.config.exchange,
                    &self.config.routing_key(topic),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(Error::transport)?;
        }

        if durable {
            self.channel
                .basic_qos(self.config.prefetch, BasicQosOptions::default())
                .await
                .map_err(Error::transport)?;
        }

        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &format!("githook-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::transport)?;

        debug!(queue = %queue_name, topic = %topic, "amqp consumer started");

        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { return Ok(()) };
                    let delivery = delivery.map_err(Error::transport)?;
                    let message = Message {
                        payload: Bytes::from(delivery.data.clone()),
                        metadata: headers_metadata(delivery.properties.headers().as_ref()),
                        topic: topic.to_string(),
                    };
                    match handler(message).await {
                        Ok(()) => delivery
                            .ack(BasicAckOptions::default())
                            .await
                            .map_err(Error::transport)?,
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "amqp handler failed, requeueing");
                            delivery
                                .nack(BasicNackOptions {
                                    requeue: true,
                                    ..BasicNackOptions::default()
                                })
                                .await
                                .map_err(Error::transport)?;
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.close(200, "shutdown").await.map_err(Error::transport)?;
        }
        Ok(())
    }
}
