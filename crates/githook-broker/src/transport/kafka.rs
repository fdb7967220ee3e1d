//! Kafka transport over rdkafka.

use async_trait::async_trait;
use bytes::Bytes;
use githook_core::{Error, Message, Result};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::{MessageHandler, Publisher, Subscriber};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

fn metadata_headers(metadata: &HashMap<String, String>) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in metadata {
        headers = headers.insert(Header {
            key,
            value: Some(value.as_str()),
        });
    }
    headers
}

/// Kafka publisher wrapping a `FutureProducer`.
pub struct KafkaPublisher {
    config: KafkaConfig,
    producer: FutureProducer,
    closed: AtomicBool,
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish()
    }
}

impl KafkaPublisher {
    /// Build the producer. rdkafka connects lazily; a bad broker list
    /// surfaces on the first publish.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the client config is rejected.
    pub fn connect(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(Error::transport)?;
        Ok(Self {
            config,
            producer,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("kafka publisher"));
        }
        let kafka_topic = self.config.topic(topic);
        let record = FutureRecord::<(), [u8]>::to(&kafka_topic)
            .payload(payload)
            .headers(metadata_headers(metadata));

        self.producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| Error::transport(e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// At-least-once Kafka subscriber with manual commits.
#[derive(Debug)]
pub struct KafkaSubscriber {
    config: KafkaConfig,
    closed: CancellationToken,
}

impl KafkaSubscriber {
    /// Build a subscriber; each [`Subscriber::start`] call creates its
    /// own consumer so topics get independent offsets.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when `consumer_group` is empty.
    pub fn connect(config: KafkaConfig) -> Result<Self> {
        if config.consumer_group.is_empty() {
            return Err(Error::InvalidConfig {
                scope: "kafka".to_string(),
                message: "consumer_group is required for subscribing".to_string(),
            });
        }
        Ok(Self {
            config,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(Error::transport)?;

        let kafka_topic = self.config.topic(topic);
        consumer
            .subscribe(&[kafka_topic.as_str()])
            .map_err(Error::transport)?;
        debug!(topic = %kafka_topic, group = %self.config.consumer_group, "kafka consumer started");

        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = self.closed.cancelled() => return Ok(()),
                received = consumer.recv() => {
                    let borrowed = received.map_err(Error::transport)?;

                    let mut metadata = HashMap::new();
                    if let Some(headers) = borrowed.headers() {
                        for header in headers.iter() {
                            if let Some(value) = header.value {
                                metadata.insert(
                                    header.key.to_string(),
                                    String::from_utf8_lossy(value).into_owned(),
                                );
                            }
                        }
                    }
                    let message = Message {
                        payload: Bytes::copy_from_slice(borrowed.payload().unwrap_or_default()),
                        metadata,
                        topic: topic.to_string(),
                    };

                    match handler(message).await {
                        Ok(()) => {
                            consumer
                                .commit_message(&borrowed, CommitMode::Async)
                                .map_err(Error::transport)?;
                        }
                        Err(e) => {
                            // At-least-once: commit anyway, the event log
                            // carries the failure; not committing would
                            // wedge the partition behind a poison message.
                            warn!(topic = %kafka_topic, error = %e, "kafka handler failed");
                            consumer
                                .commit_message(&borrowed, CommitMode::Async)
                                .map_err(Error::transport)?;
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_prefixing() {
        let config: KafkaConfig = serde_json::from_value(serde_json::json!({
            "brokers": ["k1:9092", "k2:9092"],
            "consumer_group": "githook",
            "topic_prefix": "githook-"
        }))
        .unwrap();
        assert_eq!(config.topic("pr.opened"), "githook-pr.opened");
        assert_eq!(config.bootstrap_servers(), "k1:9092,k2:9092");
    }

    #[test]
    fn subscriber_requires_consumer_group() {
        let config: KafkaConfig =
            serde_json::from_value(serde_json::json!({"brokers": ["k1:9092"]})).unwrap();
        assert!(KafkaSubscriber::connect(config).is_err());
    }
}
