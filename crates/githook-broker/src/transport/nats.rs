//! NATS transport, core or JetStream depending on driver config.

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use githook_core::{Error, Message, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::NatsConfig;
use crate::{MessageHandler, Publisher, Subscriber};

fn metadata_headers(metadata: &HashMap<String, String>) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    for (key, value) in metadata {
        headers.insert(key.as_str(), value.as_str());
    }
    headers
}

fn headers_metadata(headers: Option<&async_nats::HeaderMap>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                metadata.insert(name.to_string(), value.to_string());
            }
        }
    }
    metadata
}

/// Stream name derived from a subject prefix; JetStream stream names
/// cannot contain dots.
fn stream_name(config: &NatsConfig) -> String {
    let base = if config.subject_prefix.is_empty() {
        "githook".to_string()
    } else {
        config.subject_prefix.trim_end_matches('.').replace('.', "_")
    };
    format!("{base}_events")
}

/// NATS publisher; JetStream publish-acks when `durable` is set.
#[derive(Debug)]
pub struct NatsPublisher {
    config: NatsConfig,
    client: async_nats::Client,
    jetstream: Option<jetstream::Context>,
    closed: AtomicBool,
}

impl NatsPublisher {
    /// Connect, creating the JetStream stream in durable mode.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the server is unreachable or the
    /// stream cannot be created.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url).await.map_err(Error::transport)?;
        let jetstream = if config.durable {
            let js = jetstream::new(client.clone());
            js.get_or_create_stream(jetstream::stream::Config {
                name: stream_name(&config),
                subjects: vec![config.subject("*")],
                ..jetstream::stream::Config::default()
            })
            .await
            .map_err(Error::transport)?;
            Some(js)
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            jetstream,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("nats publisher"));
        }
        let subject = self.config.subject(topic);
        let headers = metadata_headers(metadata);
        let payload = Bytes::copy_from_slice(payload);

        if let Some(js) = &self.jetstream {
            // The double await is the JetStream server ack.
            js.publish_with_headers(subject, headers, payload)
                .await
                .map_err(Error::transport)?
                .await
                .map_err(Error::transport)?;
        } else {
            self.client
                .publish_with_headers(subject, headers, payload)
                .await
                .map_err(Error::transport)?;
            self.client.flush().await.map_err(Error::transport)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// NATS subscriber; durable pull consumer under JetStream, plain
/// subscription otherwise.
#[derive(Debug)]
pub struct NatsSubscriber {
    config: NatsConfig,
    client: async_nats::Client,
    closed: CancellationToken,
}

impl NatsSubscriber {
    /// Connect to the server.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the server is unreachable.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url).await.map_err(Error::transport)?;
        Ok(Self {
            config,
            client,
            closed: CancellationToken::new(),
        })
    }

    async fn start_jetstream(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        handler: &MessageHandler,
    ) -> Result<()> {
        let js = jetstream::new(self.client.clone());
        let stream = js
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name(&self.config),
                subjects: vec![self.config.subject("*")],
                ..jetstream::stream::Config::default()
            })
            .await
            .map_err(Error::transport)?;

        let durable = format!("githook_{}", topic.replace('.', "_"));
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: self.config.subject(topic),
                    ..jetstream::consumer::pull::Config::default()
                },
            )
            .await
            .map_err(Error::transport)?;

        let mut messages = consumer.messages().await.map_err(Error::transport)?;
        debug!(durable = %durable, topic = %topic, "jetstream consumer started");

        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = self.closed.cancelled() => return Ok(()),
                next = messages.next() => {
                    let Some(next) = next else { return Ok(()) };
                    let message = next.map_err(Error::transport)?;
                    let decoded = Message {
                        payload: message.payload.clone(),
                        metadata: headers_metadata(message.headers.as_ref()),
                        topic: topic.to_string(),
                    };
                    match handler(decoded).await {
                        Ok(()) => {
                            message.ack().await.map_err(Error::transport)?;
                        }
                        Err(e) => {
                            // No negative ack here; redelivery happens via
                            // the ack-wait timeout.
                            warn!(topic = %topic, error = %e, "jetstream handler failed");
                        }
                    }
                }
            }
        }
    }

    async fn start_core(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        handler: &MessageHandler,
    ) -> Result<()> {
        let subject = self.config.subject(topic);
        let mut subscription = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(Error::transport)?;
        debug!(subject = %subject, "nats subscription started");

        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = self.closed.cancelled() => return Ok(()),
                next = subscription.next() => {
                    let Some(message) = next else { return Ok(()) };
                    let decoded = Message {
                        payload: message.payload.clone(),
                        metadata: headers_metadata(message.headers.as_ref()),
                        topic: topic.to_string(),
                    };
                    if let Err(e) = handler(decoded).await {
                        warn!(topic = %topic, error = %e, "nats handler failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        if self.config.durable {
            self.start_jetstream(&ctx, topic, &handler).await
        } else {
            self.start_core(&ctx, topic, &handler).await
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
    fn stream_names_avoid_dots() {
        let config: NatsConfig = serde_json::from_value(serde_json::json!({
            "url": "nats://localhost",
            "subject_prefix": "githook.prod.",
            "durable": true
        }))
        .unwrap();
        assert_eq!(stream_name(&config), "githook_prod_events");

        let config: NatsConfig =
            serde_json::from_value(serde_json::json!({"url": "nats://localhost"})).unwrap();
        assert_eq!(stream_name(&config), "githook_events");
    }

    #[test]
    fn header_round_trip() {
        let mut metadata = HashMap::new();
        metadata.insert("log_id".to_string(), "42".to_string());
        let headers = metadata_headers(&metadata);
        let back = headers_metadata(Some(&headers));
        assert_eq!(back.get("log_id").map(String::as_str), Some("42"));
    }
}
