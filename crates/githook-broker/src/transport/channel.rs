//! In-process channel transport for embedded and test deployments.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use githook_core::{Error, Message, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{MessageHandler, Publisher, Subscriber};

/// Shared per-process topic registry backing the channel transport.
///
/// Publishers and subscribers built from the same hub see each other;
/// one hub is created per process and injected (no global state).
#[derive(Debug, Default)]
pub struct ChannelHub {
    topics: DashMap<String, broadcast::Sender<Message>>,
}

impl ChannelHub {
    /// Fresh, empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str, buffer: usize) -> broadcast::Sender<Message> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(buffer.max(1)).0)
            .clone()
    }
}

/// Publisher half of the channel transport.
#[derive(Debug)]
pub struct ChannelPublisher {
    hub: Arc<ChannelHub>,
    buffer: usize,
    closed: AtomicBool,
}

impl ChannelPublisher {
    /// Publisher over `hub` with the configured buffer size.
    #[must_use]
    pub fn new(hub: Arc<ChannelHub>, buffer: usize) -> Self {
        Self {
            hub,
            buffer,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("channel publisher"));
        }
        let message = Message {
            payload: Bytes::copy_from_slice(payload),
            metadata: metadata.clone(),
            topic: topic.to_string(),
        };
        // No receiver yet is acceptance, not an error: embedded workers
        // may attach after the first webhook lands.
        if self.hub.sender(topic, self.buffer).send(message).is_err() {
            debug!(topic = %topic, "channel publish with no subscribers");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Subscriber half of the channel transport.
#[derive(Debug)]
pub struct ChannelSubscriber {
    hub: Arc<ChannelHub>,
    buffer: usize,
    closed: CancellationToken,
}

impl ChannelSubscriber {
    /// Subscriber over `hub` with the configured buffer size.
    #[must_use]
    pub fn new(hub: Arc<ChannelHub>, buffer: usize) -> Self {
        Self {
            hub,
            buffer,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        let mut rx = self.hub.sender(topic, self.buffer).subscribe();
        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = self.closed.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(message) => {
                        // Channels cannot requeue; a handler error is
                        // logged and the message dropped (the event log
                        // keeps the failed state).
                        if let Err(e) = handler(message).await {
                            warn!(topic = %topic, error = %e, "channel handler failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "channel subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
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
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = Arc::new(ChannelHub::new());
        let publisher = ChannelPublisher::new(hub.clone(), 16);
        let subscriber = ChannelSubscriber::new(hub, 16);

        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        let handler: MessageHandler = Arc::new(move |msg: Message| {
            let seen = seen.clone();
            Box::pin(async move {
                assert_eq!(msg.topic, "t1");
                assert_eq!(msg.meta("provider"), Some("github"));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let ctx = CancellationToken::new();
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { subscriber.start(ctx, "t1", handler).await })
        };
        // Let the subscriber attach before publishing.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut metadata = HashMap::new();
        metadata.insert("provider".to_string(), "github".to_string());
        publisher.publish("t1", b"payload", &metadata).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctx.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_publisher_errors() {
        let hub = Arc::new(ChannelHub::new());
        let publisher = ChannelPublisher::new(hub, 4);
        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        let err = publisher
            .publish("t", b"x", &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_accepted() {
        let hub = Arc::new(ChannelHub::new());
        let publisher = ChannelPublisher::new(hub, 4);
        publisher.publish("t", b"x", &HashMap::new()).await.unwrap();
    }
}
