//! Subscriber construction from driver records.

use async_trait::async_trait;
use githook_core::{Error, Result};
use githook_store::DriverRecord;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::DriverConfig;
use crate::transport::channel::ChannelHub;
use crate::{transport, MessageHandler, Subscriber};

/// Builds subscribers for the worker runtime.
#[derive(Debug)]
pub struct SubscriberFactory {
    hub: Arc<ChannelHub>,
}

impl SubscriberFactory {
    /// Factory sharing `hub` with channel publishers in this process.
    #[must_use]
    pub fn new(hub: Arc<ChannelHub>) -> Self {
        Self { hub }
    }

    /// Build a subscriber for `record`.
    ///
    /// # Errors
    ///
    /// [`Error::PublisherUnavailable`] for a disabled driver,
    /// [`Error::InvalidConfig`] for publisher-only transports, and
    /// transport errors from connecting.
    pub async fn build(&self, record: &DriverRecord) -> Result<Arc<dyn Subscriber>> {
        if !record.enabled {
            return Err(Error::PublisherUnavailable {
                driver_id: record.id.clone(),
                reason: "driver is disabled".to_string(),
            });
        }
        let config = DriverConfig::from_record(record)?;
        debug!(driver_id = %record.id, driver = config.name(), "building subscriber");
        transport::build_subscriber(&config, &self.hub).await
    }

    /// Shared channel hub, for embedding publishers in the same process.
    #[must_use]
    pub fn hub(&self) -> Arc<ChannelHub> {
        Arc::clone(&self.hub)
    }
}

impl Default for SubscriberFactory {
    fn default() -> Self {
        Self::new(Arc::new(ChannelHub::new()))
    }
}

/// Fans one topic across several child subscribers.
///
/// Each child runs in its own task; the first child failure cancels the
/// rest and the joined error is returned.
#[derive(Debug)]
pub struct MultiSubscriber {
    children: Vec<Arc<dyn Subscriber>>,
}

impl MultiSubscriber {
    /// Group `children` under one subscriber.
    #[must_use]
    pub fn new(children: Vec<Arc<dyn Subscriber>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Subscriber for MultiSubscriber {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        let child_ctx = ctx.child_token();
        let mut tasks = Vec::with_capacity(self.children.len());
        for (index, child) in self.children.iter().enumerate() {
            let child = Arc::clone(child);
            let ctx = child_ctx.clone();
            let topic = topic.to_string();
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                child.start(ctx, &topic, handler).await.map_err(|e| (index, e))
            }));
        }

        let mut failures: Vec<String> = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err((index, e))) => {
                    error!(child = index, error = %e, "multi-subscriber child failed");
                    failures.push(format!("child {index}: {e}"));
                    // One child down cancels the siblings.
                    child_ctx.cancel();
                }
                Err(join_err) => {
                    failures.push(format!("child task panicked: {join_err}"));
                    child_ctx.cancel();
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Transport(failures.join("; ")))
        }
    }

    async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for child in &self.children {
            if let Err(e) = child.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{ChannelPublisher, ChannelSubscriber};
    use crate::Publisher;
    use githook_core::{Message, TenantCtx};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn factory_rejects_publisher_only_drivers() {
        let factory = SubscriberFactory::default();
        let record = DriverRecord {
            tenant: TenantCtx::global(),
            id: "h1".into(),
            name: "http".into(),
            config: json!({"url": "http://sink"}),
            enabled: true,
        };
        let err = factory.build(&record).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn factory_rejects_disabled_drivers() {
        let factory = SubscriberFactory::default();
        let record = DriverRecord {
            tenant: TenantCtx::global(),
            id: "c1".into(),
            name: "channel".into(),
            config: json!({}),
            enabled: false,
        };
        let err = factory.build(&record).await.unwrap_err();
        assert!(matches!(err, Error::PublisherUnavailable { .. }));
    }

    #[tokio::test]
    async fn multi_subscriber_fans_one_topic_across_children() {
        let hub_a = Arc::new(ChannelHub::new());
        let hub_b = Arc::new(ChannelHub::new());
        let publisher_a = ChannelPublisher::new(hub_a.clone(), 8);
        let publisher_b = ChannelPublisher::new(hub_b.clone(), 8);

        let multi = MultiSubscriber::new(vec![
            Arc::new(ChannelSubscriber::new(hub_a, 8)) as Arc<dyn Subscriber>,
            Arc::new(ChannelSubscriber::new(hub_b, 8)) as Arc<dyn Subscriber>,
        ]);

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler: MessageHandler = Arc::new(move |_msg: Message| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let ctx = CancellationToken::new();
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { multi.start(ctx, "t", handler).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        publisher_a.publish("t", b"a", &HashMap::new()).await.unwrap();
        publisher_b.publish("t", b"b", &HashMap::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        ctx.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
