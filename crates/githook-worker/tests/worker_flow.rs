//! Worker runtime flow tests over a wiremock control plane and the
//! in-process channel broker.

use async_trait::async_trait;
use githook_broker::transport::channel::ChannelPublisher;
use githook_broker::{ChannelHub, MessageHandler, Publisher, Subscriber, SubscriberFactory};
use githook_core::{meta, Error, EventPayload, Message, Result};
use githook_worker::{AlwaysRequeue, Handler, Worker, WorkerConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn worker_config(endpoint: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(endpoint);
    config.api_key = Some("key".into());
    config.tenant = String::new();
    config.concurrency = 4;
    config.grace_secs = 2;
    config
}

async fn mock_control_plane(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/rules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rules": [{
                "tenant": "",
                "id": "r1",
                "when": "action == \"opened\"",
                "emit": ["t1"],
                "driver_id": "chan-1"
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drivers/chan-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "driver": {
                "tenant": "",
                "id": "chan-1",
                "name": "channel",
                "config": {"buffer": 16},
                "enabled": true
            }
        })))
        .mount(server)
        .await;
}

fn envelope_with(log_id: &str, driver: &str) -> (bytes::Bytes, HashMap<String, String>) {
    let body = json!({"action": "opened", "pull_request": {"number": 7}});
    let payload =
        EventPayload::new("github", "pull_request", serde_json::to_vec(&body).unwrap())
            .encode_to_bytes();
    let mut metadata = HashMap::new();
    metadata.insert(meta::LOG_ID.to_string(), log_id.to_string());
    metadata.insert(meta::PROVIDER.to_string(), "github".to_string());
    metadata.insert(meta::EVENT.to_string(), "pull_request".to_string());
    metadata.insert(meta::TOPIC.to_string(), "t1".to_string());
    metadata.insert(meta::DRIVER.to_string(), driver.to_string());
    (payload, metadata)
}

#[tokio::test]
async fn transient_failure_reuses_the_same_log_row() {
    let server = MockServer::start().await;
    mock_control_plane(&server).await;

    let failed_updates = Mock::given(method("POST"))
        .and(path("/api/v1/event-logs/log-1/status"))
        .and(body_partial_json(json!({"status": "failed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})));
    failed_updates.expect(1).mount(&server).await;

    let success_updates = Mock::given(method("POST"))
        .and(path("/api/v1/event-logs/log-1/status"))
        .and(body_partial_json(json!({"status": "success"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})));
    success_updates.expect(1).mount(&server).await;

    let hub = Arc::new(ChannelHub::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let attempts = attempts.clone();
        Arc::new(move |_ctx| {
            let attempts = attempts.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Other("transient".into()))
                } else {
                    Ok(())
                }
            })
        })
    };

    let worker = Worker::builder(worker_config(&server.uri()))
        .handle("t1", handler)
        .on_error(Arc::new(AlwaysRequeue))
        .without_client()
        .factory(SubscriberFactory::new(hub.clone()))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // First delivery fails; the channel transport cannot requeue, so
    // the event log records `failed` and the message is acked.
    let publisher = ChannelPublisher::new(hub.clone(), 16);
    let (payload, metadata) = envelope_with("log-1", "channel");
    publisher.publish("t1", &payload, &metadata).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The provider redelivers with the same log_id; the second attempt
    // succeeds and overwrites `failed` with `success`. No new row.
    publisher.publish("t1", &payload, &metadata).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    worker.close().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    // Mock expectations (exactly one failed, one success update) are
    // verified on drop.
}

/// Records exactly one ack-or-nack outcome per delivered message.
#[derive(Debug)]
struct RecordingSubscriber {
    messages: Vec<Message>,
    outcomes: Arc<std::sync::Mutex<Vec<bool>>>,
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        for message in self
            .messages
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect::<Vec<_>>()
        {
            let acked = handler(message).await.is_ok();
            self.outcomes.lock().unwrap().push(acked);
        }
        ctx.cancelled().await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn nack_is_requested_only_on_requeue_capable_transports() {
    let server = MockServer::start().await;
    mock_control_plane(&server).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    let (amqp_payload, amqp_meta) = envelope_with("log-a", "amqp");
    let (chan_payload, chan_meta) = envelope_with("log-b", "channel");
    let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let subscriber = RecordingSubscriber {
        messages: vec![
            Message {
                payload: amqp_payload,
                metadata: amqp_meta,
                topic: "t1".into(),
            },
            Message {
                payload: chan_payload,
                metadata: chan_meta,
                topic: "t1".into(),
            },
        ],
        outcomes: outcomes.clone(),
    };

    let handler: Handler = Arc::new(|_ctx| Box::pin(async { Err(Error::Other("boom".into())) }));
    let worker = Worker::builder(worker_config(&server.uri()))
        .handle("t1", handler)
        .on_error(Arc::new(AlwaysRequeue))
        .without_client()
        .subscriber(Arc::new(subscriber))
        .start()
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    worker.close().await.unwrap();

    // AMQP delivery nacked (false), channel delivery acked (true):
    // exactly one outcome per message.
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.as_slice(), &[false, true]);
}

#[tokio::test]
async fn no_new_handlers_after_close() {
    let server = MockServer::start().await;
    mock_control_plane(&server).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    let hub = Arc::new(ChannelHub::new());
    let handled = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let handled = handled.clone();
        Arc::new(move |_ctx| {
            let handled = handled.clone();
            Box::pin(async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    };

    let worker = Worker::builder(worker_config(&server.uri()))
        .handle("t1", handler)
        .without_client()
        .factory(SubscriberFactory::new(hub.clone()))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let publisher = ChannelPublisher::new(hub.clone(), 16);
    let (payload, metadata) = envelope_with("log-1", "channel");
    publisher.publish("t1", &payload, &metadata).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    worker.close().await.unwrap();

    // Published after close: no handler runs.
    publisher.publish("t1", &payload, &metadata).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_topic_is_fatal_at_startup() {
    let server = MockServer::start().await;
    mock_control_plane(&server).await;

    let handler: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
    let err = Worker::builder(worker_config(&server.uri()))
        .handle("ghost-topic", handler)
        .without_client()
        .factory(SubscriberFactory::default())
        .start()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn undecodable_payload_records_failure() {
    let server = MockServer::start().await;
    mock_control_plane(&server).await;

    let failure = Mock::given(method("POST"))
        .and(path("/api/v1/event-logs/log-x/status"))
        .and(body_partial_json(json!({"status": "failed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})));
    failure.expect(1).mount(&server).await;

    let hub = Arc::new(ChannelHub::new());
    let handled = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let handled = handled.clone();
        Arc::new(move |_ctx| {
            let handled = handled.clone();
            Box::pin(async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    };

    let worker = Worker::builder(worker_config(&server.uri()))
        .handle("t1", handler)
        .without_client()
        .factory(SubscriberFactory::new(hub.clone()))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let publisher = ChannelPublisher::new(hub.clone(), 16);
    let mut metadata = HashMap::new();
    metadata.insert(meta::LOG_ID.to_string(), "log-x".to_string());
    metadata.insert(meta::DRIVER.to_string(), "channel".to_string());
    publisher
        .publish("t1", b"\x00\xffgarbage", &metadata)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    worker.close().await.unwrap();
    // The handler never saw the message.
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn middleware_wraps_handlers() {
    let server = MockServer::start().await;
    mock_control_plane(&server).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::default();
    let handler: Handler = {
        let order = order.clone();
        Arc::new(move |_ctx| {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push("handler");
                Ok(())
            })
        })
    };
    let middleware: githook_worker::Middleware = {
        let order = order.clone();
        Arc::new(move |inner: Handler| {
            let order = order.clone();
            Arc::new(move |ctx| {
                let inner = Arc::clone(&inner);
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("before");
                    let result = inner(ctx).await;
                    order.lock().unwrap().push("after");
                    result
                })
            })
        })
    };

    let hub = Arc::new(ChannelHub::new());
    let worker = Worker::builder(worker_config(&server.uri()))
        .handle("t1", handler)
        .use_middleware(middleware)
        .without_client()
        .factory(SubscriberFactory::new(hub.clone()))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let publisher = ChannelPublisher::new(hub.clone(), 16);
    let (payload, metadata) = envelope_with("log-1", "channel");
    publisher.publish("t1", &payload, &metadata).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    worker.close().await.unwrap();

    assert_eq!(order.lock().unwrap().as_slice(), &["before", "handler", "after"]);
}
