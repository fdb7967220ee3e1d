//! The worker runtime: registration, startup validation, the message
//! loop, and graceful shutdown.

use githook_broker::{supports_requeue, MessageHandler, Subscriber, SubscriberFactory};
use githook_core::{meta, Error, Event, EventPayload, EventStatus, Message, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ControlPlaneClient, ControlPlaneClientProvider};
use crate::config::WorkerConfig;
use crate::retry::{NeverRetry, RetryPolicy};
use crate::{ClientProvider, EventContext, Handler, Listener, Middleware};

/// Builder for a [`Worker`].
pub struct WorkerBuilder {
    config: WorkerConfig,
    topic_handlers: HashMap<String, Handler>,
    rule_handlers: Vec<(String, Handler)>,
    type_handlers: HashMap<String, Handler>,
    middleware: Vec<Middleware>,
    retry: Arc<dyn RetryPolicy>,
    listeners: Vec<Arc<dyn Listener>>,
    client_provider: Option<Arc<dyn ClientProvider>>,
    attach_clients: bool,
    subscriber_override: Option<Arc<dyn Subscriber>>,
    factory: Option<SubscriberFactory>,
}

impl WorkerBuilder {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            topic_handlers: HashMap::new(),
            rule_handlers: Vec::new(),
            type_handlers: HashMap::new(),
            middleware: Vec::new(),
            retry: Arc::new(NeverRetry),
            listeners: Vec::new(),
            client_provider: None,
            attach_clients: true,
            subscriber_override: None,
            factory: None,
        }
    }

    /// Register a handler for one emit topic.
    #[must_use]
    pub fn handle(mut self, topic: impl Into<String>, handler: Handler) -> Self {
        self.topic_handlers.insert(topic.into(), handler);
        self
    }

    /// Register a handler for every topic a rule emits. The rule is
    /// fetched from the control plane during startup.
    #[must_use]
    pub fn handle_rule(mut self, rule_id: impl Into<String>, handler: Handler) -> Self {
        self.rule_handlers.push((rule_id.into(), handler));
        self
    }

    /// Register a fallback handler keyed by event kind (e.g.
    /// `pull_request`), used when no topic handler matches.
    #[must_use]
    pub fn handle_type(mut self, kind: impl Into<String>, handler: Handler) -> Self {
        self.type_handlers.insert(kind.into(), handler);
        self
    }

    /// Wrap every handler; later middleware wraps earlier.
    #[must_use]
    pub fn use_middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Set the retry policy consulted on handler errors.
    #[must_use]
    pub fn on_error(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = policy;
        self
    }

    /// Attach a lifecycle listener.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Use a custom client provider instead of the control-plane one.
    #[must_use]
    pub fn client_provider(mut self, provider: Arc<dyn ClientProvider>) -> Self {
        self.client_provider = Some(provider);
        self
    }

    /// Skip client attachment entirely.
    #[must_use]
    pub fn without_client(mut self) -> Self {
        self.client_provider = None;
        self.attach_clients = false;
        self
    }

    /// Use one pre-built subscriber for every topic instead of building
    /// per-driver subscribers from the control plane.
    #[must_use]
    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber_override = Some(subscriber);
        self
    }

    /// Use a specific subscriber factory (shares a channel hub with an
    /// embedded server).
    #[must_use]
    pub fn factory(mut self, factory: SubscriberFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Resolve rules, validate topics, build subscribers, and start the
    /// per-(subscriber, topic) tasks.
    ///
    /// # Errors
    ///
    /// Fatal startup conditions: unreachable control plane, a rule
    /// handler naming an unknown rule, a registered topic absent from
    /// the tenant's rule set, or a driver that cannot be subscribed.
    pub async fn start(self) -> Result<Worker> {
        self.config.validate()?;
        let control = ControlPlaneClient::new(&self.config);
        let rules = control.list_rules().await?;

        let mut topic_handlers = self.topic_handlers;
        // topic → driver ids that carry it, from the rule set.
        let mut topic_drivers: HashMap<String, Vec<String>> = HashMap::new();
        for rule in &rules {
            for topic in rule.emit_topics() {
                let drivers = topic_drivers.entry(topic).or_default();
                if !drivers.contains(&rule.driver_id) {
                    drivers.push(rule.driver_id.clone());
                }
            }
        }

        // Rule-bound handlers expand to topic handlers.
        for (rule_id, handler) in self.rule_handlers {
            let rule = control.get_rule(&rule_id).await?;
            for topic in rule.emit_topics() {
                topic_handlers.insert(topic, Arc::clone(&handler));
            }
        }

        // Unknown topic → fatal; a typo here would otherwise sit silent
        // forever.
        for topic in topic_handlers.keys() {
            if !topic_drivers.contains_key(topic) {
                return Err(Error::not_found("topic", topic.clone()));
            }
        }
        // Static bindings narrow which driver carries a topic.
        for binding in &self.config.bindings {
            topic_drivers.insert(binding.topic.clone(), vec![binding.driver_id.clone()]);
        }

        // Wrap handlers in middleware, innermost first.
        let wrap = |handler: Handler| -> Handler {
            self.middleware
                .iter()
                .fold(handler, |inner, mw| mw(inner))
        };
        let topic_handlers: HashMap<String, Handler> = topic_handlers
            .into_iter()
            .map(|(topic, handler)| (topic, wrap(handler)))
            .collect();
        let type_handlers: HashMap<String, Handler> = self
            .type_handlers
            .into_iter()
            .map(|(kind, handler)| (kind, wrap(handler)))
            .collect();

        // One subscriber per distinct driver, or the provided override.
        let mut subscribers: HashMap<String, Arc<dyn Subscriber>> = HashMap::new();
        let subscribed_topics: Vec<String> = topic_handlers.keys().cloned().collect();
        if let Some(subscriber) = self.subscriber_override {
            subscribers.insert(String::new(), subscriber);
        } else {
            let factory = self.factory.unwrap_or_default();
            let mut driver_ids: HashSet<String> = HashSet::new();
            for topic in &subscribed_topics {
                if let Some(ids) = topic_drivers.get(topic) {
                    driver_ids.extend(ids.iter().cloned());
                }
            }
            for driver_id in driver_ids {
                let record = control.get_driver(&driver_id).await?;
                let subscriber = factory.build(&record).await?;
                subscribers.insert(driver_id, subscriber);
            }
        }

        let client_provider = if self.attach_clients {
            self.client_provider.or_else(|| {
                Some(Arc::new(ControlPlaneClientProvider::new(control.clone()))
                    as Arc<dyn ClientProvider>)
            })
        } else {
            None
        };

        let shared = Arc::new(Shared {
            control,
            topic_handlers,
            type_handlers,
            retry: self.retry,
            listeners: self.listeners,
            client_provider,
            semaphore: Arc::new(Semaphore::new(self.config.concurrency)),
        });

        let ctx = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();
        let mut started: Vec<Arc<dyn Subscriber>> = Vec::new();

        for (driver_id, subscriber) in subscribers {
            started.push(Arc::clone(&subscriber));
            let topics: Vec<String> = if driver_id.is_empty() {
                subscribed_topics.clone()
            } else {
                subscribed_topics
                    .iter()
                    .filter(|t| {
                        topic_drivers
                            .get(*t)
                            .is_some_and(|ids| ids.contains(&driver_id))
                    })
                    .cloned()
                    .collect()
            };
            for topic in topics {
                let subscriber = Arc::clone(&subscriber);
                let shared = Arc::clone(&shared);
                let ctx = ctx.clone();
                let task_topic = topic.clone();
                debug!(driver_id = %driver_id, topic = %topic, "subscribing");
                tasks.push(tokio::spawn(async move {
                    let handler = on_message(Arc::clone(&shared), task_topic.clone());
                    subscriber.start(ctx, &task_topic, handler).await
                }));
            }
        }

        for listener in &shared.listeners {
            listener.on_start();
        }
        info!(
            topics = subscribed_topics.len(),
            concurrency = self.config.concurrency,
            "worker started"
        );

        Ok(Worker {
            ctx,
            tasks: tokio::sync::Mutex::new(tasks),
            subscribers: started,
            shared,
            concurrency: self.config.concurrency,
            grace: Duration::from_secs(self.config.grace_secs),
        })
    }
}

struct Shared {
    control: ControlPlaneClient,
    topic_handlers: HashMap<String, Handler>,
    type_handlers: HashMap<String, Handler>,
    retry: Arc<dyn RetryPolicy>,
    listeners: Vec<Arc<dyn Listener>>,
    client_provider: Option<Arc<dyn ClientProvider>>,
    semaphore: Arc<Semaphore>,
}

/// Build the per-topic transport callback.
fn on_message(shared: Arc<Shared>, topic: String) -> MessageHandler {
    Arc::new(move |message: Message| {
        let shared = Arc::clone(&shared);
        let topic = topic.clone();
        Box::pin(async move { handle_message(&shared, &topic, message).await })
    })
}

async fn handle_message(shared: &Shared, topic: &str, message: Message) -> Result<()> {
    // Backpressure: the transport callback blocks here while `C`
    // handlers are in flight.
    let _permit = shared
        .semaphore
        .acquire()
        .await
        .map_err(|_| Error::Closed("worker semaphore"))?;

    for listener in &shared.listeners {
        listener.on_message_start(topic);
    }
    let outcome = process_message(shared, topic, message).await;
    for listener in &shared.listeners {
        listener.on_message_finish(topic, outcome.is_ok());
    }
    outcome
}

async fn process_message(shared: &Shared, topic: &str, message: Message) -> Result<()> {
    let requeue_capable = message
        .meta(meta::DRIVER)
        .is_some_and(supports_requeue);
    let log_id = message.meta(meta::LOG_ID).map(ToString::to_string);

    // Decode; failures consult the retry policy like handler errors.
    let event = match decode_event(&message, topic) {
        Ok(event) => event,
        Err(e) => {
            for listener in &shared.listeners {
                listener.on_error(&e);
            }
            warn!(topic = %topic, error = %e, "message decode failed");
            return fail_event(
                shared,
                &Event {
                    topic: topic.to_string(),
                    metadata: message.metadata.clone(),
                    ..Event::default()
                },
                log_id.as_deref(),
                requeue_capable,
                e,
            )
            .await;
        }
    };

    // Attach a provider client; resolution failure is a handler error.
    let client = match &shared.client_provider {
        Some(provider) if !event.installation_id().is_empty() => {
            match provider.client_for(&event).await {
                Ok(client) => Some(client),
                Err(e) => {
                    for listener in &shared.listeners {
                        listener.on_error(&e);
                    }
                    warn!(topic = %topic, error = %e, "client attachment failed");
                    return fail_event(shared, &event, log_id.as_deref(), requeue_capable, e)
                        .await;
                }
            }
        }
        _ => None,
    };

    // Topic handler, falling back to the type handler; nothing → ack.
    let handler = shared
        .topic_handlers
        .get(topic)
        .or_else(|| shared.type_handlers.get(&event.kind));
    let Some(handler) = handler else {
        debug!(topic = %topic, kind = %event.kind, "no handler registered, acking");
        return Ok(());
    };

    let context = EventContext {
        event: event.clone(),
        client,
    };
    match handler(context).await {
        Ok(()) => {
            if let Some(log_id) = &log_id {
                if let Err(e) = shared
                    .control
                    .update_event_log_status(log_id, EventStatus::Success, None)
                    .await
                {
                    warn!(log_id = %log_id, error = %e, "event-log success update failed");
                }
            }
            Ok(())
        }
        Err(e) => {
            for listener in &shared.listeners {
                listener.on_error(&e);
            }
            fail_event(shared, &event, log_id.as_deref(), requeue_capable, e).await
        }
    }
}

/// Record the failure and translate the retry decision into ack/nack.
async fn fail_event(
    shared: &Shared,
    event: &Event,
    log_id: Option<&str>,
    requeue_capable: bool,
    error: Error,
) -> Result<()> {
    let decision = shared.retry.on_error(event, &error).await;

    if let Some(log_id) = log_id {
        if let Err(e) = shared
            .control
            .update_event_log_status(log_id, EventStatus::Failed, Some(&error.to_string()))
            .await
        {
            warn!(log_id = %log_id, error = %e, "event-log failure update failed");
        }
    }

    if decision.nack && requeue_capable {
        // Returning the error nacks; the transport redelivers.
        Err(error)
    } else {
        // Ack; the event log carries the terminal failed state.
        Ok(())
    }
}

fn decode_event(message: &Message, topic: &str) -> Result<Event> {
    let envelope = EventPayload::decode_from_bytes(&message.payload)?;
    let normalized = envelope.normalized();
    Ok(Event {
        provider: envelope.provider,
        kind: envelope.name,
        topic: topic.to_string(),
        metadata: message.metadata.clone(),
        payload: bytes::Bytes::from(envelope.payload),
        normalized,
    })
}

/// A running worker.
pub struct Worker {
    ctx: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<Result<()>>>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    shared: Arc<Shared>,
    concurrency: usize,
    grace: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("concurrency", &self.concurrency)
            .field("grace", &self.grace)
            .field("subscriber_count", &self.subscribers.len())
            .finish()
    }
}

impl Worker {
    /// Start building a worker for `config`.
    #[must_use]
    pub fn builder(config: WorkerConfig) -> WorkerBuilder {
        WorkerBuilder::new(config)
    }

    /// Block until every subscriber task exits (normally via
    /// [`Worker::close`] from another task, or transport failure).
    pub async fn wait(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "subscriber task failed"),
                Err(e) => error!(error = %e, "subscriber task panicked"),
            }
        }
    }

    /// Stop accepting messages, drain in-flight handlers up to the
    /// grace period, close every subscriber, and return the first
    /// error. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.ctx.cancel();

        // Draining: when every permit is back, no handler is running.
        let semaphore = Arc::clone(&self.shared.semaphore);
        let total = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(self.grace, async {
            let _all = semaphore.acquire_many(total).await;
        })
        .await;
        if drained.is_err() {
            warn!(grace = ?self.grace, "handlers still running at grace deadline");
        }

        let mut first_error = None;
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.close().await {
                first_error.get_or_insert(e);
            }
        }
        self.wait().await;
        for listener in &self.shared.listeners {
            listener.on_exit();
        }
        info!("worker stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
