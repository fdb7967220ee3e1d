//! Worker SDK for the githook event pipeline.
//!
//! A worker subscribes to emit topics across one or more broker
//! transports, decodes the wire envelope into an [`EventContext`],
//! attaches an authenticated provider client, and dispatches to the
//! registered handlers. Handler failures go through the
//! [`RetryPolicy`]; event-log rows are completed via the control-plane
//! API.
//!
//! ```no_run
//! use githook_worker::{Worker, WorkerConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> githook_core::Result<()> {
//! let worker = Worker::builder(WorkerConfig::from_env()?)
//!     .handle("pr.opened.ready", Arc::new(|ctx| {
//!         Box::pin(async move {
//!             println!("PR event: {}", ctx.event.kind);
//!             Ok(())
//!         })
//!     }))
//!     .start()
//!     .await?;
//! worker.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod retry;
pub mod runtime;

pub use client::ControlPlaneClient;
pub use config::{TopicBinding, WorkerConfig};
pub use retry::{AlwaysRequeue, NeverRetry, RetryDecision, RetryPolicy};
pub use runtime::{Worker, WorkerBuilder};

use async_trait::async_trait;
use futures::future::BoxFuture;
use githook_auth::ProviderClient;
use githook_core::{Event, Result};
use std::sync::Arc;

/// A decoded event plus the provider client attached for it.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// The decoded event.
    pub event: Event,
    /// Authenticated provider API client, when a [`ClientProvider`] is
    /// configured and resolution succeeded.
    pub client: Option<ProviderClient>,
}

/// Topic/type handler: the unit of work the SDK dispatches to.
pub type Handler = Arc<dyn Fn(EventContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Middleware wraps a handler and returns a new handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Produces provider API clients for incoming events.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Resolve a client for `event`; failures are treated as handler
    /// errors and go through the retry policy.
    async fn client_for(&self, event: &Event) -> Result<ProviderClient>;
}

/// Observation hooks around the worker lifecycle.
///
/// Listeners observe; they never influence control flow, and a panicky
/// listener is a bug in the listener.
pub trait Listener: Send + Sync {
    /// The worker finished startup and subscribed to its topics.
    fn on_start(&self) {}
    /// The worker fully shut down.
    fn on_exit(&self) {}
    /// A message entered the handler path.
    fn on_message_start(&self, _topic: &str) {}
    /// A message left the handler path.
    fn on_message_finish(&self, _topic: &str, _ok: bool) {}
    /// An error surfaced anywhere in the message path.
    fn on_error(&self, _error: &githook_core::Error) {}
}
