//! Retry policy: what happens when a handler fails.

use async_trait::async_trait;
use githook_core::{Error, Event};

/// Decision returned by [`RetryPolicy::on_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether the message should be attempted again.
    pub retry: bool,
    /// Whether the transport should be asked to redeliver (nack).
    ///
    /// Only honored on transports that support requeueing (AMQP);
    /// elsewhere the message is acked and the event log keeps `failed`.
    pub nack: bool,
}

impl RetryDecision {
    /// Ack and record the failure.
    #[must_use]
    pub const fn give_up() -> Self {
        Self {
            retry: false,
            nack: false,
        }
    }

    /// Nack so the transport redelivers.
    #[must_use]
    pub const fn requeue() -> Self {
        Self {
            retry: true,
            nack: true,
        }
    }
}

/// Decides retry behavior per failed message.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Called with the failed event and the handler error.
    async fn on_error(&self, event: &Event, error: &Error) -> RetryDecision;
}

/// Ack every failure; the event log keeps the terminal `failed` state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverRetry;

#[async_trait]
impl RetryPolicy for NeverRetry {
    async fn on_error(&self, _event: &Event, _error: &Error) -> RetryDecision {
        RetryDecision::give_up()
    }
}

/// Nack every failure so requeue-capable transports redeliver.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRequeue;

#[async_trait]
impl RetryPolicy for AlwaysRequeue {
    async fn on_error(&self, _event: &Event, _error: &Error) -> RetryDecision {
        RetryDecision::requeue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtin_policies() {
        let event = Event::default();
        let error = Error::Other("boom".into());
        assert_eq!(
            NeverRetry.on_error(&event, &error).await,
            RetryDecision::give_up()
        );
        assert_eq!(
            AlwaysRequeue.on_error(&event, &error).await,
            RetryDecision::requeue()
        );
    }
}
