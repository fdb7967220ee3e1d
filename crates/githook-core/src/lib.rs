//! Shared types for the githook event pipeline.
//!
//! Everything that crosses a crate boundary lives here: the in-flight
//! [`Event`], the wire [`envelope`], the [`Error`] taxonomy, tenant
//! scoping, and the event-log status machine.

pub mod envelope;
pub mod error;
pub mod event;
pub mod status;
pub mod tenant;

pub use envelope::EventPayload;
pub use error::{Error, Result};
pub use event::{Event, Message};
pub use status::EventStatus;
pub use tenant::TenantCtx;

/// Metadata keys attached to every published broker message.
pub mod meta {
    /// Event-log row id.
    pub const LOG_ID: &str = "log_id";
    /// Provider name (`github`, `gitlab`, `bitbucket`, ...).
    pub const PROVIDER: &str = "provider";
    /// Event name, e.g. `pull_request`.
    pub const EVENT: &str = "event";
    /// Emit topic the message was routed to.
    pub const TOPIC: &str = "topic";
    /// Driver name that carried the message.
    pub const DRIVER: &str = "driver";
    /// Installation id (may be empty).
    pub const INSTALLATION_ID: &str = "installation_id";
    /// Provider-instance key.
    pub const PROVIDER_INSTANCE_KEY: &str = "provider_instance_key";
    /// Request id from ingress.
    pub const REQUEST_ID: &str = "request_id";
    /// Tenant id (may be empty for the global scope).
    pub const TENANT_ID: &str = "tenant_id";
    /// Queue-driver job id (RiverQueue).
    pub const JOB_ID: &str = "job_id";
    /// Queue-driver queue name.
    pub const QUEUE: &str = "queue";
    /// Queue-driver job kind.
    pub const KIND: &str = "kind";
}
