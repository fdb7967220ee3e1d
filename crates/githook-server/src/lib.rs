//! Webhook ingestion server.
//!
//! Receives provider webhooks, authenticates them against the stored
//! provider instances, normalizes the payloads, matches them through
//! the rule engine, records event-log rows, and publishes the matched
//! topics through the publisher cache.

pub mod api;
pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod providers;
pub mod routes;
pub mod signature;
pub mod state;

pub use config::ServerConfig;
pub use routes::build_router;
pub use state::AppState;
