//! Server configuration from the environment.

use std::env;

/// Webhook server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Maximum accepted webhook body, in bytes.
    pub max_body_bytes: usize,
    /// Abort startup on an invalid rule instead of discarding it.
    pub strict_rules: bool,
    /// Accept GitHub's legacy SHA-1 signature header.
    pub allow_legacy_signature: bool,
    /// Delivery-id dedup window in seconds; 0 disables dedup.
    pub dedup_ttl_secs: u64,
    /// API key the control-plane endpoints require, when set.
    pub api_key: Option<String>,
    /// Where `GET /` redirects to start an OAuth install.
    pub oauth_start_url: Option<String>,
    /// Emit JSON logs.
    pub log_json: bool,
    /// Seconds existing requests get to finish on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: env::var("GITHOOK_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            max_body_bytes: env::var("GITHOOK_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024 * 1024),
            strict_rules: env::var("GITHOOK_STRICT_RULES")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            allow_legacy_signature: env::var("GITHOOK_ALLOW_LEGACY_SIGNATURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            dedup_ttl_secs: env::var("GITHOOK_DEDUP_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(600),
            api_key: env::var("GITHOOK_API_KEY").ok().filter(|s| !s.is_empty()),
            oauth_start_url: env::var("GITHOOK_OAUTH_START_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            log_json: env::var("GITHOOK_LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            shutdown_grace_secs: env::var("GITHOOK_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        }
    }
}
