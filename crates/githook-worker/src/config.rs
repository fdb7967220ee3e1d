//! Worker configuration from the environment and optional config file.

use githook_core::{Error, Result};
use serde::Deserialize;
use std::env;

/// One topic bound to the driver that carries it.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicBinding {
    /// Emit topic to subscribe to.
    pub topic: String,
    /// Driver id resolved through the control plane.
    pub driver_id: String,
}

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Control-plane base URL.
    pub endpoint: String,
    /// API key for the control plane; alternatively a bearer token.
    pub api_key: Option<String>,
    /// OAuth2/OIDC bearer token, when not using an API key.
    pub bearer_token: Option<String>,
    /// Tenant this worker operates for.
    pub tenant: String,
    /// Maximum concurrently running handlers.
    pub concurrency: usize,
    /// Seconds in-flight handlers get on shutdown.
    pub grace_secs: u64,
    /// Static topic bindings loaded from the config file.
    pub bindings: Vec<TopicBinding>,
    /// Optional path for the provider-token cache file.
    pub token_cache_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    bindings: Vec<TopicBinding>,
}

impl WorkerConfig {
    /// Configuration for `endpoint` with defaults everywhere else.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            bearer_token: None,
            tenant: String::new(),
            concurrency: 8,
            grace_secs: 30,
            bindings: Vec::new(),
            token_cache_path: None,
        }
    }

    /// Load from `GITHOOK_*` environment variables, merging the YAML
    /// config file named by `GITHOOK_CONFIG_PATH` when present.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when no endpoint is configured or the
    /// config file does not parse.
    pub fn from_env() -> Result<Self> {
        let endpoint = env::var("GITHOOK_ENDPOINT")
            .or_else(|_| env::var("GITHOOK_API_BASE_URL"))
            .map_err(|_| Error::InvalidConfig {
                scope: "worker".to_string(),
                message: "GITHOOK_ENDPOINT (or GITHOOK_API_BASE_URL) is required".to_string(),
            })?;

        let mut config = Self::new(endpoint);
        config.api_key = env::var("GITHOOK_API_KEY").ok().filter(|s| !s.is_empty());
        config.tenant = env::var("GITHOOK_TENANT_ID").unwrap_or_default();
        config.token_cache_path = env::var("GITHOOK_TOKEN_CACHE").ok().filter(|s| !s.is_empty());
        if let Ok(c) = env::var("GITHOOK_CONCURRENCY") {
            if let Ok(parsed) = c.parse() {
                config.concurrency = parsed;
            }
        }

        if let Ok(path) = env::var("GITHOOK_CONFIG_PATH") {
            let raw = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
                scope: "worker".to_string(),
                message: format!("reading {path}: {e}"),
            })?;
            let file: FileConfig =
                serde_yaml::from_str(&raw).map_err(|e| Error::InvalidConfig {
                    scope: "worker".to_string(),
                    message: format!("parsing {path}: {e}"),
                })?;
            if let Some(concurrency) = file.concurrency {
                config.concurrency = concurrency;
            }
            config.bindings = file.bindings;
        }

        config.validate()?;
        Ok(config)
    }

    /// Enforce the invariants the runtime depends on.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when `concurrency` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig {
                scope: "worker".to_string(),
                message: "concurrency must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
