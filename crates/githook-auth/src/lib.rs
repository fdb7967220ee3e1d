//! Provider authentication: stored credentials in, live API clients out.
//!
//! The [`Authenticator`] turns `(provider instance, installation)` pairs
//! into a [`ProviderClient`] ready for API calls. GitHub App installs go
//! through the App-JWT → installation-token exchange with a single-flight
//! token cache; the token providers (GitLab, Bitbucket, generic) bind a
//! stored token to the configured base URL.

mod clients;
mod github;

pub use clients::{
    BitbucketClient, Commit, GenericClient, GitlabClient, ProviderClient, Repository,
};
pub use github::{GithubAppConfig, GithubClient};

use chrono::Utc;
use githook_core::{Error, Result, TenantCtx};
use githook_store::{InstallationRecord, ProviderInstanceRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Maximum provider error body carried into an error message.
pub(crate) const ERROR_BODY_LIMIT: usize = 4096;

pub(crate) fn truncate_body(body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    } else {
        body
    }
}

pub(crate) fn require_str<'a>(config: &'a Value, field: &str) -> Result<&'a str> {
    config
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::AuthConfigMissing {
            field: field.to_string(),
        })
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct TokenKey {
    tenant: TenantCtx,
    provider: String,
    instance_key: String,
    installation_id: String,
}

struct CachedToken {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

impl CachedToken {
    fn is_valid(&self, margin_secs: i64) -> bool {
        Utc::now() + chrono::Duration::seconds(margin_secs) < self.expires_at
    }
}

/// Builds authenticated provider clients from stored credentials.
///
/// One instance per process; the installation-token cache inside is
/// keyed by `(tenant, provider, instance_key, installation_id)` and
/// construction is single-flight per key.
pub struct Authenticator {
    http: reqwest::Client,
    tokens: Mutex<HashMap<TokenKey, CachedToken>>,
    locks: Mutex<HashMap<TokenKey, Arc<Mutex<()>>>>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    /// Create an authenticator with its own HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a live client for `installation` under `instance`.
    ///
    /// # Errors
    ///
    /// [`Error::AuthConfigMissing`] when required credential fields are
    /// absent; [`Error::TokenExchange`] when the provider's token
    /// endpoint rejects the exchange.
    pub async fn client_for(
        &self,
        instance: &ProviderInstanceRecord,
        installation: &InstallationRecord,
    ) -> Result<ProviderClient> {
        match instance.provider.as_str() {
            "github" => {
                let config = GithubAppConfig::from_config(&instance.config)?;
                let token = self
                    .github_installation_token(instance, installation, &config)
                    .await?;
                Ok(ProviderClient::Github(GithubClient::new(
                    self.http.clone(),
                    config,
                    token,
                )))
            }
            "gitlab" => {
                let token = stored_token(installation, &instance.config)?;
                let base_url = instance
                    .config
                    .get("api_base_url")
                    .and_then(Value::as_str)
                    .unwrap_or("https://gitlab.com/api/v4");
                Ok(ProviderClient::Gitlab(GitlabClient::new(
                    self.http.clone(),
                    base_url,
                    token,
                )))
            }
            "bitbucket" => {
                let token = self.bitbucket_token(instance, installation).await?;
                Ok(ProviderClient::Bitbucket(BitbucketClient::new(
                    self.http.clone(),
                    token,
                )))
            }
            _ => {
                let token = stored_token(installation, &instance.config)?;
                let base_url = require_str(&instance.config, "api_base_url")?;
                Ok(ProviderClient::Generic(GenericClient::new(
                    self.http.clone(),
                    base_url,
                    token,
                )))
            }
        }
    }

    /// Cached GitHub installation token, exchanging a fresh one when the
    /// cache misses or is about to expire.
    async fn github_installation_token(
        &self,
        instance: &ProviderInstanceRecord,
        installation: &InstallationRecord,
        config: &GithubAppConfig,
    ) -> Result<String> {
        let key = TokenKey {
            tenant: instance.tenant.clone(),
            provider: instance.provider.clone(),
            instance_key: instance.key.clone(),
            installation_id: installation.installation_id.clone(),
        };

        if let Some(cached) = self.tokens.lock().await.get(&key) {
            if cached.is_valid(60) {
                return Ok(cached.token.clone());
            }
        }

        // Single-flight: one exchange per key, concurrent callers wait.
        let gate = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _guard = gate.lock().await;

        if let Some(cached) = self.tokens.lock().await.get(&key) {
            if cached.is_valid(60) {
                return Ok(cached.token.clone());
            }
        }

        debug!(
            installation_id = %installation.installation_id,
            instance_key = %instance.key,
            "exchanging GitHub App JWT for installation token"
        );
        let (token, expires_at) = github::exchange_installation_token(
            &self.http,
            config,
            &installation.installation_id,
        )
        .await?;

        self.tokens.lock().await.insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }

    /// Bitbucket access token, refreshing through the OAuth endpoint
    /// when the stored token has expired and a refresh token exists.
    async fn bitbucket_token(
        &self,
        instance: &ProviderInstanceRecord,
        installation: &InstallationRecord,
    ) -> Result<String> {
        let expired = installation
            .expires_at
            .is_some_and(|at| at <= Utc::now() + chrono::Duration::seconds(60));

        if !expired {
            if let Some(token) = installation.access_token.as_deref().filter(|t| !t.is_empty()) {
                return Ok(token.to_string());
            }
        }

        let refresh = installation
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(Error::AuthConfigMissing {
                field: "refresh_token".to_string(),
            })?;
        let client_id = require_str(&instance.config, "client_id")?;
        let client_secret = require_str(&instance.config, "client_secret")?;

        clients::bitbucket_refresh(&self.http, client_id, client_secret, refresh).await
    }
}

/// Static token from the installation record, falling back to the
/// provider-instance config.
fn stored_token(installation: &InstallationRecord, config: &Value) -> Result<String> {
    if let Some(token) = installation.access_token.as_deref().filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    require_str(config, "access_token").map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_names_the_missing_field() {
        let config = json!({"app_id": "7"});
        let err = require_str(&config, "private_key").unwrap_err();
        assert!(matches!(err, Error::AuthConfigMissing { ref field } if field == "private_key"));
        // Empty strings count as missing.
        let config = json!({"private_key": ""});
        assert!(require_str(&config, "private_key").is_err());
    }

    #[test]
    fn truncate_body_caps_at_limit() {
        let body = "x".repeat(ERROR_BODY_LIMIT + 100);
        assert_eq!(truncate_body(body).len(), ERROR_BODY_LIMIT);
        assert_eq!(truncate_body("short".into()), "short");
    }
}
