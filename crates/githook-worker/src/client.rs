//! Control-plane HTTP client.

use async_trait::async_trait;
use githook_auth::{BitbucketClient, GenericClient, GithubClient, GitlabClient, ProviderClient};
use githook_core::{Error, Event, EventStatus, Result};
use githook_store::{DriverRecord, InstallationRecord, RuleRecord};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::ClientProvider;

/// Typed client over the control-plane API (`/api/v1`).
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    bearer_token: Option<String>,
    tenant: String,
}

impl ControlPlaneClient {
    /// Client for the control plane `config` points at.
    #[must_use]
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            bearer_token: config.bearer_token.clone(),
            tenant: config.tenant.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.endpoint))
            .header("x-tenant-id", &self.tenant);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(Error::transport)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("control-plane resource", path.to_string()));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("control plane {status} for {path}")));
        }
        response.json().await.map_err(Error::transport)
    }

    /// All rules for the worker's tenant.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] on API failure.
    pub async fn list_rules(&self) -> Result<Vec<RuleRecord>> {
        #[derive(Deserialize)]
        struct Rules {
            rules: Vec<RuleRecord>,
        }
        Ok(self.get_json::<Rules>("/api/v1/rules").await?.rules)
    }

    /// One rule by id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the rule does not exist.
    pub async fn get_rule(&self, id: &str) -> Result<RuleRecord> {
        #[derive(Deserialize)]
        struct Rule {
            rule: RuleRecord,
        }
        Ok(self.get_json::<Rule>(&format!("/api/v1/rules/{id}")).await?.rule)
    }

    /// All drivers for the worker's tenant.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] on API failure.
    pub async fn list_drivers(&self) -> Result<Vec<DriverRecord>> {
        #[derive(Deserialize)]
        struct Drivers {
            drivers: Vec<DriverRecord>,
        }
        Ok(self.get_json::<Drivers>("/api/v1/drivers").await?.drivers)
    }

    /// One driver by id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the driver does not exist.
    pub async fn get_driver(&self, id: &str) -> Result<DriverRecord> {
        #[derive(Deserialize)]
        struct Driver {
            driver: DriverRecord,
        }
        Ok(self
            .get_json::<Driver>(&format!("/api/v1/drivers/{id}"))
            .await?
            .driver)
    }

    /// Transition an event-log row.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a missing row, [`Error::Transport`] on
    /// API failure.
    pub async fn update_event_log_status(
        &self,
        log_id: &str,
        status: EventStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/event-logs/{log_id}/status"),
            )
            .json(&json!({
                "status": status,
                "error_message": error_message,
            }))
            .send()
            .await
            .map_err(Error::transport)?;
        let status_code = response.status();
        if status_code == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("event_log", log_id.to_string()));
        }
        if !status_code.is_success() {
            return Err(Error::Transport(format!(
                "control plane {status_code} updating event log {log_id}"
            )));
        }
        Ok(())
    }

    /// One installation by provider-side id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the installation does not exist.
    pub async fn get_installation(
        &self,
        provider: &str,
        installation_id: &str,
    ) -> Result<InstallationRecord> {
        #[derive(Deserialize)]
        struct Installation {
            installation: InstallationRecord,
        }
        Ok(self
            .get_json::<Installation>(&format!(
                "/api/v1/installations/{provider}/{installation_id}"
            ))
            .await?
            .installation)
    }

    /// A live SCM token for `installation_id`, exchanged server-side.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`] on API failure.
    pub async fn get_scm_client(
        &self,
        provider: &str,
        installation_id: &str,
    ) -> Result<ScmClientGrant> {
        self.get_json(&format!("/api/v1/scm-client/{provider}/{installation_id}"))
            .await
    }
}

/// Token grant returned by `GetSCMClient`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScmClientGrant {
    /// Provider name.
    pub provider: String,
    /// Installation the token is scoped to.
    pub installation_id: String,
    /// Provider API base URL; empty means the public default.
    #[serde(default)]
    pub api_base_url: String,
    /// Short-lived access token.
    pub token: String,
}

impl ScmClientGrant {
    /// Build the provider client this grant describes.
    #[must_use]
    pub fn into_client(self) -> ProviderClient {
        match self.provider.as_str() {
            "github" => {
                ProviderClient::Github(GithubClient::from_token(&self.api_base_url, self.token))
            }
            "gitlab" => {
                ProviderClient::Gitlab(GitlabClient::from_token(&self.api_base_url, self.token))
            }
            "bitbucket" => ProviderClient::Bitbucket(BitbucketClient::from_token(self.token)),
            _ => ProviderClient::Generic(GenericClient::from_token(&self.api_base_url, self.token)),
        }
    }
}

/// [`ClientProvider`] backed by the control plane.
pub struct ControlPlaneClientProvider {
    client: ControlPlaneClient,
}

impl ControlPlaneClientProvider {
    /// Provider resolving clients through `client`.
    #[must_use]
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClientProvider for ControlPlaneClientProvider {
    async fn client_for(&self, event: &Event) -> Result<ProviderClient> {
        let installation_id = event.installation_id();
        if installation_id.is_empty() {
            return Err(Error::not_found("installation", "(none on event)"));
        }
        debug!(
            provider = %event.provider,
            installation_id = %installation_id,
            "resolving scm client"
        );
        let grant = self
            .client
            .get_scm_client(&event.provider, installation_id)
            .await?;
        Ok(grant.into_client())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new(endpoint);
        config.api_key = Some("key-1".into());
        config.tenant = "acme".into();
        config
    }

    #[tokio::test]
    async fn list_rules_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/rules"))
            .and(header("x-api-key", "key-1"))
            .and(header("x-tenant-id", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rules": [{
                    "tenant": "acme",
                    "id": "r1",
                    "when": "action == \"opened\"",
                    "emit": ["pr.opened"],
                    "driver_id": "d1"
                }]
            })))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(&config(&server.uri()));
        let rules = client.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r1");
        assert_eq!(rules[0].emit, vec!["pr.opened"]);
    }

    #[tokio::test]
    async fn missing_rule_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(&config(&server.uri()));
        let err = client.get_rule("gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn status_update_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/event-logs/log-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(&config(&server.uri()));
        client
            .update_event_log_status("log-1", EventStatus::Success, None)
            .await
            .unwrap();
    }

    #[test]
    fn grant_builds_the_right_client_variant() {
        let grant = ScmClientGrant {
            provider: "github".into(),
            installation_id: "42".into(),
            api_base_url: String::new(),
            token: "tok".into(),
        };
        assert!(grant.into_client().github().is_some());

        let grant = ScmClientGrant {
            provider: "gitlab".into(),
            installation_id: "42".into(),
            api_base_url: String::new(),
            token: "tok".into(),
        };
        assert!(grant.into_client().gitlab().is_some());
    }

    #[tokio::test]
    async fn client_provider_requires_installation_id() {
        let server = MockServer::start().await;
        let provider = ControlPlaneClientProvider::new(ControlPlaneClient::new(&config(&server.uri())));
        let mut event = Event::default();
        event.provider = "github".into();
        event.metadata = HashMap::new();
        let err = provider.client_for(&event).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
