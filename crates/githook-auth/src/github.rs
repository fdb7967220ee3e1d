//! GitHub App authentication: RS256 App JWT and installation tokens.

use chrono::{DateTime, Utc};
use githook_core::{Error, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::{Commit, Repository};
use crate::{require_str, truncate_body};

/// Public GitHub API base.
const GITHUB_API_URL: &str = "https://api.github.com";

/// JWT clock skew allowance and validity, per GitHub's App guidance.
const JWT_BACKDATE_SECS: i64 = 60;
const JWT_VALIDITY_SECS: i64 = 570;

/// Credentials for one GitHub App (one provider instance).
#[derive(Debug, Clone)]
pub struct GithubAppConfig {
    /// GitHub App id.
    pub app_id: String,
    /// PEM-encoded RSA private key.
    pub private_key_pem: String,
    /// API base URL; enterprise installs point at `https://host/api/v3`.
    pub api_base_url: String,
}

impl GithubAppConfig {
    /// Extract the config from a provider-instance config blob.
    ///
    /// # Errors
    ///
    /// [`Error::AuthConfigMissing`] naming the first absent field.
    pub fn from_config(config: &Value) -> Result<Self> {
        Ok(Self {
            app_id: require_str(config, "app_id")?.to_string(),
            private_key_pem: require_str(config, "private_key")?.to_string(),
            api_base_url: config
                .get("api_base_url")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(GITHUB_API_URL)
                .to_string(),
        })
    }

    /// Upload URL derived from the API base; enterprise hosts swap
    /// `/api/v3` for `/api/uploads`.
    #[must_use]
    pub fn upload_url(&self) -> String {
        if self.api_base_url.ends_with("/api/v3") {
            self.api_base_url.replace("/api/v3", "/api/uploads")
        } else {
            "https://uploads.github.com".to_string()
        }
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Mint a short-lived RS256 App JWT.
///
/// `iat` is backdated 60 s against clock drift; `exp` stays inside
/// GitHub's 10-minute ceiling.
///
/// # Errors
///
/// [`Error::AuthConfigMissing`] when the private key does not parse.
pub fn mint_app_jwt(config: &GithubAppConfig) -> Result<String> {
    let key = EncodingKey::from_rsa_pem(config.private_key_pem.as_bytes()).map_err(|_| {
        Error::AuthConfigMissing {
            field: "private_key (invalid RSA PEM)".to_string(),
        }
    })?;
    let now = Utc::now().timestamp();
    let claims = AppClaims {
        iat: now - JWT_BACKDATE_SECS,
        exp: now + JWT_VALIDITY_SECS,
        iss: config.app_id.clone(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| Error::Other(format!("failed to sign app JWT: {e}")))
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchange an App JWT for an installation access token.
///
/// # Errors
///
/// [`Error::TokenExchange`] on a non-2xx response; the body is truncated
/// to 4 KiB.
pub(crate) async fn exchange_installation_token(
    http: &reqwest::Client,
    config: &GithubAppConfig,
    installation_id: &str,
) -> Result<(String, DateTime<Utc>)> {
    let jwt = mint_app_jwt(config)?;
    let url = format!(
        "{}/app/installations/{installation_id}/access_tokens",
        config.api_base_url
    );

    let response = http
        .post(&url)
        .bearer_auth(jwt)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .header(reqwest::header::USER_AGENT, "githook/1.0")
        .send()
        .await
        .map_err(|e| Error::TokenExchange {
            status: 0,
            body: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            body: truncate_body(body),
        });
    }

    let parsed: AccessTokenResponse =
        response.json().await.map_err(|e| Error::TokenExchange {
            status: status.as_u16(),
            body: format!("unparsable token response: {e}"),
        })?;
    Ok((parsed.token, parsed.expires_at))
}

/// GitHub REST client bound to one installation token.
///
/// Injects `Authorization: token …` on every call, the header form
/// installation tokens require.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GithubClient {
    pub(crate) fn new(http: reqwest::Client, config: GithubAppConfig, token: String) -> Self {
        Self {
            http,
            base_url: config.api_base_url,
            token,
        }
    }

    /// Client from an already-minted installation token, for consumers
    /// that receive tokens from the control plane instead of holding
    /// App credentials.
    #[must_use]
    pub fn from_token(api_base_url: &str, token: String) -> Self {
        let base = if api_base_url.is_empty() {
            GITHUB_API_URL
        } else {
            api_base_url
        };
        Self {
            http: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, "githook/1.0")
            .send()
            .await
            .map_err(Error::transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("github resource", path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "github api {status}: {}",
                truncate_body(body)
            )));
        }
        response.json().await.map_err(Error::transport)
    }

    /// Fetch a repository by owner and name.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a missing repo, [`Error::Transport`] on
    /// any other API failure.
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        #[derive(Deserialize)]
        struct Repo {
            id: u64,
            name: String,
            full_name: String,
            private: bool,
            #[serde(default)]
            default_branch: Option<String>,
            html_url: String,
        }
        let repo: Repo = self.get_json(&format!("/repos/{owner}/{name}")).await?;
        Ok(Repository {
            id: repo.id.to_string(),
            owner: owner.to_string(),
            name: repo.name,
            full_name: repo.full_name,
            private: repo.private,
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            html_url: repo.html_url,
        })
    }

    /// Fetch a commit by sha.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`] as for
    /// [`GithubClient::get_repository`].
    pub async fn get_commit(&self, owner: &str, name: &str, sha: &str) -> Result<Commit> {
        #[derive(Deserialize)]
        struct CommitDetail {
            message: String,
            author: Option<CommitAuthor>,
        }
        #[derive(Deserialize)]
        struct CommitAuthor {
            name: Option<String>,
            email: Option<String>,
        }
        #[derive(Deserialize)]
        struct CommitResponse {
            sha: String,
            commit: CommitDetail,
            html_url: String,
        }

        let c: CommitResponse = self
            .get_json(&format!("/repos/{owner}/{name}/commits/{sha}"))
            .await?;
        let author = c.commit.author.unwrap_or(CommitAuthor {
            name: None,
            email: None,
        });
        Ok(Commit {
            sha: c.sha,
            message: c.commit.message,
            author_name: author.name.unwrap_or_default(),
            author_email: author.email.unwrap_or_default(),
            html_url: c.html_url,
        })
    }

    /// The installation token this client authenticates with.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}
