//! Token-based provider clients and the tagged client handle.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use githook_core::{Error, Result};
use serde::Deserialize;

use crate::truncate_body;

/// Bitbucket OAuth token endpoint.
const BITBUCKET_TOKEN_URL: &str = "https://bitbucket.org/site/oauth2/access_token";

/// Minimal repository model shared by all providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Provider-side id.
    pub id: String,
    /// Owner login.
    pub owner: String,
    /// Short name.
    pub name: String,
    /// `owner/name`.
    pub full_name: String,
    /// Whether the repository is private.
    pub private: bool,
    /// Default branch.
    pub default_branch: String,
    /// Web URL.
    pub html_url: String,
}

/// Minimal commit model shared by all providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Commit sha.
    pub sha: String,
    /// Commit message.
    pub message: String,
    /// Author name, empty when the provider omits it.
    pub author_name: String,
    /// Author email, empty when the provider omits it.
    pub author_email: String,
    /// Web URL.
    pub html_url: String,
}

/// Authenticated handle for one provider's REST API.
///
/// A tagged variant per provider; worker code matches on the variant or
/// uses the typed accessors. The shared capability surface is
/// repository and commit lookup.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    /// GitHub App installation client.
    Github(crate::github::GithubClient),
    /// GitLab bearer-token client.
    Gitlab(GitlabClient),
    /// Bitbucket bearer-token client.
    Bitbucket(BitbucketClient),
    /// Any other token provider.
    Generic(GenericClient),
}

impl ProviderClient {
    /// Typed accessor for the GitHub variant.
    #[must_use]
    pub fn github(&self) -> Option<&crate::github::GithubClient> {
        match self {
            Self::Github(c) => Some(c),
            _ => None,
        }
    }

    /// Typed accessor for the GitLab variant.
    #[must_use]
    pub fn gitlab(&self) -> Option<&GitlabClient> {
        match self {
            Self::Gitlab(c) => Some(c),
            _ => None,
        }
    }

    /// Typed accessor for the Bitbucket variant.
    #[must_use]
    pub fn bitbucket(&self) -> Option<&BitbucketClient> {
        match self {
            Self::Bitbucket(c) => Some(c),
            _ => None,
        }
    }

    /// Typed accessor for the generic variant.
    #[must_use]
    pub fn generic(&self) -> Option<&GenericClient> {
        match self {
            Self::Generic(c) => Some(c),
            _ => None,
        }
    }

    /// Provider name for this client.
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        match self {
            Self::Github(_) => "github",
            Self::Gitlab(_) => "gitlab",
            Self::Bitbucket(_) => "bitbucket",
            Self::Generic(_) => "generic",
        }
    }

    /// Fetch a repository by owner and name, whatever the provider.
    ///
    /// # Errors
    ///
    /// Provider lookup errors as [`Error::NotFound`] /
    /// [`Error::Transport`].
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        match self {
            Self::Github(c) => c.get_repository(owner, name).await,
            Self::Gitlab(c) => c.get_repository(owner, name).await,
            Self::Bitbucket(c) => c.get_repository(owner, name).await,
            Self::Generic(c) => c.get_repository(owner, name).await,
        }
    }

    /// Fetch a commit by sha within `owner/name`.
    ///
    /// # Errors
    ///
    /// As for [`ProviderClient::get_repository`].
    pub async fn get_commit(&self, owner: &str, name: &str, sha: &str) -> Result<Commit> {
        match self {
            Self::Github(c) => c.get_commit(owner, name, sha).await,
            Self::Gitlab(c) => c.get_commit(owner, name, sha).await,
            Self::Bitbucket(c) => c.get_commit(owner, name, sha).await,
            Self::Generic(c) => c.get_commit(owner, name, sha).await,
        }
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: String,
    bearer: &str,
) -> Result<T> {
    let response = http
        .get(&url)
        .bearer_auth(bearer)
        .header(reqwest::header::USER_AGENT, "githook/1.0")
        .send()
        .await
        .map_err(Error::transport)?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::not_found("provider resource", url));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Transport(format!(
            "provider api {status}: {}",
            truncate_body(body)
        )));
    }
    response.json().await.map_err(Error::transport)
}

/// GitLab client bound to a bearer token and API base URL.
#[derive(Debug, Clone)]
pub struct GitlabClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitlabClient {
    pub(crate) fn new(http: reqwest::Client, base_url: &str, token: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Client from a token handed out by the control plane.
    #[must_use]
    pub fn from_token(base_url: &str, token: String) -> Self {
        let base = if base_url.is_empty() {
            "https://gitlab.com/api/v4"
        } else {
            base_url
        };
        Self::new(reqwest::Client::new(), base, token)
    }

    /// Fetch a project by `owner/name`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`].
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        #[derive(Deserialize)]
        struct Project {
            id: u64,
            path: String,
            path_with_namespace: String,
            #[serde(default)]
            visibility: String,
            #[serde(default)]
            default_branch: Option<String>,
            #[serde(default)]
            web_url: String,
        }
        let encoded = format!("{owner}%2F{name}");
        let p: Project = get_json(
            &self.http,
            format!("{}/projects/{encoded}", self.base_url),
            &self.token,
        )
        .await?;
        Ok(Repository {
            id: p.id.to_string(),
            owner: owner.to_string(),
            name: p.path,
            full_name: p.path_with_namespace,
            private: p.visibility != "public",
            default_branch: p.default_branch.unwrap_or_else(|| "main".to_string()),
            html_url: p.web_url,
        })
    }

    /// Fetch a commit by sha.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`].
    pub async fn get_commit(&self, owner: &str, name: &str, sha: &str) -> Result<Commit> {
        #[derive(Deserialize)]
        struct GitlabCommit {
            id: String,
            message: String,
            #[serde(default)]
            author_name: String,
            #[serde(default)]
            author_email: String,
            #[serde(default)]
            web_url: String,
        }
        let encoded = format!("{owner}%2F{name}");
        let c: GitlabCommit = get_json(
            &self.http,
            format!("{}/projects/{encoded}/repository/commits/{sha}", self.base_url),
            &self.token,
        )
        .await?;
        Ok(Commit {
            sha: c.id,
            message: c.message,
            author_name: c.author_name,
            author_email: c.author_email,
            html_url: c.web_url,
        })
    }
}

/// Bitbucket client bound to a bearer token.
#[derive(Debug, Clone)]
pub struct BitbucketClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl BitbucketClient {
    pub(crate) fn new(http: reqwest::Client, token: String) -> Self {
        Self {
            http,
            base_url: "https://api.bitbucket.org/2.0".to_string(),
            token,
        }
    }

    /// Client from a token handed out by the control plane.
    #[must_use]
    pub fn from_token(token: String) -> Self {
        Self::new(reqwest::Client::new(), token)
    }

    /// Fetch a repository by workspace and slug.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`].
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        #[derive(Deserialize)]
        struct BitbucketRepo {
            uuid: String,
            name: String,
            full_name: String,
            is_private: bool,
            #[serde(default)]
            mainbranch: Option<MainBranch>,
        }
        #[derive(Deserialize)]
        struct MainBranch {
            name: String,
        }
        let r: BitbucketRepo = get_json(
            &self.http,
            format!("{}/repositories/{owner}/{name}", self.base_url),
            &self.token,
        )
        .await?;
        Ok(Repository {
            id: r.uuid,
            owner: owner.to_string(),
            name: r.name,
            full_name: r.full_name.clone(),
            private: r.is_private,
            default_branch: r.mainbranch.map_or_else(|| "main".to_string(), |b| b.name),
            html_url: format!("https://bitbucket.org/{}", r.full_name),
        })
    }

    /// Fetch a commit by sha.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`].
    pub async fn get_commit(&self, owner: &str, name: &str, sha: &str) -> Result<Commit> {
        #[derive(Deserialize)]
        struct BitbucketCommit {
            hash: String,
            message: String,
            #[serde(default)]
            author: Option<BitbucketAuthor>,
        }
        #[derive(Deserialize)]
        struct BitbucketAuthor {
            #[serde(default)]
            raw: String,
        }
        let c: BitbucketCommit = get_json(
            &self.http,
            format!("{}/repositories/{owner}/{name}/commit/{sha}", self.base_url),
            &self.token,
        )
        .await?;
        Ok(Commit {
            sha: c.hash,
            message: c.message,
            author_name: c.author.map(|a| a.raw).unwrap_or_default(),
            author_email: String::new(),
            html_url: format!("https://bitbucket.org/{owner}/{name}/commits/{sha}"),
        })
    }
}

/// Client for token providers without a dedicated adapter.
#[derive(Debug, Clone)]
pub struct GenericClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GenericClient {
    pub(crate) fn new(http: reqwest::Client, base_url: &str, token: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Client from a token handed out by the control plane.
    #[must_use]
    pub fn from_token(base_url: &str, token: String) -> Self {
        Self::new(reqwest::Client::new(), base_url, token)
    }

    /// Fetch a repository assuming a GitHub-compatible API shape.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`].
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Repository> {
        #[derive(Deserialize)]
        struct Repo {
            id: u64,
            name: String,
            full_name: String,
            #[serde(default)]
            private: bool,
            #[serde(default)]
            default_branch: Option<String>,
            #[serde(default)]
            html_url: String,
        }
        let r: Repo = get_json(
            &self.http,
            format!("{}/repos/{owner}/{name}", self.base_url),
            &self.token,
        )
        .await?;
        Ok(Repository {
            id: r.id.to_string(),
            owner: owner.to_string(),
            name: r.name,
            full_name: r.full_name,
            private: r.private,
            default_branch: r.default_branch.unwrap_or_else(|| "main".to_string()),
            html_url: r.html_url,
        })
    }

    /// Fetch a commit assuming a GitHub-compatible API shape.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] / [`Error::Transport`].
    pub async fn get_commit(&self, owner: &str, name: &str, sha: &str) -> Result<Commit> {
        #[derive(Deserialize)]
        struct CommitResponse {
            sha: String,
            #[serde(default)]
            html_url: String,
            commit: Detail,
        }
        #[derive(Deserialize)]
        struct Detail {
            message: String,
        }
        let c: CommitResponse = get_json(
            &self.http,
            format!("{}/repos/{owner}/{name}/commits/{sha}", self.base_url),
            &self.token,
        )
        .await?;
        Ok(Commit {
            sha: c.sha,
            message: c.commit.message,
            author_name: String::new(),
            author_email: String::new(),
            html_url: c.html_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchange a Bitbucket refresh token for a fresh access token.
///
/// # Errors
///
/// [`Error::TokenExchange`] on a non-2xx response.
pub(crate) async fn bitbucket_refresh(
    http: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<String> {
    let basic = BASE64.encode(format!("{client_id}:{client_secret}"));
    let response = http
        .post(BITBUCKET_TOKEN_URL)
        .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
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

    let parsed: RefreshResponse = response.json().await.map_err(|e| Error::TokenExchange {
        status: status.as_u16(),
        body: format!("unparsable refresh response: {e}"),
    })?;
    let _ = parsed.expires_in;
    Ok(parsed.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn gitlab_repository_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/o%2Fr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 31,
                "path": "r",
                "path_with_namespace": "o/r",
                "visibility": "private",
                "default_branch": "main",
                "web_url": "https://gitlab.com/o/r"
            })))
            .mount(&server)
            .await;

        let client = GitlabClient::new(reqwest::Client::new(), &server.uri(), "tok".into());
        let repo = client.get_repository("o", "r").await.unwrap();
        assert_eq!(repo.id, "31");
        assert!(repo.private);
        assert_eq!(repo.default_branch, "main");
    }

    #[tokio::test]
    async fn missing_resources_map_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = GitlabClient::new(reqwest::Client::new(), &server.uri(), "tok".into());
        let err = client.get_repository("o", "gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn provider_accessors_are_exclusive() {
        let client = ProviderClient::Gitlab(GitlabClient::new(
            reqwest::Client::new(),
            "https://gitlab.com/api/v4",
            "tok".into(),
        ));
        assert!(client.gitlab().is_some());
        assert!(client.github().is_none());
        assert!(client.bitbucket().is_none());
        assert_eq!(client.provider(), "gitlab");
    }
}
