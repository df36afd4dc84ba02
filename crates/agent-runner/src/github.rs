//! Source-host access: installation tokens and pull requests
//!
//! Talks to the GitHub REST API as a GitHub App. Repository access is
//! always through short-lived installation tokens scoped to a single
//! repository.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};

const DEFAULT_API_URL: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;

/// Fields of a pull request to open
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    #[serde(default)]
    pub state: String,
    /// `None` while GitHub is still computing mergeability
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub merged: bool,
}

/// Operations the orchestrator needs from the source host
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Mint a token scoped to one repository, searching the given
    /// installations for the one that grants access. `None` if none does.
    async fn repository_token(
        &self,
        installation_ids: &[u64],
        repository_full_name: &str,
    ) -> Result<Option<String>>;

    /// HTTPS clone/push URL, with the token embedded when given
    fn clone_url(&self, repository_full_name: &str, token: Option<&str>) -> String;

    async fn create_pull_request(
        &self,
        token: &str,
        repository_full_name: &str,
        pull: &NewPullRequest,
    ) -> Result<PullRequest>;

    async fn get_pull_request(
        &self,
        token: &str,
        repository_full_name: &str,
        number: u64,
    ) -> Result<PullRequest>;

    /// Merge a pull request; `false` when GitHub refuses (not mergeable)
    async fn merge_pull_request(
        &self,
        token: &str,
        repository_full_name: &str,
        number: u64,
        commit_title: &str,
    ) -> Result<bool>;
}

/// GitHub App identity
#[derive(Debug, Clone)]
pub struct GithubAppConfig {
    pub app_id: String,
    /// PEM-encoded RSA private key
    pub private_key_pem: String,
    pub api_url: String,
}

impl GithubAppConfig {
    pub fn new(app_id: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            private_key_pem: private_key_pem.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositories {
    #[serde(default)]
    repositories: Vec<InstallationRepository>,
}

#[derive(Debug, Deserialize)]
struct InstallationRepository {
    full_name: String,
}

/// REST client for GitHub acting as a GitHub App
pub struct GithubClient {
    http: Client,
    app: Option<GithubAppConfig>,
    web_host: String,
}

impl GithubClient {
    /// Without an app config every token lookup yields `None`
    pub fn new(app: Option<GithubAppConfig>) -> Self {
        let web_host = app
            .as_ref()
            .map(|a| web_host_for(&a.api_url))
            .unwrap_or_else(|| "github.com".to_string());
        Self {
            http: Client::builder()
                .user_agent("agentbox")
                .build()
                .unwrap_or_else(|_| Client::new()),
            app,
            web_host,
        }
    }

    fn api_url(&self) -> &str {
        self.app
            .as_ref()
            .map(|a| a.api_url.trim_end_matches('/'))
            .unwrap_or(DEFAULT_API_URL)
    }

    /// Short-lived JWT identifying the app itself
    fn app_jwt(&self, app: &GithubAppConfig) -> Result<String> {
        let now = Utc::now();
        let claims = AppClaims {
            // Backdated to tolerate clock drift
            iat: (now - Duration::seconds(60)).timestamp(),
            exp: (now + Duration::minutes(9)).timestamp(),
            iss: app.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(app.private_key_pem.as_bytes())
            .map_err(|e| ExecutorError::source_host(format!("Invalid GitHub App key: {}", e)))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ExecutorError::source_host(format!("Failed to sign app JWT: {}", e)))
    }

    fn request(&self, builder: RequestBuilder, bearer: &str) -> RequestBuilder {
        builder
            .bearer_auth(bearer)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn mint_installation_token(
        &self,
        app: &GithubAppConfig,
        installation_id: u64,
        repository: Option<&str>,
    ) -> Result<String> {
        let jwt = self.app_jwt(app)?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url(),
            installation_id
        );
        let body = match repository {
            Some(repo) => json!({
                "repositories": [repo],
                "permissions": { "contents": "write", "pull_requests": "write" }
            }),
            None => json!({}),
        };

        let response = self
            .request(self.http.post(&url), &jwt)
            .json(&body)
            .send()
            .await?;
        let token: InstallationToken = check(response, "mint installation token").await?.json().await?;
        Ok(token.token)
    }

    async fn installation_has_repository(&self, token: &str, full_name: &str) -> Result<bool> {
        let mut page = 1;
        loop {
            let url = format!(
                "{}/installation/repositories?per_page={}&page={}",
                self.api_url(),
                PAGE_SIZE,
                page
            );
            let response = self.request(self.http.get(&url), token).send().await?;
            let listing: InstallationRepositories =
                check(response, "list installation repositories").await?.json().await?;

            if listing
                .repositories
                .iter()
                .any(|r| r.full_name.eq_ignore_ascii_case(full_name))
            {
                return Ok(true);
            }
            if listing.repositories.len() < PAGE_SIZE {
                return Ok(false);
            }
            page += 1;
        }
    }
}

/// `api.github.com` -> `github.com`; GHES `host/api/v3` -> `host`
fn web_host_for(api_url: &str) -> String {
    let host = api_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or("github.com");
    host.strip_prefix("api.").unwrap_or(host).to_string()
}

async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExecutorError::source_host(format!(
        "{} failed with {}: {}",
        what,
        status,
        body.chars().take(500).collect::<String>()
    )))
}

#[async_trait]
impl SourceHost for GithubClient {
    async fn repository_token(
        &self,
        installation_ids: &[u64],
        repository_full_name: &str,
    ) -> Result<Option<String>> {
        let Some(app) = &self.app else {
            warn!("GitHub App is not configured; no repository token available");
            return Ok(None);
        };
        let repo_name = repository_full_name
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(repository_full_name);

        for &installation_id in installation_ids {
            let listing_token = match self.mint_installation_token(app, installation_id, None).await {
                Ok(token) => token,
                Err(e) => {
                    warn!("Skipping installation {}: {}", installation_id, e);
                    continue;
                }
            };
            match self
                .installation_has_repository(&listing_token, repository_full_name)
                .await
            {
                Ok(true) => {
                    debug!(
                        "Installation {} grants access to {}",
                        installation_id, repository_full_name
                    );
                    let token = self
                        .mint_installation_token(app, installation_id, Some(repo_name))
                        .await?;
                    return Ok(Some(token));
                }
                Ok(false) => {}
                Err(e) => warn!("Skipping installation {}: {}", installation_id, e),
            }
        }

        Ok(None)
    }

    fn clone_url(&self, repository_full_name: &str, token: Option<&str>) -> String {
        match token {
            Some(token) => format!(
                "https://x-access-token:{}@{}/{}.git",
                token, self.web_host, repository_full_name
            ),
            None => format!("https://{}/{}.git", self.web_host, repository_full_name),
        }
    }

    async fn create_pull_request(
        &self,
        token: &str,
        repository_full_name: &str,
        pull: &NewPullRequest,
    ) -> Result<PullRequest> {
        let url = format!("{}/repos/{}/pulls", self.api_url(), repository_full_name);
        let response = self
            .request(self.http.post(&url), token)
            .json(pull)
            .send()
            .await?;
        let created: PullRequest = check(response, "create pull request").await?.json().await?;
        info!("Opened pull request {}", created.html_url);
        Ok(created)
    }

    async fn get_pull_request(
        &self,
        token: &str,
        repository_full_name: &str,
        number: u64,
    ) -> Result<PullRequest> {
        let url = format!(
            "{}/repos/{}/pulls/{}",
            self.api_url(),
            repository_full_name,
            number
        );
        let response = self.request(self.http.get(&url), token).send().await?;
        Ok(check(response, "get pull request").await?.json().await?)
    }

    async fn merge_pull_request(
        &self,
        token: &str,
        repository_full_name: &str,
        number: u64,
        commit_title: &str,
    ) -> Result<bool> {
        let url = format!(
            "{}/repos/{}/pulls/{}/merge",
            self.api_url(),
            repository_full_name,
            number
        );
        let response = self
            .request(self.http.put(&url), token)
            .json(&json!({ "merge_method": "squash", "commit_title": commit_title }))
            .send()
            .await?;

        match response.status() {
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => Ok(false),
            _ => {
                check(response, "merge pull request").await?;
                Ok(true)
            }
        }
    }
}
