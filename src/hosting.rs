//! Hosting provider access: repository lookup, creation, visibility and deletion
//!
//! The engine only talks to hosting through [`HostingProvider`] and
//! [`CredentialProvider`]; [`GitHubProvider`] and [`GitHubCredentials`] are the
//! production implementations.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::env;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::HostingConfig;
use crate::error::{Result, SyncError};
use crate::git::{parse_repo_slug, strip_credential};

/// A repository on the hosting provider, fetched on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub owner: String,
    pub name: String,
    /// Canonical clone URL without credentials
    pub clone_url: String,
    pub private: bool,
}

/// Entry point to a hosting provider
#[async_trait]
pub trait HostingProvider: Send + Sync {
    /// Authenticate with `token` and open a session as that identity
    async fn connect(&self, token: &str) -> Result<Box<dyn HostingSession>>;
}

/// An authenticated hosting session
#[async_trait]
pub trait HostingSession: Send + Sync {
    /// Login of the authenticated identity
    fn login(&self) -> &str;

    async fn find_repository(&self, owner: &str, name: &str) -> Result<Option<RemoteRepository>>;

    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        description: Option<&str>,
    ) -> Result<RemoteRepository>;

    /// Number of commits on the default branch, `None` when unknown
    async fn commit_count(&self, repo: &RemoteRepository) -> Result<Option<u64>>;

    /// Change visibility; `RepositoryNotFound` when the repository is gone
    async fn set_private(&self, owner: &str, name: &str, private: bool) -> Result<RemoteRepository>;

    /// Delete a repository. Returns `false` when it was already gone.
    async fn delete_repository(&self, owner: &str, name: &str) -> Result<bool>;
}

/// Source of the hosting token
pub trait CredentialProvider: Send + Sync {
    fn get_hosting_token(&self) -> Option<String>;
}

/// Whether the hosted repository behind `remote_url` is private
pub async fn get_visibility(
    hosting: &dyn HostingProvider,
    token: &str,
    remote_url: &str,
) -> Result<bool> {
    let (owner, name) = resolve_slug(remote_url)?;
    let session = hosting.connect(token).await?;

    match session.find_repository(&owner, &name).await? {
        Some(repo) => Ok(repo.private),
        None => Err(SyncError::RepositoryNotFound(name)),
    }
}

/// Make the hosted repository behind `remote_url` private or public
pub async fn update_visibility(
    hosting: &dyn HostingProvider,
    token: &str,
    remote_url: &str,
    is_private: bool,
) -> Result<()> {
    let (owner, name) = resolve_slug(remote_url)?;
    let session = hosting.connect(token).await?;

    let repo = session.set_private(&owner, &name, is_private).await?;
    info!(
        "Repository {}/{} is now {}",
        repo.owner,
        repo.name,
        if repo.private { "private" } else { "public" }
    );
    Ok(())
}

/// Delete the hosted repository behind `remote_url`.
/// Returns `false` when there was nothing left to delete.
pub async fn delete_repository(hosting: &dyn HostingProvider, token: &str, remote_url: &str) -> Result<bool> {
    let (owner, name) = resolve_slug(remote_url)?;
    let session = hosting.connect(token).await?;

    let deleted = session.delete_repository(&owner, &name).await?;
    if deleted {
        info!("Deleted repository {}/{}", owner, name);
    } else {
        debug!("Repository {}/{} was already gone", owner, name);
    }
    Ok(deleted)
}

fn resolve_slug(remote_url: &str) -> Result<(String, String)> {
    parse_repo_slug(remote_url).ok_or_else(|| SyncError::InvalidRemoteUrl(strip_credential(remote_url)))
}

/// GitHub REST API provider
#[derive(Debug, Clone, Default)]
pub struct GitHubProvider {
    api_base: Option<String>,
}

impl GitHubProvider {
    pub fn new(config: &HostingConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
        }
    }

    /// Point the provider at a different API root (GitHub Enterprise, test servers)
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: Some(api_base.into()),
        }
    }
}

#[async_trait]
impl HostingProvider for GitHubProvider {
    async fn connect(&self, token: &str) -> Result<Box<dyn HostingSession>> {
        // The builder is not Send; keep it out of scope across the await
        let client = {
            let mut builder = Octocrab::builder();
            if let Some(api_base) = &self.api_base {
                builder = builder
                    .base_uri(api_base.as_str())
                    .map_err(|e| SyncError::TransportFailure(e.to_string()))?;
            }
            builder
                .personal_token(token.to_string())
                .build()
                .map_err(|e| SyncError::TransportFailure(e.to_string()))?
        };

        let user: ApiUser = client
            .get("/user", None::<&()>)
            .await
            .map_err(classify)?;

        info!("Authenticated as GitHub user: {}", user.login);

        Ok(Box::new(GitHubSession {
            client,
            login: user.login,
        }))
    }
}

struct GitHubSession {
    client: Octocrab,
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepository {
    name: String,
    owner: ApiUser,
    clone_url: Option<String>,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    #[allow(dead_code)]
    sha: String,
}

#[derive(Serialize)]
struct CreateRepository<'a> {
    name: &'a str,
    private: bool,
    auto_init: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Serialize)]
struct UpdateVisibility {
    private: bool,
}

#[derive(Serialize)]
struct Page {
    per_page: u8,
}

const COMMIT_PAGE: u8 = 100;

impl From<ApiRepository> for RemoteRepository {
    fn from(repo: ApiRepository) -> Self {
        let clone_url = repo
            .clone_url
            .unwrap_or_else(|| format!("https://github.com/{}/{}.git", repo.owner.login, repo.name));

        Self {
            owner: repo.owner.login,
            name: repo.name,
            clone_url,
            private: repo.private,
        }
    }
}

fn status_code(err: &octocrab::Error) -> Option<u16> {
    match err {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

fn classify(err: octocrab::Error) -> SyncError {
    match status_code(&err) {
        Some(401) | Some(403) => SyncError::AuthenticationFailed(err.to_string()),
        _ => SyncError::TransportFailure(err.to_string()),
    }
}

#[async_trait]
impl HostingSession for GitHubSession {
    fn login(&self) -> &str {
        &self.login
    }

    async fn find_repository(&self, owner: &str, name: &str) -> Result<Option<RemoteRepository>> {
        let route = format!("/repos/{}/{}", owner, name);
        let response: octocrab::Result<ApiRepository> = self.client.get(route, None::<&()>).await;
        match response {
            Ok(repo) => Ok(Some(repo.into())),
            Err(e) if status_code(&e) == Some(404) => {
                debug!("Repository {}/{} does not exist", owner, name);
                Ok(None)
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        description: Option<&str>,
    ) -> Result<RemoteRepository> {
        let body = CreateRepository {
            name,
            private,
            auto_init: false,
            description,
        };

        let repo: ApiRepository = self
            .client
            .post("/user/repos", Some(&body))
            .await
            .map_err(classify)?;

        info!("Created GitHub repository {}/{}", repo.owner.login, repo.name);
        Ok(repo.into())
    }

    async fn commit_count(&self, repo: &RemoteRepository) -> Result<Option<u64>> {
        let route = format!("/repos/{}/{}/commits", repo.owner, repo.name);
        let page = Page { per_page: COMMIT_PAGE };

        let response: octocrab::Result<Vec<ApiCommit>> = self.client.get(route, Some(&page)).await;
        match response {
            Ok(commits) if commits.len() < COMMIT_PAGE as usize => Ok(Some(commits.len() as u64)),
            // A full page only tells us there are at least this many
            Ok(_) => Ok(None),
            // An empty repository answers 409
            Err(e) if status_code(&e) == Some(409) => Ok(Some(0)),
            Err(e) => Err(classify(e)),
        }
    }

    async fn set_private(&self, owner: &str, name: &str, private: bool) -> Result<RemoteRepository> {
        let route = format!("/repos/{}/{}", owner, name);
        let body = UpdateVisibility { private };

        let response: octocrab::Result<ApiRepository> = self.client.patch(route, Some(&body)).await;
        match response {
            Ok(repo) => Ok(repo.into()),
            Err(e) if status_code(&e) == Some(404) => Err(SyncError::RepositoryNotFound(name.to_string())),
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<bool> {
        match self.client.repos(owner, name).delete().await {
            Ok(()) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }
}

/// GitHub token discovery: GitHub CLI, `GITHUB_TOKEN`, then the config file
#[derive(Debug, Clone)]
pub struct GitHubCredentials {
    auth_method: String,
    configured_token: Option<String>,
}

impl GitHubCredentials {
    pub fn new(config: &HostingConfig) -> Self {
        Self {
            auth_method: config.auth_method.clone(),
            configured_token: config.token.clone().filter(|t| !t.trim().is_empty()),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> anyhow::Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !Self::is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr)
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> anyhow::Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;
        let token = token.trim().to_string();

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !looks_like_github_token(&token) {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        Ok(token)
    }

    fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl CredentialProvider for GitHubCredentials {
    fn get_hosting_token(&self) -> Option<String> {
        let token = match self.auth_method.as_str() {
            "auto" => Self::try_github_cli()
                .or_else(|e| {
                    debug!("GitHub CLI token unavailable: {}", e);
                    Self::try_environment_token()
                })
                .map_err(|e| debug!("GITHUB_TOKEN unavailable: {}", e))
                .ok()
                .or_else(|| self.configured_token.clone()),
            "gh_cli" => Self::try_github_cli()
                .map_err(|e| warn!("GitHub CLI authentication failed: {}", e))
                .ok(),
            "token" => Self::try_environment_token()
                .map_err(|e| debug!("GITHUB_TOKEN unavailable: {}", e))
                .ok()
                .or_else(|| self.configured_token.clone()),
            other => {
                warn!("Unknown auth method: {}", other);
                None
            }
        };

        if token.is_none() {
            debug!("No hosting token found for auth method {}", self.auth_method);
        }
        token
    }
}

/// A fixed token, for callers that already hold one
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_hosting_token(&self) -> Option<String> {
        self.0.clone()
    }
}

fn looks_like_github_token(token: &str) -> bool {
    ["ghp_", "gho_", "ghs_", "ghu_", "github_pat_"]
        .iter()
        .any(|prefix| token.starts_with(prefix))
}
