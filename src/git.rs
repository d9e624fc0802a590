use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::hosting::HostingProvider;
use crate::progress::ProgressSink;
use crate::project::ProjectId;

/// Written when a bootstrapped folder has no ignore file and none is configured
pub const DEFAULT_GITIGNORE: &str = "__pycache__/\n*.log\nnode_modules/\n.DS_Store\n.venv/\ndist/\n";

/// Branch every bootstrapped repository publishes
pub const DEFAULT_BRANCH: &str = "main";

/// Git operations for backup pushes and first-time adoption.
///
/// The client is stateless between calls; everything it needs to know about a
/// repository is read from the working tree each time.
#[derive(Debug, Clone)]
pub struct GitClient {
    signature: String,
    identity: Option<CommitIdentity>,
    default_gitignore: Option<String>,
}

/// Author identity passed to commits and merges via `-c user.*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// Changed paths in a working tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Paths relative to the repository root
    pub changed_files: Vec<String>,
    pub count: usize,
}

impl StatusReport {
    pub fn is_clean(&self) -> bool {
        self.count == 0
    }
}

/// Result of a backup push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Working tree was clean, nothing was committed
    NoChanges,
    /// Changes were committed and pushed
    Pushed { branch: String, files: usize },
}

/// Input for a first-time adoption of a folder
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub path: PathBuf,
    /// Name of the hosted repository
    pub name: String,
    /// Hosting token; the engine fills this from its credential provider
    pub token: Option<String>,
    pub private: bool,
    pub description: Option<String>,
    /// Ignore-file content used when the folder has none
    pub gitignore_template: Option<String>,
    /// Attached to progress events
    pub project_id: Option<ProjectId>,
}

impl BootstrapRequest {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            token: None,
            private: true,
            description: None,
            gitignore_template: None,
            project_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushMode {
    Normal,
    Force,
}

impl GitClient {
    /// Create a client from the commit and bootstrap sections of the config
    pub fn new(config: &Config) -> Self {
        let identity = match (&config.commit.author_name, &config.commit.author_email) {
            (Some(name), Some(email)) => Some(CommitIdentity {
                name: name.clone(),
                email: email.clone(),
            }),
            _ => None,
        };

        Self {
            signature: config.commit.signature.clone(),
            identity,
            default_gitignore: config.bootstrap.default_gitignore.clone(),
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some(CommitIdentity {
            name: name.into(),
            email: email.into(),
        });
        self
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Append " by <signature>" unless the message already ends with it
    pub fn sign(&self, message: &str) -> String {
        let suffix = format!("by {}", self.signature);
        let message = message.trim_end();
        if message.ends_with(&suffix) {
            message.to_string()
        } else {
            format!("{} {}", message, suffix)
        }
    }

    /// List changed paths: modified, staged, renamed, deleted and untracked
    pub async fn get_status(&self, path: &Path) -> Result<StatusReport> {
        self.ensure_repository(path).await?;

        let stdout = self
            .git_ok(
                path,
                &[
                    "-c",
                    "core.quotePath=false",
                    "status",
                    "--porcelain",
                    "-z",
                    "--untracked-files=all",
                ],
            )
            .await?;

        let changed_files = parse_porcelain_z(&stdout);
        debug!("{} changed files in {}", changed_files.len(), path.display());

        Ok(StatusReport {
            count: changed_files.len(),
            changed_files,
        })
    }

    /// Commit every change in the working tree and push the current branch
    pub async fn sync(&self, path: &Path, message: &str) -> Result<SyncOutcome> {
        self.ensure_repository(path).await?;

        let remote = self
            .primary_remote(path)
            .await?
            .ok_or_else(|| SyncError::NoRemoteConfigured(path.to_path_buf()))?;

        let status = self.get_status(path).await?;
        if status.is_clean() {
            debug!("Nothing to sync in {}", path.display());
            return Ok(SyncOutcome::NoChanges);
        }

        self.git_ok(path, &["add", "--all"]).await?;
        let message = self.sign(message);
        self.commit(path, &message, false).await?;

        let branch = self.current_branch(path).await?.ok_or_else(|| SyncError::Git {
            command: "branch --show-current".to_string(),
            stderr: "HEAD is detached".to_string(),
        })?;

        // Rejections are not retried here; the next change schedules another attempt
        self.push(path, &remote, &branch, PushMode::Normal)
            .await
            .map_err(|e| match e {
                SyncError::PushRejected(stderr) => SyncError::PushFailed(stderr),
                other => other,
            })?;

        info!(
            "Pushed {} changed files from {} to {}/{}",
            status.count,
            path.display(),
            remote,
            branch
        );

        Ok(SyncOutcome::Pushed {
            branch,
            files: status.count,
        })
    }

    /// Turn a plain folder into a repository published on the hosting provider.
    ///
    /// Safe to repeat: an existing repository, ignore file, origin or hosted
    /// repository is reused. When the hosted history cannot be merged the
    /// local history overwrites it.
    pub async fn bootstrap_and_push(
        &self,
        request: &BootstrapRequest,
        hosting: &dyn HostingProvider,
        sink: &dyn ProgressSink,
    ) -> Result<String> {
        let path = request.path.as_path();
        let project = request.project_id;
        let token = request.token.as_deref().ok_or(SyncError::MissingCredentials)?;

        tokio::fs::create_dir_all(path).await?;

        if !self.is_repository(path) {
            sink.info(&format!("Initializing git repository in {}", path.display()), project);
            self.git_ok(path, &["init"]).await?;
        }

        if self.ensure_gitignore(path, request.gitignore_template.as_deref()).await? {
            sink.info("Created .gitignore", project);
        }

        sink.info("Connecting to hosting provider", project);
        let session = hosting.connect(token).await?;
        let login = session.login().to_string();

        let (remote, existed) = match session.find_repository(&login, &request.name).await? {
            Some(remote) => {
                let message = match session.commit_count(&remote).await {
                    Ok(Some(count)) => format!(
                        "Using existing repository {}/{} ({} commits)",
                        remote.owner, remote.name, count
                    ),
                    Ok(None) => format!("Using existing repository {}/{}", remote.owner, remote.name),
                    Err(e) => {
                        debug!("Could not count remote commits: {}", e);
                        format!("Using existing repository {}/{}", remote.owner, remote.name)
                    }
                };
                sink.info(&message, project);
                (remote, true)
            }
            None => {
                let remote = session
                    .create_repository(&request.name, request.private, request.description.as_deref())
                    .await?;
                sink.success(&format!("Created repository {}/{}", remote.owner, remote.name), project);
                (remote, false)
            }
        };

        let push_url = embed_credential(&remote.clone_url, token);
        self.set_origin(path, &push_url).await?;

        self.git_ok(path, &["add", "--all"]).await?;
        let message = self.sign("Initial commit");
        if !self.get_status(path).await?.is_clean() {
            self.commit(path, &message, false).await?;
        } else if !self.has_commits(path).await? {
            // Nothing to track, but the branch still needs a commit to push
            sink.info("No files to track, creating an empty initial commit", project);
            self.commit(path, &message, true).await?;
        } else {
            debug!("Nothing to commit during bootstrap of {}", path.display());
        }

        self.ensure_main_branch(path).await?;

        if existed && self.integrate_remote_history(path, sink, project).await? {
            // Merge failed and local history was force pushed
            return Ok(remote.clone_url);
        }

        match self.push(path, "origin", DEFAULT_BRANCH, PushMode::Normal).await {
            Ok(()) => {}
            Err(SyncError::PushRejected(stderr)) => {
                warn!(
                    "Push of {} was rejected, overwriting remote history: {}",
                    path.display(),
                    stderr.trim()
                );
                sink.warning(
                    "Push was rejected; overwriting the remote branch with local history",
                    project,
                );
                self.push(path, "origin", DEFAULT_BRANCH, PushMode::Force).await?;
            }
            Err(e) => return Err(e),
        }

        sink.success(&format!("Published to {}", remote.clone_url), project);
        Ok(remote.clone_url)
    }

    /// Fetch and merge the hosted history.
    ///
    /// Returns `true` when the merge failed and local history was force pushed
    /// instead, `false` when the caller should continue with a normal push.
    async fn integrate_remote_history(
        &self,
        path: &Path,
        sink: &dyn ProgressSink,
        project: Option<ProjectId>,
    ) -> Result<bool> {
        let fetch = self.git(path, &["fetch", "origin"]).await?;
        if !fetch.status.success() {
            let stderr = String::from_utf8_lossy(&fetch.stderr);
            debug!("Fetch failed for {}: {}", path.display(), stderr.trim());
            sink.info("Could not fetch remote history, pushing local history", project);
            return Ok(false);
        }

        let remote_ref = format!("refs/remotes/origin/{}", DEFAULT_BRANCH);
        let exists = self
            .git(path, &["rev-parse", "--verify", "--quiet", remote_ref.as_str()])
            .await?
            .status
            .success();
        if !exists {
            debug!("Remote has no {} branch yet", DEFAULT_BRANCH);
            return Ok(false);
        }

        let upstream = format!("origin/{}", DEFAULT_BRANCH);
        let merge = self
            .git_with_identity(
                path,
                &["merge", upstream.as_str(), "--allow-unrelated-histories", "--no-edit"],
            )
            .await?;

        if merge.status.success() {
            sink.info("Merged remote history", project);
            return Ok(false);
        }

        let conflict = SyncError::MergeConflict(combined_output(&merge));
        let abort = self.git(path, &["merge", "--abort"]).await?;
        if !abort.status.success() {
            debug!(
                "merge --abort failed: {}",
                String::from_utf8_lossy(&abort.stderr).trim()
            );
        }

        warn!(
            "Could not merge remote history into {}, force pushing local history: {}",
            path.display(),
            conflict
        );
        sink.warning(
            "Remote history could not be merged; the remote branch will be overwritten by local content",
            project,
        );

        self.push(path, "origin", DEFAULT_BRANCH, PushMode::Force).await?;
        sink.success("Force pushed local history", project);
        Ok(true)
    }

    /// Name of the current branch, `None` when HEAD is detached
    pub async fn current_branch(&self, path: &Path) -> Result<Option<String>> {
        let output = self.git(path, &["branch", "--show-current"]).await?;

        if output.status.success() && !output.stdout.is_empty() {
            let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(branch))
        } else {
            Ok(None)
        }
    }

    /// URL of a named remote
    pub async fn remote_url(&self, path: &Path, remote: &str) -> Result<Option<String>> {
        let output = self.git(path, &["remote", "get-url", remote]).await?;

        if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(Some(url))
        } else {
            Ok(None)
        }
    }

    /// `origin` when present, otherwise the first configured remote
    pub async fn primary_remote(&self, path: &Path) -> Result<Option<String>> {
        let stdout = self.git_ok(path, &["remote"]).await?;
        let remotes: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        if remotes.contains(&"origin") {
            Ok(Some("origin".to_string()))
        } else {
            Ok(remotes.first().map(|r| r.to_string()))
        }
    }

    /// Number of commits reachable from HEAD, zero on an unborn branch
    pub async fn commit_count(&self, path: &Path) -> Result<u64> {
        if !self.has_commits(path).await? {
            return Ok(0);
        }
        let stdout = self.git_ok(path, &["rev-list", "--count", "HEAD"]).await?;
        Ok(stdout.trim().parse().unwrap_or(0))
    }

    /// Whether `path` is the root of a git working tree
    pub fn is_repository(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    async fn ensure_repository(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(SyncError::PathNotFound(path.to_path_buf()));
        }
        if !self.is_repository(path) {
            return Err(SyncError::NotARepository(path.to_path_buf()));
        }
        Ok(())
    }

    async fn has_commits(&self, path: &Path) -> Result<bool> {
        let output = self.git(path, &["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
        Ok(output.status.success())
    }

    /// Write an ignore file if the folder has none. Returns whether one was written.
    async fn ensure_gitignore(&self, path: &Path, template: Option<&str>) -> Result<bool> {
        let gitignore = path.join(".gitignore");
        if gitignore.exists() {
            return Ok(false);
        }

        let content = template
            .or(self.default_gitignore.as_deref())
            .unwrap_or(DEFAULT_GITIGNORE);
        tokio::fs::write(&gitignore, content).await?;
        Ok(true)
    }

    /// Point `origin` at `url`, replacing any existing origin
    async fn set_origin(&self, path: &Path, url: &str) -> Result<()> {
        if self.remote_url(path, "origin").await?.is_some() {
            self.git_ok(path, &["remote", "remove", "origin"]).await?;
        }
        self.git_ok(path, &["remote", "add", "origin", url]).await?;
        Ok(())
    }

    async fn ensure_main_branch(&self, path: &Path) -> Result<()> {
        if self.current_branch(path).await?.as_deref() == Some(DEFAULT_BRANCH) {
            return Ok(());
        }

        if self.has_commits(path).await? {
            self.git_ok(path, &["branch", "-M", DEFAULT_BRANCH]).await?;
        } else {
            let head = format!("refs/heads/{}", DEFAULT_BRANCH);
            self.git_ok(path, &["symbolic-ref", "HEAD", head.as_str()]).await?;
        }
        Ok(())
    }

    async fn commit(&self, path: &Path, message: &str, allow_empty: bool) -> Result<()> {
        let mut args = vec!["commit", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        let output = self.git_with_identity(path, &args).await?;

        if !output.status.success() {
            return Err(SyncError::Git {
                command: "commit".to_string(),
                stderr: combined_output(&output),
            });
        }
        Ok(())
    }

    async fn push(&self, path: &Path, remote: &str, branch: &str, mode: PushMode) -> Result<()> {
        let refspec = format!("{}:{}", branch, branch);
        let mut args = vec!["push", "--set-upstream"];
        if mode == PushMode::Force {
            warn!("Force pushing {} to {}/{}", path.display(), remote, branch);
            args.push("--force");
        }
        args.push(remote);
        args.push(refspec.as_str());

        let output = self.git(path, &args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = redact_credentials(String::from_utf8_lossy(&output.stderr).trim());
        if is_rejection(&stderr) {
            Err(SyncError::PushRejected(stderr))
        } else {
            Err(SyncError::PushFailed(stderr))
        }
    }

    async fn git_with_identity(&self, path: &Path, args: &[&str]) -> Result<Output> {
        let mut full: Vec<String> = Vec::with_capacity(args.len() + 4);
        if let Some(identity) = &self.identity {
            full.push("-c".to_string());
            full.push(format!("user.name={}", identity.name));
            full.push("-c".to_string());
            full.push(format!("user.email={}", identity.email));
        }
        full.extend(args.iter().map(|a| a.to_string()));

        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        self.git(path, &refs).await
    }

    /// Run git and hand back the raw output; only a spawn failure is an error
    async fn git(&self, path: &Path, args: &[&str]) -> Result<Output> {
        debug!("git {} (in {})", redact_credentials(&args.join(" ")), path.display());

        let output = AsyncCommand::new("git")
            .args(args)
            .current_dir(path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        Ok(output)
    }

    /// Run git and return stdout, classifying a non-zero exit as `SyncError::Git`
    async fn git_ok(&self, path: &Path, args: &[&str]) -> Result<String> {
        let output = self.git(path, args).await?;

        if !output.status.success() {
            return Err(SyncError::Git {
                command: redact_credentials(&args.join(" ")),
                stderr: redact_credentials(String::from_utf8_lossy(&output.stderr).trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `git status --porcelain -z` output into paths.
///
/// Renames and copies carry a second NUL-terminated field holding the source
/// path; only the destination is reported.
pub fn parse_porcelain_z(output: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut fields = output.split('\0');

    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        files.push(path.to_string());

        if status.starts_with('R') || status.starts_with('C') {
            fields.next();
        }
    }

    files
}

/// Rewrite an https clone URL to carry a token; other schemes pass through
pub fn embed_credential(url: &str, token: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) => {
            let rest = strip_userinfo(rest);
            format!("https://x-access-token:{}@{}", token, rest)
        }
        None => url.to_string(),
    }
}

static URL_USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z][A-Za-z0-9+.-]*://)[^/@\s]+@").expect("url userinfo regex"));

/// Remove the `user[:password]@` part of every URL inside `text`
pub fn redact_credentials(text: &str) -> String {
    URL_USERINFO.replace_all(text, "$1").into_owned()
}

/// Remove any `user[:password]@` part from a URL with a scheme
pub fn strip_credential(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => format!("{}://{}", scheme, strip_userinfo(rest)),
        None => url.to_string(),
    }
}

fn strip_userinfo(rest: &str) -> &str {
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    }
}

/// Resolve `(owner, name)` from an https, ssh or scp-style remote URL
pub fn parse_repo_slug(url: &str) -> Option<(String, String)> {
    let url = strip_credential(url.trim());

    let path = if let Some((_, rest)) = url.split_once("://") {
        let (_, path) = rest.split_once('/')?;
        path.to_string()
    } else if let Some((_, path)) = url.split_once(':') {
        // git@host:owner/name.git
        path.to_string()
    } else {
        return None;
    };

    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut segments = path.rsplit('/');
    let name = segments.next().filter(|s| !s.is_empty())?;
    let owner = segments.next().filter(|s| !s.is_empty())?;

    Some((owner.to_string(), name.to_string()))
}

fn is_rejection(stderr: &str) -> bool {
    stderr.contains("rejected") || stderr.contains("non-fast-forward") || stderr.contains("fetch first")
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    redact_credentials(format!("{}{}", stdout, stderr).trim())
}
