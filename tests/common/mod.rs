//! Common test utilities and helpers for keepsync tests
#![allow(dead_code)]

use async_trait::async_trait;
use keepsync::error::{Result, SyncError};
use keepsync::hosting::{HostingProvider, HostingSession, RemoteRepository};
use keepsync::progress::{Level, ProgressEvent, ProgressSink};
use keepsync::project::ProjectId;
use keepsync::Config;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const LOGIN: &str = "tester";

/// Scratch directory with a config that keeps all state inside it
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config: Config,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = Config::default();
        config.database.path = temp_dir.path().join("state.db").to_string_lossy().into_owned();
        config.daemon.pid_file = temp_dir.path().join("keepsync.pid").to_string_lossy().into_owned();
        config.daemon.log_file = temp_dir.path().join("daemon.log").to_string_lossy().into_owned();
        config.commit.author_name = Some("Test".to_string());
        config.commit.author_email = Some("test@example.com".to_string());
        config.scheduler.tick_ms = 50;

        Self { temp_dir, config }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create an empty folder under the scratch directory
    pub fn folder(&self, name: &str) -> PathBuf {
        let dir = self.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create folder");
        dir
    }

    /// Root under which `LocalHosting` keeps its bare repositories
    pub fn hosting_root(&self) -> PathBuf {
        self.path().join("hosting")
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }
}

/// Run git in `dir`, panicking on failure, and return trimmed stdout
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to run git");

    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialize a repository on `main` with a committer identity
pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).expect("Failed to create repo dir");
    git(dir, &["init", "--quiet"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
}

/// Create a bare repository and return its path
pub fn bare_repo(path: &Path) -> PathBuf {
    std::fs::create_dir_all(path).expect("Failed to create bare repo dir");
    git(path, &["init", "--bare", "--quiet"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    path.to_path_buf()
}

/// Repository with one commit pushed to a fresh bare remote
pub fn repo_with_remote(env: &TestEnvironment, name: &str) -> (PathBuf, PathBuf) {
    let work = env.path().join(name);
    let remote = bare_repo(&env.path().join(format!("{}.git", name)));

    init_repo(&work);
    std::fs::write(work.join("README.md"), format!("# {}\n", name)).unwrap();
    git(&work, &["add", "--all"]);
    git(&work, &["commit", "--quiet", "-m", "initial"]);
    git(&work, &["remote", "add", "origin", &remote.to_string_lossy()]);
    git(&work, &["push", "--quiet", "--set-upstream", "origin", "main"]);

    (work, remote)
}

/// Number of commits on `branch` of a (bare or working) repository
pub fn commit_count(repo: &Path, branch: &str) -> u64 {
    git(repo, &["rev-list", "--count", branch]).parse().unwrap()
}

/// Stands in for GitHub: repositories are bare repos under
/// `<root>/<login>/<name>.git` and clone URLs are plain paths
#[derive(Clone)]
pub struct LocalHosting {
    root: PathBuf,
    visibility: Arc<Mutex<HashMap<String, bool>>>,
}

impl LocalHosting {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        std::fs::create_dir_all(root.join(LOGIN)).expect("Failed to create hosting root");
        Self {
            root,
            visibility: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.root.join(LOGIN).join(format!("{}.git", name))
    }

    /// Create a hosted repository out-of-band
    pub fn seed(&self, name: &str) -> PathBuf {
        bare_repo(&self.repo_path(name))
    }
}

#[async_trait]
impl HostingProvider for LocalHosting {
    async fn connect(&self, token: &str) -> Result<Box<dyn HostingSession>> {
        if token.is_empty() {
            return Err(SyncError::AuthenticationFailed("empty token".to_string()));
        }
        Ok(Box::new(self.clone()))
    }
}

impl LocalHosting {
    fn describe(&self, name: &str) -> RemoteRepository {
        let private = *self.visibility.lock().unwrap().get(name).unwrap_or(&true);
        RemoteRepository {
            owner: LOGIN.to_string(),
            name: name.to_string(),
            clone_url: self.repo_path(name).to_string_lossy().into_owned(),
            private,
        }
    }
}

#[async_trait]
impl HostingSession for LocalHosting {
    fn login(&self) -> &str {
        LOGIN
    }

    async fn find_repository(&self, owner: &str, name: &str) -> Result<Option<RemoteRepository>> {
        if owner == LOGIN && self.repo_path(name).exists() {
            Ok(Some(self.describe(name)))
        } else {
            Ok(None)
        }
    }

    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        _description: Option<&str>,
    ) -> Result<RemoteRepository> {
        self.seed(name);
        self.visibility.lock().unwrap().insert(name.to_string(), private);
        Ok(self.describe(name))
    }

    async fn commit_count(&self, repo: &RemoteRepository) -> Result<Option<u64>> {
        let output = Command::new("git")
            .args(["rev-list", "--count", "main"])
            .current_dir(&repo.clone_url)
            .output()?;
        if !output.status.success() {
            return Ok(Some(0));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().parse().ok())
    }

    async fn set_private(&self, owner: &str, name: &str, private: bool) -> Result<RemoteRepository> {
        if owner != LOGIN || !self.repo_path(name).exists() {
            return Err(SyncError::RepositoryNotFound(name.to_string()));
        }
        self.visibility.lock().unwrap().insert(name.to_string(), private);
        Ok(self.describe(name))
    }

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<bool> {
        let path = self.repo_path(name);
        if owner != LOGIN || !path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&path)?;
        self.visibility.lock().unwrap().remove(name);
        Ok(true)
    }
}

/// Sink that keeps every message for later assertions
#[derive(Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| event.level == level)
            .map(|event| event.message)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, message: &str, level: Level, project_id: Option<ProjectId>) {
        self.events.lock().unwrap().push(ProgressEvent {
            time: chrono::Utc::now(),
            message: message.to_string(),
            level,
            project_id,
        });
    }
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}

pub use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
