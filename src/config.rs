use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for keepsync
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Project registry and event log
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Hosting provider authentication
    #[serde(default)]
    pub hosting: HostingConfig,

    /// Tick loop and policy floors
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Commit attribution
    #[serde(default)]
    pub commit: CommitConfig,

    /// Filesystem watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// First-time adoption settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Registry database location
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Hosting provider configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostingConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// Token stored in config (lowest precedence in "auto")
    #[serde(default)]
    pub token: Option<String>,

    /// API base override, e.g. for GitHub Enterprise
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Scheduler configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Floor applied to every project's interval
    #[serde(default = "default_min_interval")]
    pub min_interval_seconds: u64,

    /// How often the daemon re-reads the registry for added or changed projects
    #[serde(default = "default_refresh_seconds")]
    pub refresh_seconds: u64,
}

/// Commit attribution configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommitConfig {
    /// Appended as " by <signature>" to every automatic commit
    #[serde(default = "default_signature")]
    pub signature: String,

    /// Author name used when the repository has none configured
    #[serde(default)]
    pub author_name: Option<String>,

    #[serde(default)]
    pub author_email: Option<String>,
}

/// Watcher configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct WatcherConfig {
    /// Extra ignore patterns, `*` matches any run of characters
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

/// Bootstrap configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BootstrapConfig {
    /// Ignore-file template written when a folder has none
    #[serde(default)]
    pub default_gitignore: Option<String>,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

// Default value functions
fn default_database_path() -> String {
    data_home().join("keepsync").join("state.db").to_string_lossy().into_owned()
}
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_min_interval() -> u64 {
    60
}
fn default_refresh_seconds() -> u64 {
    30
}
fn default_signature() -> String {
    "keepsync".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/keepsync.pid", runtime_dir)
    } else {
        "/tmp/keepsync.pid".to_string()
    }
}
fn default_log_file() -> String {
    data_home().join("keepsync").join("daemon.log").to_string_lossy().into_owned()
}
fn default_log_level() -> String {
    "info".to_string()
}

fn data_home() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from("/tmp")
    }
}

// Default implementations
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            token: None,
            api_base: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            min_interval_seconds: default_min_interval(),
            refresh_seconds: default_refresh_seconds(),
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            signature: default_signature(),
            author_name: None,
            author_email: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("keepsync").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.database.path = shellexpand::full(&self.database.path)
            .context("Failed to expand database path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }

    /// Scheduler tick as a duration, never zero
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_ms.max(10))
    }

    /// Registry refresh period, at least one second
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.refresh_seconds.max(1))
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            hosting: HostingConfig::default(),
            scheduler: SchedulerConfig::default(),
            commit: CommitConfig::default(),
            watcher: WatcherConfig::default(),
            bootstrap: BootstrapConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
