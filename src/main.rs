use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use path_clean::PathClean;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keepsync::daemon::{self, is_daemon_running, running_pid, stop_daemon};
use keepsync::git::strip_credential;
use keepsync::hosting::{CredentialProvider, GitHubCredentials, GitHubProvider};
use keepsync::progress::{BroadcastSink, Level, MultiSink, ProgressEvent, TracingSink};
use keepsync::project::{parse_fixed_time, ProjectId, SyncMode, SyncStatus, WatchedProject};
use keepsync::registry::{EventLogSink, NewProject, ProjectRegistry, SqliteRegistry};
use keepsync::{BootstrapRequest, Config, Daemon, SyncEngine, SyncError, SyncOutcome};

/// Events older than this are pruned when the daemon starts
const EVENT_RETENTION_DAYS: u32 = 30;

/// Buffered progress events for the foreground daemon's console
const LIVE_EVENT_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "keepsync")]
#[command(about = "Continuous git backup for local project folders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration and registry, and check credentials
    Init,

    /// Register an existing git repository for backup
    Add {
        path: PathBuf,

        /// Display name (defaults to the folder name)
        #[arg(long)]
        name: Option<String>,

        /// Register without automatic pushes
        #[arg(long)]
        no_auto_push: bool,
    },

    /// Publish a folder to GitHub and register it for backup
    Adopt {
        path: PathBuf,

        /// Hosted repository name (defaults to the folder name)
        #[arg(long)]
        name: Option<String>,

        /// Create a public repository
        #[arg(long)]
        public: bool,

        /// Repository description
        #[arg(long)]
        description: Option<String>,
    },

    /// List registered projects
    List,

    /// Show a project's pending changes
    Status { id: ProjectId },

    /// Back up a project now
    Push { id: ProjectId },

    /// Stop backing up a project
    Remove {
        id: ProjectId,

        /// Also delete the hosted repository
        #[arg(long)]
        delete_remote: bool,
    },

    /// Show or change a project's sync policy
    Policy {
        id: ProjectId,

        /// Enable or disable automatic pushes
        #[arg(long)]
        auto_push: Option<bool>,

        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Minimum seconds between pushes in interval mode
        #[arg(long)]
        interval: Option<u64>,

        /// Daily push time (HH:MM) in fixed mode
        #[arg(long)]
        at: Option<String>,

        /// Commit message prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Show or change the hosted repository's visibility
    Visibility {
        id: ProjectId,

        #[arg(long, conflicts_with = "public")]
        private: bool,

        #[arg(long)]
        public: bool,
    },

    /// Show recent sync events
    Events {
        /// Only events of this project
        #[arg(long)]
        project: Option<ProjectId>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

#[derive(ValueEnum, Clone, Copy)]
enum ModeArg {
    Interval,
    Fixed,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Interval => SyncMode::Interval,
            ModeArg::Fixed => SyncMode::Fixed,
        }
    }
}

/// Registry and engine wired to the configured hosting provider
struct App {
    config: Config,
    registry: Arc<SqliteRegistry>,
    engine: SyncEngine,
}

impl App {
    fn open(config: &Config) -> Result<Self> {
        Self::open_with_live(config, None)
    }

    /// Like [`open`](Self::open), additionally publishing progress on `live`
    fn open_with_live(config: &Config, live: Option<BroadcastSink>) -> Result<Self> {
        let registry = Arc::new(SqliteRegistry::open_at(&config.database_path())?);

        let mut sink = MultiSink::new()
            .with_sink(Box::new(TracingSink))
            .with_sink(Box::new(EventLogSink::new(Arc::clone(&registry))));
        if let Some(live) = live {
            sink.add_sink(Box::new(live));
        }

        let engine = SyncEngine::new(
            config,
            registry.clone(),
            Arc::new(GitHubProvider::new(&config.hosting)),
            Arc::new(GitHubCredentials::new(&config.hosting)),
            Arc::new(sink),
        );

        Ok(Self {
            config: config.clone(),
            registry,
            engine,
        })
    }

    fn project(&self, id: ProjectId) -> Result<WatchedProject> {
        self.registry
            .get(id)?
            .with_context(|| format!("No project with id {}", id))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config)?;
    info!("Starting keepsync v{}", env!("CARGO_PKG_VERSION"));

    // Forking is only safe before the runtime spawns its threads
    if let Commands::Daemon {
        daemon_command: DaemonCommands::Start { foreground: false },
    } = &cli.command
    {
        if is_daemon_running(&config)? {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'keepsync daemon stop' to stop it first");
            return Ok(());
        }
        detach(&config)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(cli.command, config))
}

#[cfg(unix)]
fn detach(config: &Config) -> Result<()> {
    println!("🚀 Starting keepsync daemon in background");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    daemon::daemonize(config)
}

#[cfg(not(unix))]
fn detach(_config: &Config) -> Result<()> {
    bail!("Background daemon mode not supported on this platform, use --foreground")
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Init => cmd_init(&config),
        Commands::Add {
            path,
            name,
            no_auto_push,
        } => cmd_add(&App::open(&config)?, &path, name, no_auto_push).await,
        Commands::Adopt {
            path,
            name,
            public,
            description,
        } => cmd_adopt(&App::open(&config)?, &path, name, public, description).await,
        Commands::List => cmd_list(&App::open(&config)?),
        Commands::Status { id } => cmd_status(&App::open(&config)?, id).await,
        Commands::Push { id } => cmd_push(&App::open(&config)?, id).await,
        Commands::Remove { id, delete_remote } => cmd_remove(&App::open(&config)?, id, delete_remote).await,
        Commands::Policy {
            id,
            auto_push,
            mode,
            interval,
            at,
            prefix,
        } => cmd_policy(&App::open(&config)?, id, auto_push, mode, interval, at, prefix),
        Commands::Visibility { id, private, public } => {
            let desired = match (private, public) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_visibility(&App::open(&config)?, id, desired).await
        }
        Commands::Events { project, limit } => cmd_events(&App::open(&config)?, project, limit),
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, &config).await,
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let fallback = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Absolute, normalized form of a user-supplied folder
fn resolve_folder(path: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(&path.to_string_lossy())
        .context("Failed to expand path")?
        .into_owned();
    let path = PathBuf::from(expanded);
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };

    let cleaned = absolute.clean();
    if !cleaned.is_dir() {
        bail!("{} is not a directory", cleaned.display());
    }
    Ok(cleaned)
}

fn folder_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("Cannot derive a name from {}", path.display()))
}

fn cmd_init(config: &Config) -> Result<()> {
    info!("Initializing keepsync...");

    let registry = SqliteRegistry::open_at(&config.database_path())?;
    let projects = registry.list_projects()?;

    println!("✅ keepsync initialized");
    println!("   Config: {:?}", Config::default_config_path()?);
    println!("   Registry: {} ({} projects)", config.database.path, projects.len());

    let credentials = GitHubCredentials::new(&config.hosting);
    if credentials.get_hosting_token().is_some() {
        println!("   🔑 GitHub credentials found ({})", config.hosting.auth_method);
    } else {
        println!("   ⚠️  No GitHub credentials found");
        println!("      Run 'gh auth login' or set GITHUB_TOKEN before adopting folders");
    }

    Ok(())
}

async fn cmd_add(app: &App, path: &Path, name: Option<String>, no_auto_push: bool) -> Result<()> {
    let path = resolve_folder(path)?;
    let git = app.engine.git();

    if !git.is_repository(&path) {
        bail!(
            "{} is not a git repository, use 'keepsync adopt' to publish it",
            path.display()
        );
    }
    if let Some(existing) = app.registry.find_by_path(&path)? {
        println!("⚠️  {} is already registered as project {}", path.display(), existing.id);
        return Ok(());
    }

    let mut project = NewProject::new(name.map_or_else(|| folder_name(&path), Ok)?, &path);
    if let Some(remote) = git.primary_remote(&path).await? {
        project.remote_url = git
            .remote_url(&path, &remote)
            .await?
            .map(|url| strip_credential(&url));
    }
    if let Some(branch) = git.current_branch(&path).await? {
        project.branch = branch;
    }
    project.policy.auto_push = !no_auto_push;

    let id = app.registry.add_project(&project)?;

    println!("✅ Registered {} as project {}", project.name, id);
    match &project.remote_url {
        Some(url) => println!("   Remote: {}", url),
        None => println!("   ⚠️  No remote configured, pushes will fail until one is added"),
    }
    Ok(())
}

async fn cmd_adopt(
    app: &App,
    path: &Path,
    name: Option<String>,
    public: bool,
    description: Option<String>,
) -> Result<()> {
    let path = resolve_folder(path)?;
    let name = name.map_or_else(|| folder_name(&path), Ok)?;

    let id = match app.registry.find_by_path(&path)? {
        Some(existing) => existing.id,
        None => {
            let mut project = NewProject::new(&name, &path);
            project.policy.is_private = !public;
            app.registry.add_project(&project)?
        }
    };

    println!("📦 Publishing {} as {}...", path.display(), name);

    let mut request = BootstrapRequest::new(&path, &name);
    request.private = !public;
    request.description = description;
    request.gitignore_template = app.config.bootstrap.default_gitignore.clone();
    request.project_id = Some(id);

    let remote_url = app.engine.bootstrap_project(request).await?;
    app.registry.set_remote_url(id, Some(&remote_url))?;

    println!("✅ Project {} is backed up to {}", id, remote_url);
    Ok(())
}

fn cmd_list(app: &App) -> Result<()> {
    let projects = app.registry.list_projects()?;

    println!("Projects ({}):", projects.len());
    for project in projects {
        let schedule = match project.policy.mode {
            SyncMode::Interval => format!("every {}s", project.policy.interval_seconds),
            SyncMode::Fixed => format!("daily at {}", project.policy.fixed_time),
        };
        let auto = if project.policy.auto_push { "" } else { " (paused)" };
        let last_sync = project
            .last_sync
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());

        println!("  {} {} [{}]", status_icon(project.status), project.id, project.name);
        println!("     📁 {}", project.path.display());
        println!("     🔄 {}{}, last sync {}", schedule, auto, last_sync);
        if let Some(url) = &project.remote_url {
            println!("     🔗 {}", url);
        }
    }
    Ok(())
}

fn status_icon(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Idle => "✅",
        SyncStatus::Syncing => "🔄",
        SyncStatus::Error => "❌",
    }
}

async fn cmd_status(app: &App, id: ProjectId) -> Result<()> {
    let project = app.project(id)?;
    let report = app.engine.scan_status(id).await?;

    let commits = app.engine.git().commit_count(&project.path).await?;

    println!("{} {} ({})", status_icon(project.status), project.name, project.status);
    println!("   Commits: {}", commits);
    if report.is_clean() {
        println!("   Working tree clean");
    } else {
        println!("   {} changed files:", report.count);
        for file in &report.changed_files {
            println!("     {}", file);
        }
    }
    Ok(())
}

async fn cmd_push(app: &App, id: ProjectId) -> Result<()> {
    let project = app.project(id)?;
    println!("🔄 Backing up {}...", project.name);

    match app.engine.trigger_manual_sync(id).await {
        Ok(SyncOutcome::NoChanges) => println!("✅ Nothing to back up"),
        Ok(SyncOutcome::Pushed { branch, files }) => {
            println!("✅ Pushed {} changed files to {}", files, branch)
        }
        Err(SyncError::AlreadySyncing(_)) => {
            println!("⚠️  {} is already being backed up, try again shortly", project.name)
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_remove(app: &App, id: ProjectId, delete_remote: bool) -> Result<()> {
    if delete_remote && app.registry.get(id)?.is_some() {
        match app.engine.delete_remote(id).await {
            Ok(true) => println!("🗑️  Hosted repository deleted"),
            Ok(false) => println!("   Hosted repository was already gone"),
            Err(SyncError::NoRemoteConfigured(_)) => println!("   No hosted repository to delete"),
            Err(e) => return Err(anyhow::Error::new(e).context("Project kept, hosted repository not deleted")),
        }
    }

    if app.registry.remove_project(id)? {
        println!("✅ Project {} removed, its files were not touched", id);
    } else {
        println!("⚠️  No project with id {}", id);
    }
    Ok(())
}

fn cmd_policy(
    app: &App,
    id: ProjectId,
    auto_push: Option<bool>,
    mode: Option<ModeArg>,
    interval: Option<u64>,
    at: Option<String>,
    prefix: Option<String>,
) -> Result<()> {
    let project = app.project(id)?;
    let mut policy = project.policy.clone();

    if let Some(auto_push) = auto_push {
        policy.auto_push = auto_push;
    }
    if let Some(mode) = mode {
        policy.mode = mode.into();
    }
    if let Some(interval) = interval {
        policy.interval_seconds = interval;
    }
    if let Some(at) = at {
        if parse_fixed_time(&at).is_none() {
            bail!("Invalid time {:?}, expected HH:MM", at);
        }
        policy.fixed_time = at;
    }
    if let Some(prefix) = prefix {
        policy.commit_prefix = prefix;
    }

    if policy != project.policy {
        app.registry.set_policy(id, &policy)?;
        println!("✅ Policy of {} updated", project.name);
    }

    let floor = app.config.scheduler.min_interval_seconds;
    println!("   Auto push: {}", policy.auto_push);
    println!("   Mode: {}", policy.mode.as_str());
    println!(
        "   Interval: {}s (effective {}s)",
        policy.interval_seconds,
        policy.effective_interval(floor)
    );
    println!("   Fixed time: {}", policy.fixed_time);
    println!("   Commit prefix: {:?}", policy.commit_prefix);
    Ok(())
}

async fn cmd_visibility(app: &App, id: ProjectId, desired: Option<bool>) -> Result<()> {
    let result = match desired {
        Some(is_private) => app.engine.update_visibility(id, is_private).await.map(|_| is_private),
        None => app.engine.get_visibility(id).await,
    };

    match result {
        Ok(is_private) => {
            let mut project = app.project(id)?;
            if project.policy.is_private != is_private {
                project.policy.is_private = is_private;
                app.registry.set_policy(id, &project.policy)?;
            }
            let label = if is_private { "🔒 private" } else { "🌐 public" };
            println!("{} is {}", project.name, label);
            Ok(())
        }
        Err(e) if e.is_orphaned_remote() => {
            // The hosted copy is gone; keep the local record but mark it orphaned
            app.registry.set_remote_url(id, None)?;
            app.registry.update_status(id, SyncStatus::Error)?;
            println!("❌ The hosted repository no longer exists on GitHub ({})", e);
            println!("   Run 'keepsync adopt' on the folder to publish it again");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_events(app: &App, project: Option<ProjectId>, limit: u32) -> Result<()> {
    let events = app.registry.recent_events(limit, project)?;

    if events.is_empty() {
        println!("No events recorded");
        return Ok(());
    }

    for event in events.iter().rev() {
        println!("{}", format_event(event));
    }
    Ok(())
}

fn format_event(event: &ProgressEvent) -> String {
    let icon = match event.level {
        Level::Info => "ℹ️ ",
        Level::Success => "✅",
        Level::Warning => "⚠️ ",
        Level::Error => "❌",
    };
    let project = event
        .project_id
        .map(|id| format!("[{}] ", id))
        .unwrap_or_default();
    format!(
        "{} {} {}{}",
        event.time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        icon,
        project,
        event.message
    )
}

/// Echo engine progress to the console of a foreground daemon
async fn print_live_events(mut events: tokio::sync::broadcast::Receiver<ProgressEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", format_event(&event)),
            Err(RecvError::Lagged(skipped)) => println!("   ... {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: &Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                if is_daemon_running(config)? {
                    println!("⚠️  Daemon is already running!");
                    println!("   Use 'keepsync daemon stop' to stop it first");
                    return Ok(());
                }
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }

            let live = foreground.then(|| BroadcastSink::new(LIVE_EVENT_CAPACITY));
            let app = App::open_with_live(config, live.clone())?;
            if let Some(live) = &live {
                tokio::spawn(print_live_events(live.subscribe()));
            }
            match app.registry.prune_events(EVENT_RETENTION_DAYS) {
                Ok(0) => {}
                Ok(pruned) => info!("Pruned {} old events", pruned),
                Err(e) => warn!("Failed to prune old events: {}", e),
            }

            let mut daemon = Daemon::new(config, app.engine.clone());
            daemon.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping keepsync daemon...");

            match stop_daemon(config)? {
                Some(pid) => println!("✅ Stop signal sent to process {}", pid),
                None => println!("⚠️  No daemon appears to be running"),
            }
        }

        DaemonCommands::Status => {
            println!("📊 keepsync Daemon Status");

            match running_pid(config)? {
                Some(pid) => {
                    println!("   🟢 Status: Running (PID {})", pid);
                    let registry = SqliteRegistry::open_at(&config.database_path())?;
                    let projects = registry.list_projects()?;
                    let watched = projects.iter().filter(|p| p.policy.auto_push).count();
                    let failing = projects
                        .iter()
                        .filter(|p| p.status == SyncStatus::Error)
                        .count();
                    println!("   📁 Projects: {} ({} with auto push)", projects.len(), watched);
                    if failing > 0 {
                        println!("   ❌ In error: {}", failing);
                    }
                    if !config.daemon.log_file.is_empty() {
                        println!("   📄 Log file: {}", config.daemon.log_file);
                    }
                }
                None => {
                    println!("   🔴 Status: Not running");
                    println!("   💡 Use 'keepsync daemon start' to start the daemon");
                }
            }
        }
    }

    Ok(())
}
