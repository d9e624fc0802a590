//! Daemon Infrastructure - Background service that keeps projects backed up
//!
//! This module runs the sync engine as a long-lived process with PID file
//! management and graceful shutdown: on SIGINT/SIGTERM the scheduler stops,
//! watchers are dropped and in-flight syncs are awaited before exit.

use crate::config::Config;
use crate::engine::SyncEngine;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Daemon state and control
pub struct Daemon {
    engine: SyncEngine,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_receiver: Option<broadcast::Receiver<()>>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon around an engine
    pub fn new(config: &Config, engine: SyncEngine) -> Self {
        let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);

        Self {
            engine,
            shutdown_sender,
            shutdown_receiver: Some(shutdown_receiver),
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path: pid_file_path(config),
        }
    }

    /// Sender that stops the daemon when signalled
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Run the daemon in the foreground until a shutdown signal arrives
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting keepsync daemon");

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .context("Daemon has already been run")?;

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);

        let summary = match self.engine.start() {
            Ok(summary) => summary,
            Err(e) => {
                self.cleanup()?;
                return Err(e).context("Failed to load projects");
            }
        };
        info!(
            "Watching {} projects ({} could not be watched)",
            summary.watched,
            summary.failed.len()
        );

        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            let _ = shutdown_sender.send(());
        });

        self.engine.run(shutdown_receiver).await;

        self.cleanup().context("Failed to cleanup daemon")
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}

fn pid_file_path(config: &Config) -> Option<PathBuf> {
    if config.daemon.pid_file.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.daemon.pid_file))
    }
}

/// Detach into the background (Unix platforms).
///
/// Must be called before the tokio runtime is built.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let mut daemonize = Daemonize::new().working_directory("/");

    if let Some(pid_path) = pid_file_path(config) {
        daemonize = daemonize.pid_file(pid_path);
    }

    if !config.daemon.log_file.is_empty() {
        let log_path = Path::new(&config.daemon.log_file);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .context("Failed to open log file")?;
        daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;
    Ok(())
}

/// Read the PID of a running daemon, removing a stale PID file
pub fn running_pid(config: &Config) -> Result<Option<u32>> {
    let Some(pid_file) = pid_file_path(config) else {
        return Ok(None);
    };
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                let _ = fs::remove_file(&pid_file);
                Ok(None)
            }
            // Exists but belongs to someone else
            Err(_) => Ok(Some(pid)),
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(pid))
    }
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    Ok(running_pid(config)?.is_some())
}

/// Ask a running daemon to stop. Returns the signalled PID.
pub fn stop_daemon(config: &Config) -> Result<Option<u32>> {
    let Some(pid) = running_pid(config)? else {
        warn!("PID file not found, daemon may not be running");
        return Ok(None);
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform");
    }

    info!("Shutdown signal sent to daemon process {}", pid);
    Ok(Some(pid))
}
