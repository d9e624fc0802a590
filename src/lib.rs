//! keepsync - Continuous git backup for local project folders
//!
//! keepsync watches registered folders, collapses bursts of file changes into
//! a pending marker per project, and on each scheduler tick commits and pushes
//! the projects whose policy allows it.
//!
//! ## Modules
//!
//! - [`watcher`]: Recursive filesystem watches with noise filtering
//! - [`debounce`]: Pending-change markers, one per project
//! - [`schedule`]: Interval and fixed-time policy evaluation
//! - [`state`]: The `idle | syncing | error` state machine
//! - [`git`]: Git reconciliation (status, sync, bootstrap)
//! - [`hosting`]: GitHub repositories, visibility and credentials
//! - [`engine`]: The tick loop tying everything together
//! - [`registry`]: SQLite project registry and event log
//! - [`daemon`]: Background service and PID file handling

pub mod config;
pub mod daemon;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod git;
pub mod hosting;
pub mod progress;
pub mod project;
pub mod registry;
pub mod schedule;
pub mod state;
pub mod watcher;

pub use config::Config;
pub use daemon::Daemon;
pub use engine::{RefreshSummary, SyncEngine};
pub use error::{Result, SyncError};
pub use git::{BootstrapRequest, GitClient, StatusReport, SyncOutcome};
pub use hosting::{CredentialProvider, GitHubProvider, HostingProvider};
pub use progress::{Level, ProgressSink};
pub use project::{ProjectId, SyncPolicy, SyncStatus, WatchedProject};
pub use registry::{ProjectRegistry, SqliteRegistry};
