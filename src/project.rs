//! Project data model shared by the registry, scheduler and engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable, caller-assigned project identifier
pub type ProjectId = i64;

/// When a pending change is allowed to turn into a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Push at most once per `interval_seconds`
    #[default]
    #[serde(alias = "auto")]
    Interval,
    /// Push once a day at `fixed_time` (local clock)
    Fixed,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Interval => "interval",
            SyncMode::Fixed => "fixed",
        }
    }
}

/// Per-project sync policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Gate for all scheduling; disabled projects are never watched
    pub auto_push: bool,
    pub mode: SyncMode,
    pub interval_seconds: u64,
    /// Target time as "HH:MM"
    pub fixed_time: String,
    pub commit_prefix: String,
    /// Desired visibility of the hosted repository
    pub is_private: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            auto_push: true,
            mode: SyncMode::Interval,
            interval_seconds: 300,
            fixed_time: "00:00".to_string(),
            commit_prefix: "backup:".to_string(),
            is_private: true,
        }
    }
}

impl SyncPolicy {
    /// Interval clamped to the configured floor
    pub fn effective_interval(&self, min_interval_seconds: u64) -> u64 {
        self.interval_seconds.max(min_interval_seconds)
    }

    /// Parsed fixed-time target as (hour, minute), `None` when malformed
    pub fn fixed_target(&self) -> Option<(u32, u32)> {
        parse_fixed_time(&self.fixed_time)
    }

    /// Commit message for an automatic backup
    pub fn commit_message(&self, label: &str) -> String {
        let prefix = self.commit_prefix.trim();
        if prefix.is_empty() {
            label.to_string()
        } else {
            format!("{} {}", prefix, label)
        }
    }
}

/// Parse "HH:MM" into (hour, minute)
pub fn parse_fixed_time(value: &str) -> Option<(u32, u32)> {
    let (hour, minute) = value.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;

    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

/// Current sync status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local folder mirrored to hosted git
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedProject {
    pub id: ProjectId,
    pub name: String,
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub branch: String,
    pub policy: SyncPolicy,
    pub status: SyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
}

impl WatchedProject {
    pub fn new(id: ProjectId, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            remote_url: None,
            branch: "main".to_string(),
            policy: SyncPolicy::default(),
            status: SyncStatus::Idle,
            last_sync: None,
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_remote(mut self, remote_url: impl Into<String>) -> Self {
        self.remote_url = Some(remote_url.into());
        self
    }
}
