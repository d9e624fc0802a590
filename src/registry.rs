//! Project registry - SQLite-backed store of watched projects and progress events
//!
//! The engine reads projects through the [`ProjectRegistry`] trait and writes
//! back only status and last-sync time. Everything else (adding, removing,
//! editing policies) is done by the CLI through [`SqliteRegistry`] directly.
//!
//! The database is stored in XDG_DATA_HOME/keepsync/state.db by default.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::progress::{Level, ProgressEvent, ProgressSink};
use crate::project::{ProjectId, SyncPolicy, SyncStatus, WatchedProject};

/// Read/refresh view of the registry used by the engine
#[cfg_attr(test, mockall::automock)]
pub trait ProjectRegistry: Send + Sync {
    fn list_projects(&self) -> Result<Vec<WatchedProject>>;

    /// Projects with auto-push enabled
    fn list_auto_push_projects(&self) -> Result<Vec<WatchedProject>>;

    fn get(&self, id: ProjectId) -> Result<Option<WatchedProject>>;

    fn update_status(&self, id: ProjectId, status: SyncStatus) -> Result<()>;

    /// Move a project's stored status into `syncing` unless another process
    /// holds a live claim. Returns whether the claim was taken.
    fn try_claim(&self, id: ProjectId) -> Result<bool>;

    fn update_last_sync(&self, id: ProjectId, at: DateTime<Utc>) -> Result<()>;
}

/// Fields supplied when registering a project
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub branch: String,
    pub policy: SyncPolicy,
}

impl NewProject {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            remote_url: None,
            branch: "main".to_string(),
            policy: SyncPolicy::default(),
        }
    }
}

/// SQLite registry
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

/// A `syncing` row older than this is treated as left behind by a dead process
const CLAIM_LEASE_MINUTES: i64 = 60;

const PROJECT_COLUMNS: &str = "id, name, path, remote_url, branch, policy, status, last_sync_at";

impl SqliteRegistry {
    /// Open or create the registry at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        // The daemon and CLI share this file
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set database busy timeout")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;

        info!("Project registry opened at {}", path.display());
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn initialize(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    path TEXT UNIQUE NOT NULL,
                    remote_url TEXT,
                    branch TEXT NOT NULL DEFAULT 'main',
                    policy TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'idle',
                    last_sync_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    project_id INTEGER,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id, timestamp);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Project Operations
    // =========================================================================

    /// Register a project and return its id
    pub fn add_project(&self, project: &NewProject) -> Result<ProjectId> {
        let policy = serde_json::to_string(&project.policy).context("Failed to serialize policy")?;
        let path = project.path.to_string_lossy();
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO projects (name, path, remote_url, branch, policy, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'idle', ?6)
            "#,
            params![
                project.name,
                path,
                project.remote_url,
                project.branch,
                policy,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to register project at {}", path))?;

        let id = conn.last_insert_rowid();
        debug!("Registered project {} ({}) at {}", id, project.name, path);
        Ok(id)
    }

    /// Remove a project. Returns whether it existed.
    pub fn remove_project(&self, id: ProjectId) -> Result<bool> {
        let count = self
            .conn
            .lock()
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to remove project")?;
        Ok(count > 0)
    }

    pub fn find_by_path(&self, path: &Path) -> Result<Option<WatchedProject>> {
        let sql = format!("SELECT {} FROM projects WHERE path = ?1", PROJECT_COLUMNS);
        self.conn
            .lock()
            .query_row(&sql, params![path.to_string_lossy()], row_to_project)
            .optional()
            .context("Failed to look up project by path")
    }

    pub fn set_policy(&self, id: ProjectId, policy: &SyncPolicy) -> Result<()> {
        let policy = serde_json::to_string(policy).context("Failed to serialize policy")?;
        self.update_column(id, "policy", &policy)
    }

    pub fn set_remote_url(&self, id: ProjectId, remote_url: Option<&str>) -> Result<()> {
        let count = self
            .conn
            .lock()
            .execute(
                "UPDATE projects SET remote_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![remote_url, Utc::now().to_rfc3339(), id],
            )
            .context("Failed to update remote url")?;
        ensure_updated(count, id)
    }

    fn update_column(&self, id: ProjectId, column: &str, value: &str) -> Result<()> {
        let sql = format!("UPDATE projects SET {} = ?1, updated_at = ?2 WHERE id = ?3", column);
        let count = self
            .conn
            .lock()
            .execute(&sql, params![value, Utc::now().to_rfc3339(), id])
            .with_context(|| format!("Failed to update {} of project {}", column, id))?;
        ensure_updated(count, id)
    }

    fn query_projects(&self, filter: &str) -> Result<Vec<WatchedProject>> {
        let sql = format!("SELECT {} FROM projects {} ORDER BY id", PROJECT_COLUMNS, filter);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;

        let projects = stmt
            .query_map([], row_to_project)
            .context("Failed to query projects")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect projects")?;

        Ok(projects)
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    pub fn record_event(&self, event: &ProgressEvent) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (timestamp, project_id, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.time.to_rfc3339(),
                event.project_id,
                event.level.as_str(),
                event.message,
            ],
        )
        .context("Failed to record event")?;

        Ok(conn.last_insert_rowid())
    }

    /// Most recent events first, optionally for one project
    pub fn recent_events(&self, limit: u32, project: Option<ProjectId>) -> Result<Vec<ProgressEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT timestamp, project_id, level, message FROM events
                WHERE ?1 IS NULL OR project_id = ?1
                ORDER BY timestamp DESC, id DESC
                LIMIT ?2
                "#,
            )
            .context("Failed to prepare event query")?;

        let events = stmt
            .query_map(params![project, limit], |row| {
                let timestamp: String = row.get(0)?;
                let level: String = row.get(2)?;
                Ok(ProgressEvent {
                    time: parse_timestamp(&timestamp).unwrap_or_else(Utc::now),
                    project_id: row.get(1)?,
                    level: Level::parse(&level).unwrap_or(Level::Info),
                    message: row.get(3)?,
                })
            })
            .context("Failed to query events")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect events")?;

        Ok(events)
    }

    /// Delete events older than `days`
    pub fn prune_events(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let count = self
            .conn
            .lock()
            .execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff.to_rfc3339()])
            .context("Failed to prune old events")?;
        Ok(count as u64)
    }
}

impl ProjectRegistry for SqliteRegistry {
    fn list_projects(&self) -> Result<Vec<WatchedProject>> {
        self.query_projects("")
    }

    fn list_auto_push_projects(&self) -> Result<Vec<WatchedProject>> {
        // Policy is stored as JSON; filter after decoding so defaults apply
        Ok(self
            .list_projects()?
            .into_iter()
            .filter(|p| p.policy.auto_push)
            .collect())
    }

    fn get(&self, id: ProjectId) -> Result<Option<WatchedProject>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        self.conn
            .lock()
            .query_row(&sql, params![id], row_to_project)
            .optional()
            .context("Failed to get project")
    }

    fn update_status(&self, id: ProjectId, status: SyncStatus) -> Result<()> {
        self.update_column(id, "status", status.as_str())
    }

    fn try_claim(&self, id: ProjectId) -> Result<bool> {
        let now = Utc::now();
        let stale = now - chrono::Duration::minutes(CLAIM_LEASE_MINUTES);
        let conn = self.conn.lock();

        let count = conn
            .execute(
                r#"
                UPDATE projects SET status = 'syncing', updated_at = ?2
                WHERE id = ?1 AND (status != 'syncing' OR updated_at < ?3)
                "#,
                params![id, now.to_rfc3339(), stale.to_rfc3339()],
            )
            .with_context(|| format!("Failed to claim project {}", id))?;
        if count > 0 {
            return Ok(true);
        }

        let exists: bool = conn
            .query_row("SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)", params![id], |row| {
                row.get(0)
            })
            .context("Failed to look up project")?;
        if !exists {
            anyhow::bail!("Project {} not found", id);
        }
        Ok(false)
    }

    fn update_last_sync(&self, id: ProjectId, at: DateTime<Utc>) -> Result<()> {
        self.update_column(id, "last_sync_at", &at.to_rfc3339())
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<WatchedProject> {
    let id: ProjectId = row.get(0)?;
    let path: String = row.get(2)?;
    let policy: String = row.get(5)?;
    let status: String = row.get(6)?;
    let last_sync_at: Option<String> = row.get(7)?;

    let policy = serde_json::from_str(&policy).unwrap_or_else(|e| {
        warn!("Project {} has an unreadable policy, using defaults: {}", id, e);
        SyncPolicy::default()
    });

    Ok(WatchedProject {
        id,
        name: row.get(1)?,
        path: PathBuf::from(path),
        remote_url: row.get(3)?,
        branch: row.get(4)?,
        policy,
        status: SyncStatus::parse(&status),
        last_sync: last_sync_at.as_deref().and_then(parse_timestamp),
    })
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn ensure_updated(count: usize, id: ProjectId) -> Result<()> {
    if count == 0 {
        anyhow::bail!("Project {} not found", id);
    }
    Ok(())
}

/// Progress sink that appends to the registry's event log
pub struct EventLogSink {
    registry: Arc<SqliteRegistry>,
}

impl EventLogSink {
    pub fn new(registry: Arc<SqliteRegistry>) -> Self {
        Self { registry }
    }
}

impl ProgressSink for EventLogSink {
    fn emit(&self, message: &str, level: Level, project_id: Option<ProjectId>) {
        let event = ProgressEvent {
            time: Utc::now(),
            message: message.to_string(),
            level,
            project_id,
        };
        if let Err(e) = self.registry.record_event(&event) {
            debug!("Dropped progress event: {}", e);
        }
    }
}
