//! Filesystem change notification per project
//!
//! One recursive `notify` watcher per project. Callbacks run on notify's
//! delivery thread and only hand the project id to the change callback, which
//! must stay cheap (the engine records a debounce marker).

use notify::event::{CreateKind, MetadataKind, ModifyKind};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::project::ProjectId;

/// Invoked with the project id for every qualifying change
pub type ChangeCallback = Arc<dyn Fn(ProjectId) + Send + Sync>;

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];
const NOISE_DIRS: &[&str] = &["__pycache__", "node_modules", ".cache"];
const NOISE_SUFFIXES: &[&str] = &[
    ".log", ".tmp", ".swp", ".swo", ".swx", "~", ".cache", ".db", ".sqlite", ".sqlite3", "-journal",
    "-wal", "-shm",
];

/// Decides which paths count as user changes
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    /// Local state files, such as the registry database
    state_files: Vec<PathBuf>,
    patterns: Vec<Regex>,
}

impl ChangeFilter {
    /// Build a filter from user glob patterns (`*` matches any run of characters)
    pub fn new(ignore_patterns: &[String]) -> Self {
        let patterns = ignore_patterns
            .iter()
            .filter_map(|pattern| {
                let regex = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
                match Regex::new(&regex) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Ignoring invalid watcher pattern {:?}: {}", pattern, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            state_files: Vec::new(),
            patterns,
        }
    }

    /// Also ignore `path` and its SQLite sidecar files
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_files.push(path.into());
        self
    }

    /// Whether a change at `path` under `root` should schedule a sync.
    /// Only the path itself is inspected; directories are rejected by the caller.
    pub fn is_relevant(&self, root: &Path, path: &Path) -> bool {
        if self.is_state_file(path) {
            return false;
        }

        let relative = path.strip_prefix(root).unwrap_or(path);
        let components: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();

        let Some((file_name, dirs)) = components.split_last() else {
            return false;
        };

        if dirs
            .iter()
            .any(|dir| VCS_DIRS.contains(dir) || NOISE_DIRS.contains(dir))
        {
            return false;
        }

        if VCS_DIRS.contains(file_name) || NOISE_DIRS.contains(file_name) {
            return false;
        }

        if file_name.starts_with('.') && *file_name != ".gitignore" {
            return false;
        }

        if NOISE_SUFFIXES.iter().any(|suffix| file_name.ends_with(suffix)) {
            return false;
        }

        if !self.patterns.is_empty() {
            let relative = components.join("/");
            if self
                .patterns
                .iter()
                .any(|re| re.is_match(file_name) || re.is_match(&relative))
            {
                return false;
            }
        }

        true
    }

    fn is_state_file(&self, path: &Path) -> bool {
        self.state_files.iter().any(|state| {
            if path == state {
                return true;
            }
            let (Some(state), Some(candidate)) = (state.to_str(), path.to_str()) else {
                return false;
            };
            candidate
                .strip_prefix(state)
                .is_some_and(|rest| rest.starts_with('-'))
        })
    }
}

/// Whether an event kind is a create or content/name change
fn is_change_signal(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(CreateKind::Folder) => false,
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Whether a notify event should mark the project changed. Runs on the
/// delivery thread, so it only inspects the event and never touches the disk.
fn signals_change(filter: &ChangeFilter, root: &Path, event: &Event) -> bool {
    is_change_signal(&event.kind) && event.paths.iter().any(|path| filter.is_relevant(root, path))
}

struct Registration {
    root: PathBuf,
    // Dropping the watcher stops delivery
    _watcher: RecommendedWatcher,
}

/// Owns the per-project watchers
pub struct ChangeNotifier {
    filter: Arc<ChangeFilter>,
    watches: Mutex<HashMap<ProjectId, Registration>>,
}

impl ChangeNotifier {
    pub fn new(filter: ChangeFilter) -> Self {
        Self {
            filter: Arc::new(filter),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start a recursive watch on `root`.
    ///
    /// Returns `false` if the project was already watched at the same root.
    /// A project watched at a different root is re-registered.
    pub fn watch(&self, id: ProjectId, root: &Path, on_change: ChangeCallback) -> Result<bool> {
        if let Some(existing) = self.watches.lock().get(&id) {
            if existing.root == root {
                return Ok(false);
            }
        }

        if !root.is_dir() {
            return Err(SyncError::PathNotFound(root.to_path_buf()));
        }

        let filter = Arc::clone(&self.filter);
        let watch_root = root.to_path_buf();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if signals_change(&filter, &watch_root, &event) {
                    on_change(id);
                }
            }
            Err(e) => debug!("Watch error for project {}: {}", id, e),
        })
        .map_err(|e| SyncError::WatchFailed {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::WatchFailed {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        info!("Watching project {} at {}", id, root.display());
        self.watches.lock().insert(
            id,
            Registration {
                root: root.to_path_buf(),
                _watcher: watcher,
            },
        );
        Ok(true)
    }

    /// Stop watching a project. Returns whether it was watched.
    pub fn unwatch(&self, id: ProjectId) -> bool {
        let removed = self.watches.lock().remove(&id);
        if let Some(registration) = &removed {
            info!("Stopped watching project {} at {}", id, registration.root.display());
        }
        removed.is_some()
    }

    pub fn is_watching(&self, id: ProjectId) -> bool {
        self.watches.lock().contains_key(&id)
    }

    /// Ids of all watched projects
    pub fn watched(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.watches.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every watcher
    pub fn clear(&self) {
        self.watches.lock().clear();
    }
}
