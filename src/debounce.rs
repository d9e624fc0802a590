//! Collapses bursts of filesystem events into one pending marker per project

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::project::ProjectId;

/// What the scheduler decided for a pending marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Remove the marker and dispatch a sync
    Due,
    /// Keep the marker for a later tick
    NotDue,
    /// Remove the marker without syncing
    Drop,
}

#[derive(Debug, Default)]
struct Table {
    /// Projects allowed to hold a marker
    eligible: HashSet<ProjectId>,
    /// Last qualifying change per project
    pending: HashMap<ProjectId, DateTime<Utc>>,
}

/// Pending-sync markers, shared between watcher callbacks and the tick loop.
///
/// Both sets live under one lock so a project that loses eligibility can never
/// keep or regain a marker.
#[derive(Debug, Default)]
pub struct Debouncer {
    table: Mutex<Table>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow markers for a project
    pub fn enable(&self, id: ProjectId) {
        self.table.lock().eligible.insert(id);
    }

    /// Forbid markers for a project and drop any it holds.
    /// Returns whether a marker was dropped.
    pub fn disable(&self, id: ProjectId) -> bool {
        let mut table = self.table.lock();
        table.eligible.remove(&id);
        table.pending.remove(&id).is_some()
    }

    pub fn is_enabled(&self, id: ProjectId) -> bool {
        self.table.lock().eligible.contains(&id)
    }

    /// Note a change now. Returns `false` when the project is not eligible.
    pub fn record_change(&self, id: ProjectId) -> bool {
        self.record_change_at(id, Utc::now())
    }

    pub fn record_change_at(&self, id: ProjectId, at: DateTime<Utc>) -> bool {
        let mut table = self.table.lock();
        if !table.eligible.contains(&id) {
            return false;
        }
        table.pending.insert(id, at);
        true
    }

    /// Put back a marker removed by [`drain_due`](Self::drain_due) whose
    /// dispatch did not happen. A newer marker wins.
    pub fn restore(&self, id: ProjectId, changed_at: DateTime<Utc>) {
        let mut table = self.table.lock();
        if table.eligible.contains(&id) {
            table.pending.entry(id).or_insert(changed_at);
        }
    }

    /// Remove and return a project's marker
    pub fn take(&self, id: ProjectId) -> Option<DateTime<Utc>> {
        self.table.lock().pending.remove(&id)
    }

    pub fn has_pending(&self, id: ProjectId) -> bool {
        self.table.lock().pending.contains_key(&id)
    }

    /// Snapshot of every marker, ordered by project id
    pub fn pending(&self) -> Vec<(ProjectId, DateTime<Utc>)> {
        let mut pending: Vec<_> = self.table.lock().pending.iter().map(|(id, at)| (*id, *at)).collect();
        pending.sort_by_key(|(id, _)| *id);
        pending
    }

    pub fn len(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every marker and remove those decided `Due` or `Drop`.
    ///
    /// `decide` runs without the lock held, so it may do lookups that block.
    /// Returns the `Due` markers with their change timestamps.
    pub fn drain_due<F>(&self, mut decide: F) -> Vec<(ProjectId, DateTime<Utc>)>
    where
        F: FnMut(ProjectId, DateTime<Utc>) -> Decision,
    {
        let snapshot = self.pending();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let decisions: Vec<_> = snapshot
            .into_iter()
            .map(|(id, at)| (id, at, decide(id, at)))
            .collect();

        let mut table = self.table.lock();
        let mut due = Vec::new();
        for (id, at, decision) in decisions {
            match decision {
                Decision::Due => {
                    table.pending.remove(&id);
                    due.push((id, at));
                }
                Decision::Drop => {
                    table.pending.remove(&id);
                }
                Decision::NotDue => {}
            }
        }
        due
    }
}
