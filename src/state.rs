//! In-memory sync state machine
//!
//! `idle | error -> syncing -> idle | error`. Entering `syncing` hands out a
//! [`SyncTicket`]; the ticket is the only way to leave it. At most one ticket
//! exists per project at any time, which serializes reconciliation per
//! project while letting different projects sync concurrently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::project::{ProjectId, SyncStatus};

/// How a sync attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Changes were pushed; last-sync should advance
    Synced,
    /// Nothing needed pushing; last-sync is left alone
    Checked,
    Failed,
}

impl Completion {
    fn status(self) -> SyncStatus {
        match self {
            Completion::Synced | Completion::Checked => SyncStatus::Idle,
            Completion::Failed => SyncStatus::Error,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProjectStates {
    table: Mutex<HashMap<ProjectId, SyncStatus>>,
}

impl ProjectStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status; unknown projects are idle
    pub fn status(&self, id: ProjectId) -> SyncStatus {
        self.table.lock().get(&id).copied().unwrap_or_default()
    }

    pub fn is_syncing(&self, id: ProjectId) -> bool {
        self.status(id) == SyncStatus::Syncing
    }

    /// Move a project into `syncing`.
    ///
    /// Fails with `AlreadySyncing` when another attempt holds the ticket.
    pub fn try_begin(self: &Arc<Self>, id: ProjectId) -> Result<SyncTicket> {
        let mut table = self.table.lock();
        let status = table.entry(id).or_default();
        if *status == SyncStatus::Syncing {
            return Err(SyncError::AlreadySyncing(id));
        }
        let previous = std::mem::replace(status, SyncStatus::Syncing);

        Ok(SyncTicket {
            id,
            previous,
            states: Arc::clone(self),
            done: false,
        })
    }

    /// Forget a project that is no longer watched. A project mid-sync keeps
    /// its entry until its ticket completes.
    pub fn forget(&self, id: ProjectId) {
        let mut table = self.table.lock();
        if table.get(&id) != Some(&SyncStatus::Syncing) {
            table.remove(&id);
        }
    }

    /// Projects currently syncing
    pub fn in_flight(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self
            .table
            .lock()
            .iter()
            .filter(|(_, status)| **status == SyncStatus::Syncing)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn finish(&self, id: ProjectId, status: SyncStatus) {
        self.table.lock().insert(id, status);
    }
}

/// Proof that a project is in `syncing`.
///
/// Dropping a ticket without completing it (a panicked worker) counts as a
/// failure.
#[derive(Debug)]
pub struct SyncTicket {
    id: ProjectId,
    previous: SyncStatus,
    states: Arc<ProjectStates>,
    done: bool,
}

impl SyncTicket {
    /// Leave `syncing` and return the resulting status
    pub fn complete(mut self, completion: Completion) -> SyncStatus {
        let status = completion.status();
        self.states.finish(self.id, status);
        self.done = true;
        status
    }

    /// Give the ticket back without attempting a sync. The project returns
    /// to the status it had before.
    pub fn cancel(mut self) -> SyncStatus {
        self.states.finish(self.id, self.previous);
        self.done = true;
        self.previous
    }
}

impl Drop for SyncTicket {
    fn drop(&mut self) {
        if !self.done {
            warn!("Sync of project {} ended without completing, marking as error", self.id);
            self.states.finish(self.id, SyncStatus::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_transitions() {
        let states = Arc::new(ProjectStates::new());
        assert_eq!(states.status(1), SyncStatus::Idle);

        let ticket = states.try_begin(1).unwrap();
        assert_eq!(states.status(1), SyncStatus::Syncing);
        assert_eq!(ticket.complete(Completion::Failed), SyncStatus::Error);
        assert_eq!(states.status(1), SyncStatus::Error);

        // error -> syncing -> idle
        let ticket = states.try_begin(1).unwrap();
        assert_eq!(ticket.complete(Completion::Checked), SyncStatus::Idle);
        assert_eq!(states.status(1), SyncStatus::Idle);
    }

    #[test]
    fn test_second_begin_is_rejected() {
        let states = Arc::new(ProjectStates::new());
        let ticket = states.try_begin(1).unwrap();

        assert_matches!(states.try_begin(1), Err(SyncError::AlreadySyncing(1)));
        // Other projects are independent
        let other = states.try_begin(2).unwrap();
        assert_eq!(states.in_flight(), vec![1, 2]);

        ticket.complete(Completion::Synced);
        other.complete(Completion::Synced);
        assert!(states.in_flight().is_empty());
        assert!(states.try_begin(1).is_ok());
    }

    #[test]
    fn test_dropped_ticket_marks_error() {
        let states = Arc::new(ProjectStates::new());
        drop(states.try_begin(3).unwrap());
        assert_eq!(states.status(3), SyncStatus::Error);
    }

    #[test]
    fn test_cancel_restores_previous_status() {
        let states = Arc::new(ProjectStates::new());
        states.try_begin(1).unwrap().complete(Completion::Failed);

        let ticket = states.try_begin(1).unwrap();
        assert_eq!(ticket.cancel(), SyncStatus::Error);
        assert_eq!(states.status(1), SyncStatus::Error);
        assert!(states.in_flight().is_empty());

        assert_eq!(states.try_begin(2).unwrap().cancel(), SyncStatus::Idle);
    }

    #[test]
    fn test_forget_keeps_in_flight_entries() {
        let states = Arc::new(ProjectStates::new());
        let ticket = states.try_begin(1).unwrap();
        states.forget(1);
        assert!(states.is_syncing(1));

        ticket.complete(Completion::Synced);
        states.forget(1);
        assert_eq!(states.status(1), SyncStatus::Idle);
    }

    #[test]
    fn test_concurrent_begins_admit_exactly_one() {
        let states = Arc::new(ProjectStates::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let states = Arc::clone(&states);
                std::thread::spawn(move || states.try_begin(5).ok())
            })
            .collect();

        let tickets: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(tickets.len(), 1);
    }
}
