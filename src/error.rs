//! Error taxonomy for the synchronization engine
//!
//! Every failure inside the engine is classified into one of these variants so
//! callers can tell an orphaned remote from a network blip from a missing
//! folder. Application code (CLI, config, registry) keeps using `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

use crate::project::ProjectId;

/// Engine errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("no remote configured for {0}")]
    NoRemoteConfigured(PathBuf),

    #[error("no hosting credentials available")]
    MissingCredentials,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The hosted repository was deleted out-of-band; carries its name.
    #[error("remote repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("hosting transport failure: {0}")]
    TransportFailure(String),

    #[error("failed to watch {path}: {reason}")]
    WatchFailed { path: PathBuf, reason: String },

    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("project {0} is already syncing")]
    AlreadySyncing(ProjectId),

    #[error("cannot resolve repository from remote url: {0}")]
    InvalidRemoteUrl(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Whether this error means the hosted repository no longer exists
    pub fn is_orphaned_remote(&self) -> bool {
        matches!(self, SyncError::RepositoryNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_not_found_carries_name() {
        let err = SyncError::RepositoryNotFound("notes".to_string());
        assert!(err.is_orphaned_remote());
        assert_eq!(err.to_string(), "remote repository not found: notes");
    }

    #[test]
    fn test_push_failed_is_not_orphaned() {
        let err = SyncError::PushFailed("connection reset".to_string());
        assert!(!err.is_orphaned_remote());
        assert!(err.to_string().contains("connection reset"));
    }
}
