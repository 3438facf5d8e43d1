//! Error taxonomy for FoxNest
//!
//! Every fallible core operation returns [`FoxError`]. Local store errors are
//! never recovered silently; they carry the object identity or path involved.

use std::path::PathBuf;
use std::time::Duration;

use crate::object::ObjectId;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, FoxError>;

/// Errors that can occur in the object store, pack subsystem and sync protocol
#[derive(Debug, thiserror::Error)]
pub enum FoxError {
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Integrity error: object claimed as {claimed} hashes to {actual}")]
    Integrity { claimed: ObjectId, actual: ObjectId },

    #[error("Incomplete transfer: object {object} references {dependency}, which was neither stored nor sent earlier")]
    IncompleteTransfer {
        object: ObjectId,
        dependency: ObjectId,
    },

    #[error("Corruption detected: {0}")]
    CorruptionDetected(String),

    #[error("Corrupt pack {path:?}: {reason}")]
    CorruptPack { path: PathBuf, reason: String },

    #[error("Invalid object: {reason}")]
    InvalidObject { id: Option<ObjectId>, reason: String },

    #[error("Repository {0} is archived; pushes are rejected until it is unarchived")]
    RepositoryArchived(String),

    #[error("Repository is already archived")]
    AlreadyArchived,

    #[error("Repository is not archived")]
    NotArchived,

    #[error("Timed out after {waited:?} waiting for repository lock {path:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("History diverged: local head {local}, remote head {remote}")]
    Diverged { local: String, remote: String },

    #[error("Nothing to commit")]
    NothingToCommit,

    #[error("Not a FoxNest repository: {0:?}")]
    NotInitialized(PathBuf),

    #[error("Repository already initialized at {0:?}")]
    AlreadyInitialized(PathBuf),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Invalid repository id: {0:?}")]
    InvalidRepositoryId(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FoxError {
    /// Transient failures the caller may retry as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, FoxError::LockTimeout { .. } | FoxError::Connectivity(_))
    }

    pub(crate) fn invalid(id: Option<ObjectId>, reason: impl Into<String>) -> Self {
        FoxError::InvalidObject {
            id,
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for FoxError {
    fn from(e: bincode::Error) -> Self {
        FoxError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FoxError {
    fn from(e: serde_json::Error) -> Self {
        FoxError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(FoxError::Connectivity("refused".into()).is_retryable());
        assert!(FoxError::LockTimeout {
            path: PathBuf::from("/tmp/lock"),
            waited: Duration::from_millis(10),
        }
        .is_retryable());
        assert!(!FoxError::RepositoryArchived("r".into()).is_retryable());
        assert!(!FoxError::CorruptionDetected("bad".into()).is_retryable());
    }

    #[test]
    fn test_invalid_object_message() {
        let err = FoxError::invalid(None, "truncated header");
        assert_eq!(err.to_string(), "Invalid object: truncated header");
    }
}
