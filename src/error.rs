//! Error types for workcopy

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::OperationKind;

/// Hint attached to every non-fast-forward push rejection
pub const NON_FAST_FORWARD_HINT: &str = "Updates were rejected because the remote contains work that you do not have locally. \
Integrate the remote changes (e.g. pull) before pushing again, or force push to overwrite them.";

/// Orchestrator error types
#[derive(Error, Debug)]
pub enum WorkcopyError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Remote not found: {0}")]
    RemoteNotFound(String),

    #[error("Invalid reference")]
    InvalidReference,

    #[error("Operation not allowed: {0}")]
    OperationConflict(String),

    #[error("A {0} is already in progress")]
    ConflictKindAlreadyActive(OperationKind),

    #[error("{0} unresolved conflict(s) remain")]
    UnresolvedConflictsRemain(usize),

    #[error("Conflict markers remain in {0}")]
    ConflictMarkersRemain(String),

    #[error("The working tree has uncommitted changes that would be overwritten")]
    DirtyWorkingTree,

    #[error("{0}")]
    NoUpstream(String),

    #[error("Already up-to-date")]
    AlreadyUpToDate,

    #[error("Not possible to fast-forward")]
    FastForwardOnlyViolated,

    #[error("Merged files have unstaged changes: {}", .0.join(", "))]
    AbortBlockedByUnstagedChanges(Vec<String>),

    #[error("Operation busy: {0}")]
    OperationBusy(String),

    #[error("Transfer canceled")]
    TransferCanceled,

    #[error("{0} no longer accepts account passwords for Git operations; use a personal access token instead")]
    BasicAuthUnsupported(String),

    #[error("{0}")]
    Backend(String),
}

impl WorkcopyError {
    /// Stable code used when the error crosses a channel or process boundary
    pub fn code(&self) -> &'static str {
        match self {
            WorkcopyError::Git(_) | WorkcopyError::Backend(_) => "BACKEND_ERROR",
            WorkcopyError::Io(_) => "IO_ERROR",
            WorkcopyError::Serialization(_) => "SERIALIZATION_ERROR",
            WorkcopyError::RepositoryNotFound(_) => "REPO_NOT_FOUND",
            WorkcopyError::InvalidPath(_) => "INVALID_PATH",
            WorkcopyError::CommitNotFound(_) => "COMMIT_NOT_FOUND",
            WorkcopyError::RemoteNotFound(_) => "REMOTE_NOT_FOUND",
            WorkcopyError::InvalidReference => "INVALID_REFERENCE",
            WorkcopyError::OperationConflict(_) => "OPERATION_CONFLICT",
            WorkcopyError::ConflictKindAlreadyActive(_) => "CONFLICT_KIND_ALREADY_ACTIVE",
            WorkcopyError::UnresolvedConflictsRemain(_) => "UNRESOLVED_CONFLICTS_REMAIN",
            WorkcopyError::ConflictMarkersRemain(_) => "CONFLICT_MARKERS_REMAIN",
            WorkcopyError::DirtyWorkingTree => "DIRTY_WORKING_TREE",
            WorkcopyError::NoUpstream(_) => "NO_UPSTREAM",
            WorkcopyError::AlreadyUpToDate => "ALREADY_UP_TO_DATE",
            WorkcopyError::FastForwardOnlyViolated => "FAST_FORWARD_ONLY_VIOLATED",
            WorkcopyError::AbortBlockedByUnstagedChanges(_) => "ABORT_BLOCKED_BY_UNSTAGED_CHANGES",
            WorkcopyError::OperationBusy(_) => "OPERATION_BUSY",
            WorkcopyError::TransferCanceled => "TRANSFER_CANCELED",
            WorkcopyError::BasicAuthUnsupported(_) => "BASIC_AUTH_UNSUPPORTED",
        }
    }
}

/// Serializable error response for event streams
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl From<&WorkcopyError> for ErrorResponse {
    fn from(error: &WorkcopyError) -> Self {
        let details = match error {
            WorkcopyError::Git(e) => Some(format!("{:?}/{:?}", e.class(), e.code())),
            WorkcopyError::AbortBlockedByUnstagedChanges(paths) => Some(paths.join("\n")),
            _ => None,
        };

        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
            details,
        }
    }
}

impl From<WorkcopyError> for ErrorResponse {
    fn from(error: WorkcopyError) -> Self {
        ErrorResponse::from(&error)
    }
}

impl From<ErrorResponse> for WorkcopyError {
    /// Rebuild a typed error from a response that crossed a channel.
    /// Variants that carry no payload are restored exactly; the rest keep
    /// their message.
    fn from(response: ErrorResponse) -> Self {
        match response.code.as_str() {
            "TRANSFER_CANCELED" => WorkcopyError::TransferCanceled,
            "DIRTY_WORKING_TREE" => WorkcopyError::DirtyWorkingTree,
            "ALREADY_UP_TO_DATE" => WorkcopyError::AlreadyUpToDate,
            "FAST_FORWARD_ONLY_VIOLATED" => WorkcopyError::FastForwardOnlyViolated,
            "INVALID_REFERENCE" => WorkcopyError::InvalidReference,
            "NO_UPSTREAM" => WorkcopyError::NoUpstream(response.message),
            "REMOTE_NOT_FOUND" => WorkcopyError::RemoteNotFound(response.message),
            "OPERATION_CONFLICT" => WorkcopyError::OperationConflict(response.message),
            "OPERATION_BUSY" => WorkcopyError::OperationBusy(response.message),
            "BASIC_AUTH_UNSUPPORTED" => {
                let host = response
                    .message
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                WorkcopyError::BasicAuthUnsupported(host)
            }
            _ => WorkcopyError::Backend(response.message),
        }
    }
}

// Errors serialize as their response so they can ride along in events
impl serde::Serialize for WorkcopyError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ErrorResponse::from(self).serialize(serializer)
    }
}

/// Result type alias for workcopy operations
pub type Result<T> = std::result::Result<T, WorkcopyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_round_trip_keeps_cancellation() {
        let response = ErrorResponse::from(WorkcopyError::TransferCanceled);
        assert_eq!(response.code, "TRANSFER_CANCELED");
        assert!(matches!(
            WorkcopyError::from(response),
            WorkcopyError::TransferCanceled
        ));
    }

    #[test]
    fn test_basic_auth_unsupported_keeps_host() {
        let error = WorkcopyError::BasicAuthUnsupported("github.com".to_string());
        let restored = WorkcopyError::from(ErrorResponse::from(&error));
        match restored {
            WorkcopyError::BasicAuthUnsupported(host) => assert_eq!(host, "github.com"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_git_errors_are_backend_errors() {
        let error = WorkcopyError::from(git2::Error::from_str("boom"));
        assert_eq!(error.code(), "BACKEND_ERROR");
    }

    #[test]
    fn test_unstaged_paths_listed_in_details() {
        let error = WorkcopyError::AbortBlockedByUnstagedChanges(vec![
            "a.txt".to_string(),
            "b.txt".to_string(),
        ]);
        let response = ErrorResponse::from(&error);
        assert_eq!(response.details.as_deref(), Some("a.txt\nb.txt"));
        assert!(response.message.contains("a.txt, b.txt"));
    }
}
