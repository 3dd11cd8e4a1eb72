//! Compound operation models

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ConflictEntry;

/// Kind of porcelain operation that can be active on a repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    #[default]
    None,
    Merge,
    Rebase,
    Revert,
    CherryPick,
    Stash,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::None => "none",
            OperationKind::Merge => "merge",
            OperationKind::Rebase => "rebase",
            OperationKind::Revert => "revert",
            OperationKind::CherryPick => "cherry-pick",
            OperationKind::Stash => "stash",
        };
        f.write_str(name)
    }
}

impl From<git2::RepositoryState> for OperationKind {
    fn from(state: git2::RepositoryState) -> Self {
        match state {
            git2::RepositoryState::Merge => OperationKind::Merge,
            git2::RepositoryState::Revert | git2::RepositoryState::RevertSequence => {
                OperationKind::Revert
            }
            git2::RepositoryState::CherryPick | git2::RepositoryState::CherryPickSequence => {
                OperationKind::CherryPick
            }
            git2::RepositoryState::Rebase
            | git2::RepositoryState::RebaseInteractive
            | git2::RepositoryState::RebaseMerge => OperationKind::Rebase,
            _ => OperationKind::None,
        }
    }
}

/// Why a running operation ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum FailureReason {
    DirtyWorkingTree,
    NoUpstream,
    AlreadyUpToDate,
    FastForwardOnlyViolated,
    BackendError(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::DirtyWorkingTree => f.write_str("working tree has uncommitted changes"),
            FailureReason::NoUpstream => f.write_str("no upstream configured"),
            FailureReason::AlreadyUpToDate => f.write_str("already up-to-date"),
            FailureReason::FastForwardOnlyViolated => f.write_str("not possible to fast-forward"),
            FailureReason::BackendError(detail) => f.write_str(detail),
        }
    }
}

/// Lifecycle state of the active operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "failure", rename_all = "kebab-case")]
pub enum OperationState {
    #[default]
    Idle,
    Running,
    ConflictPaused,
    Completed,
    Aborted,
    Failed(FailureReason),
}

impl OperationState {
    /// A new operation may begin from this state
    pub fn accepts_begin(&self) -> bool {
        matches!(
            self,
            OperationState::Idle
                | OperationState::Completed
                | OperationState::Aborted
                | OperationState::Failed(_)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OperationState::Failed(_))
    }
}

/// How a merge integrates the source commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    #[default]
    Default,
    FastForwardOnly,
    NoFastForward,
    Squash,
}

/// A compound operation and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OperationRequest {
    Merge {
        source: String,
        #[serde(default)]
        mode: MergeMode,
        #[serde(default)]
        message: Option<String>,
    },
    Rebase {
        onto: String,
    },
    Revert {
        commit: String,
    },
    CherryPick {
        commit: String,
    },
    Stash {
        #[serde(default)]
        index: usize,
        #[serde(default)]
        pop: bool,
    },
}

impl OperationRequest {
    pub fn merge(source: impl Into<String>) -> Self {
        OperationRequest::Merge {
            source: source.into(),
            mode: MergeMode::Default,
            message: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Merge { .. } => OperationKind::Merge,
            OperationRequest::Rebase { .. } => OperationKind::Rebase,
            OperationRequest::Revert { .. } => OperationKind::Revert,
            OperationRequest::CherryPick { .. } => OperationKind::CherryPick,
            OperationRequest::Stash { .. } => OperationKind::Stash,
        }
    }
}

/// Position within a multi-step operation (rebase)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub current: usize,
    pub total: usize,
}

/// Result of running one backend step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Conflicted {
        paths: Vec<String>,
        progress: Option<StepProgress>,
    },
}

/// Point-in-time view of the active operation
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub kind: OperationKind,
    pub state: OperationState,
    pub progress: Option<StepProgress>,
    pub conflicts: Vec<ConflictEntry>,
}

/// One state change, published to transition subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTransition {
    pub kind: OperationKind,
    pub from: OperationState,
    pub to: OperationState,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_allowed_from_terminal_states() {
        assert!(OperationState::Idle.accepts_begin());
        assert!(OperationState::Completed.accepts_begin());
        assert!(OperationState::Aborted.accepts_begin());
        assert!(OperationState::Failed(FailureReason::AlreadyUpToDate).accepts_begin());
        assert!(!OperationState::Running.accepts_begin());
        assert!(!OperationState::ConflictPaused.accepts_begin());
    }

    #[test]
    fn test_request_serializes_with_kind_tag() {
        let request = OperationRequest::CherryPick {
            commit: "abc123".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "cherry-pick");
        assert_eq!(request.kind(), OperationKind::CherryPick);
    }

    #[test]
    fn test_repository_state_mapping() {
        assert_eq!(
            OperationKind::from(git2::RepositoryState::RebaseMerge),
            OperationKind::Rebase
        );
        assert_eq!(
            OperationKind::from(git2::RepositoryState::Bisect),
            OperationKind::None
        );
    }
}
