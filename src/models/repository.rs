//! Repository status models

use serde::{Deserialize, Serialize};

use super::{OperationKind, OperationState, StepProgress};

/// Configured remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub push_url: Option<String>,
}

/// Upstream a local branch integrates with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamInfo {
    pub remote: String,
    /// Branch name on the remote, without `refs/heads/`
    pub branch: String,
}

impl UpstreamInfo {
    /// Short remote-tracking name, e.g. `origin/main`
    pub fn tracking_name(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    pub fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }
}

/// Snapshot published after every transition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub branch: Option<String>,
    pub detached: bool,
    pub upstream: Option<String>,
    pub ahead: usize,
    pub behind: usize,
    pub operation: OperationKind,
    pub state: OperationState,
    pub banner: Option<String>,
    pub unresolved_conflicts: usize,
}

/// Banner text shown while an operation is in progress. An `Idle` state
/// with a kind is an operation adopted on open that awaits continue or abort.
pub fn operation_banner(
    kind: OperationKind,
    state: &OperationState,
    progress: Option<StepProgress>,
) -> Option<String> {
    if !matches!(
        state,
        OperationState::Running | OperationState::ConflictPaused | OperationState::Idle
    ) {
        return None;
    }

    let banner = match kind {
        OperationKind::None => return None,
        OperationKind::Merge => "MERGING".to_string(),
        OperationKind::Rebase => match progress {
            Some(p) => format!("REBASING {}/{}", p.current, p.total),
            None => "REBASING".to_string(),
        },
        OperationKind::Revert => "REVERTING".to_string(),
        OperationKind::CherryPick => "CHERRY-PICKING".to_string(),
        OperationKind::Stash => "APPLYING STASH".to_string(),
    };
    Some(banner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_banner_shows_step() {
        let banner = operation_banner(
            OperationKind::Rebase,
            &OperationState::ConflictPaused,
            Some(StepProgress {
                current: 2,
                total: 3,
            }),
        );
        assert_eq!(banner.as_deref(), Some("REBASING 2/3"));
    }

    #[test]
    fn test_no_banner_when_finished() {
        assert_eq!(
            operation_banner(OperationKind::Merge, &OperationState::Completed, None),
            None
        );
    }

    #[test]
    fn test_adopted_operation_keeps_banner() {
        assert_eq!(
            operation_banner(OperationKind::CherryPick, &OperationState::Idle, None).as_deref(),
            Some("CHERRY-PICKING")
        );
        assert_eq!(
            operation_banner(OperationKind::None, &OperationState::Idle, None),
            None
        );
    }
}
