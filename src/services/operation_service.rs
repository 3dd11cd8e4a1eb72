//! Compound operation orchestration
//!
//! Drives merge, rebase, revert, cherry-pick and stash application through
//! one state machine per repository:
//!
//! ```text
//! Idle/terminal --begin--> Running --clean--> Completed
//!                             |  \--error--> Failed(reason)
//!                             v
//!                       ConflictPaused --continue--> Running
//!                             \--abort--> Aborted
//! ```
//!
//! Only one operation can be active at a time. Every transition refreshes
//! the published [`StatusSnapshot`]. An operation found in progress on open
//! with no conflicts left sits in `Idle` with its kind set until continue or
//! abort.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use super::blocking;
use super::config::Settings;
use super::context::RepositoryContext;
use super::credentials_service::{CredentialNegotiator, CredentialPrompter};
use super::staging_service::DiffStagingEngine;
use super::submodule_service::SubmoduleSynchronizer;
use super::transfer_service::{PullIntegration, RemoteTransferController, TransferSession};
use crate::backend::{GitBackend, IndexUpdate};
use crate::conflict::ConflictSet;
use crate::error::{Result, WorkcopyError};
use crate::models::{
    FailureReason, MergeMode, OperationKind, OperationRequest, OperationState, OperationStatus,
    OperationTransition, PullMode, StatusSnapshot, StepOutcome,
};

/// Request used to finish an operation found in progress on open
fn adopted_request(kind: OperationKind) -> Option<OperationRequest> {
    match kind {
        OperationKind::None => None,
        OperationKind::Merge => Some(OperationRequest::merge("MERGE_HEAD")),
        OperationKind::Rebase => Some(OperationRequest::Rebase {
            onto: "HEAD".to_string(),
        }),
        OperationKind::Revert => Some(OperationRequest::Revert {
            commit: "REVERT_HEAD".to_string(),
        }),
        OperationKind::CherryPick => Some(OperationRequest::CherryPick {
            commit: "CHERRY_PICK_HEAD".to_string(),
        }),
        OperationKind::Stash => Some(OperationRequest::Stash {
            index: 0,
            pop: false,
        }),
    }
}

/// Backend errors that end a running step in `Failed`
fn failure_reason(error: WorkcopyError) -> FailureReason {
    match error {
        WorkcopyError::DirtyWorkingTree => FailureReason::DirtyWorkingTree,
        WorkcopyError::NoUpstream(_) => FailureReason::NoUpstream,
        WorkcopyError::AlreadyUpToDate => FailureReason::AlreadyUpToDate,
        WorkcopyError::FastForwardOnlyViolated => FailureReason::FastForwardOnlyViolated,
        other => FailureReason::BackendError(other.to_string()),
    }
}

/// Entry point for compound operations on one repository
#[derive(Clone)]
pub struct OperationOrchestrator {
    context: Arc<RepositoryContext>,
    staging: DiffStagingEngine,
    transfers: RemoteTransferController,
    submodules: SubmoduleSynchronizer,
}

impl OperationOrchestrator {
    /// Open a repository. An operation the backend reports as in progress
    /// (after a crash, or started elsewhere) is adopted: into `ConflictPaused`
    /// while it has conflicts, else as an `Idle` operation of its kind that
    /// only continue or abort can move on.
    pub fn open(
        backend: Arc<dyn GitBackend>,
        settings: Settings,
        prompter: Arc<dyn CredentialPrompter>,
    ) -> Result<Self> {
        let negotiator = Arc::new(CredentialNegotiator::from_settings(settings.clone(), prompter));
        Self::with_negotiator(backend, settings, negotiator)
    }

    pub fn with_negotiator(
        backend: Arc<dyn GitBackend>,
        settings: Settings,
        negotiator: Arc<CredentialNegotiator>,
    ) -> Result<Self> {
        let context = Arc::new(RepositoryContext::new(backend.clone(), settings.clone()));
        let orchestrator = Self {
            staging: DiffStagingEngine::new(context.clone()),
            transfers: RemoteTransferController::new(
                backend.clone(),
                negotiator.clone(),
                settings.clone(),
            ),
            submodules: SubmoduleSynchronizer::new(backend, negotiator, settings),
            context,
        };
        orchestrator.adopt_in_progress()?;
        orchestrator.context.refresh();
        Ok(orchestrator)
    }

    fn adopt_in_progress(&self) -> Result<()> {
        let backend = self.context.backend();
        let kind = backend.in_progress_operation()?;
        let Some(request) = adopted_request(kind) else {
            return Ok(());
        };

        let paths = backend.conflicted_paths()?;
        if paths.is_empty() {
            // Resolved outside the orchestrator: wait for continue or abort
            let mut op = self.context.operation_mut()?;
            op.request = Some(request);
            op.kind = kind;
            op.state = OperationState::Idle;
            op.progress = None;
            tracing::info!("Adopted in-progress {} with no conflicts left", kind);
            return Ok(());
        }

        self.load_conflicts(&paths)?;
        let mut op = self.context.operation_mut()?;
        op.request = Some(request);
        op.kind = kind;
        op.state = OperationState::ConflictPaused;
        op.progress = None;
        tracing::info!("Adopted in-progress {} with {} conflicts", kind, paths.len());
        Ok(())
    }

    pub fn context(&self) -> &Arc<RepositoryContext> {
        &self.context
    }

    pub fn staging(&self) -> &DiffStagingEngine {
        &self.staging
    }

    pub fn transfers(&self) -> &RemoteTransferController {
        &self.transfers
    }

    pub fn submodules(&self) -> &SubmoduleSynchronizer {
        &self.submodules
    }

    pub fn status(&self) -> Result<OperationStatus> {
        let op = self.context.operation()?;
        let conflicts = self.context.conflicts()?;
        Ok(OperationStatus {
            kind: op.kind,
            state: op.state.clone(),
            progress: op.progress,
            conflicts: conflicts.entries(),
        })
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.context.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.context.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<OperationTransition> {
        self.context.subscribe_transitions()
    }

    /// Start an operation. Backend failures end in `Ok(Failed(reason))`;
    /// an already active operation is an error and changes nothing.
    pub async fn begin(&self, request: OperationRequest) -> Result<OperationState> {
        let this = self.clone();
        blocking(move || this.begin_blocking(request)).await
    }

    /// Finish the paused step once every conflict is resolved
    pub async fn continue_operation(&self) -> Result<OperationState> {
        let this = self.clone();
        blocking(move || this.continue_blocking()).await
    }

    /// Restore HEAD, index and working tree to their state before the operation
    pub async fn abort(&self) -> Result<OperationState> {
        let this = self.clone();
        blocking(move || this.abort_blocking()).await
    }

    /// Fetch the upstream and integrate it through the operation state machine
    pub fn pull(
        &self,
        remote: Option<&str>,
        branch: Option<&str>,
        mode: PullMode,
    ) -> Result<TransferSession> {
        let integration: Arc<dyn PullIntegration> = Arc::new(self.clone());
        self.transfers.pull(remote, branch, mode, integration)
    }

    fn begin_blocking(&self, request: OperationRequest) -> Result<OperationState> {
        let kind = request.kind();
        let from = {
            let mut op = self.context.operation_mut()?;
            if op.is_active() {
                return Err(WorkcopyError::ConflictKindAlreadyActive(op.kind));
            }
            let from = op.state.clone();
            op.request = Some(request.clone());
            op.kind = kind;
            op.state = OperationState::Running;
            op.progress = None;
            from
        };
        tracing::info!("Beginning {:?}", request);
        self.context
            .publish_transition(kind, from, OperationState::Running);

        let backend = self.context.backend();
        let outcome = match &request {
            OperationRequest::Merge {
                source,
                mode,
                message,
            } => backend.merge(source, *mode, message.as_deref()),
            OperationRequest::Rebase { onto } => backend.rebase(onto),
            OperationRequest::Revert { commit } => backend.revert(commit),
            OperationRequest::CherryPick { commit } => backend.cherry_pick(commit),
            OperationRequest::Stash { index, pop } => backend.stash_apply(*index, *pop),
        };
        self.settle(kind, outcome)
    }

    fn continue_blocking(&self) -> Result<OperationState> {
        // Claim the step: later continue or abort calls see Running
        let (kind, request, from, resolved) = {
            let mut op = self.context.operation_mut()?;
            let mut conflicts = self.context.conflicts_mut()?;
            let request = match (&op.state, &op.request) {
                (OperationState::ConflictPaused | OperationState::Idle, Some(request))
                    if op.is_active() =>
                {
                    request.clone()
                }
                _ => {
                    return Err(WorkcopyError::OperationConflict(
                        "no paused operation to continue".to_string(),
                    ))
                }
            };
            let unresolved = conflicts.unresolved_count();
            if unresolved > 0 {
                return Err(WorkcopyError::UnresolvedConflictsRemain(unresolved));
            }
            let from = std::mem::replace(&mut op.state, OperationState::Running);
            (op.kind, request, from, std::mem::take(&mut *conflicts))
        };

        if let Err(e) = self.stage_resolutions(&resolved.paths()) {
            tracing::warn!("Staging resolutions for {} failed: {}", kind, e);
            let mut op = self.context.operation_mut()?;
            *self.context.conflicts_mut()? = resolved;
            op.state = from;
            return Err(e);
        }
        self.context
            .publish_transition(kind, from, OperationState::Running);

        let outcome = self.context.backend().continue_operation(&request);
        self.settle(kind, outcome)
    }

    /// Copy every resolved working file into the index in one write
    fn stage_resolutions(&self, paths: &[String]) -> Result<()> {
        let _guard = self.context.locks().acquire(paths);
        let backend = self.context.backend();
        let updates = paths
            .iter()
            .map(|path| {
                Ok(IndexUpdate {
                    path: path.clone(),
                    content: backend.read_workdir(path)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        backend.write_index_entries(&updates)
    }

    fn abort_blocking(&self) -> Result<OperationState> {
        let (kind, from) = {
            let mut op = self.context.operation_mut()?;
            if !op.is_active() {
                return Err(WorkcopyError::OperationConflict(
                    "no operation in progress".to_string(),
                ));
            }
            if op.state == OperationState::Running {
                return Err(WorkcopyError::OperationBusy(format!(
                    "{} step is still running",
                    op.kind
                )));
            }

            // Holding the conflict set keeps new resolution calls out while aborting
            let mut conflicts = self.context.conflicts_mut()?;
            if self.context.locks().in_flight() {
                return Err(WorkcopyError::OperationBusy(
                    "a staging call is in progress".to_string(),
                ));
            }

            let backend = self.context.backend();
            let edited = backend.merged_paths_with_unstaged_changes()?;
            if !edited.is_empty() {
                return Err(WorkcopyError::AbortBlockedByUnstagedChanges(edited));
            }
            backend.abort_operation(op.kind)?;

            conflicts.clear();
            let kind = op.kind;
            let from = std::mem::replace(&mut op.state, OperationState::Aborted);
            op.request = None;
            op.kind = OperationKind::None;
            op.progress = None;
            (kind, from)
        };
        self.context
            .publish_transition(kind, from, OperationState::Aborted);
        Ok(OperationState::Aborted)
    }

    fn load_conflicts(&self, paths: &[String]) -> Result<()> {
        let backend = self.context.backend();
        let mut set = ConflictSet::new();
        for path in paths {
            let content = backend.read_workdir(path)?;
            let text = content.and_then(|bytes| String::from_utf8(bytes).ok());
            set.insert(path, text.as_deref());
        }
        *self.context.conflicts_mut()? = set;
        Ok(())
    }

    /// Move out of Running according to the backend's answer
    fn settle(&self, kind: OperationKind, outcome: Result<StepOutcome>) -> Result<OperationState> {
        let (state, progress) = match outcome {
            Ok(StepOutcome::Completed) => (OperationState::Completed, None),
            Ok(StepOutcome::Conflicted { paths, progress }) if !paths.is_empty() => {
                match self.load_conflicts(&paths) {
                    Ok(()) => (OperationState::ConflictPaused, progress),
                    Err(e) => (
                        OperationState::Failed(FailureReason::BackendError(e.to_string())),
                        None,
                    ),
                }
            }
            Ok(StepOutcome::Conflicted { .. }) => (
                OperationState::Failed(FailureReason::BackendError(
                    "backend reported a conflict without paths".to_string(),
                )),
                None,
            ),
            Err(e) => {
                tracing::warn!("{} failed: {}", kind, e);
                (OperationState::Failed(failure_reason(e)), None)
            }
        };

        {
            let mut op = self.context.operation_mut()?;
            op.state = state.clone();
            op.progress = progress;
            if state != OperationState::ConflictPaused {
                op.request = None;
                op.kind = OperationKind::None;
            }
        }
        self.context
            .publish_transition(kind, OperationState::Running, state.clone());
        Ok(state)
    }
}

impl PullIntegration for OperationOrchestrator {
    fn ensure_idle(&self) -> Result<()> {
        let op = self.context.operation()?;
        if op.is_active() {
            return Err(WorkcopyError::ConflictKindAlreadyActive(op.kind));
        }
        Ok(())
    }

    fn integrate(&self, upstream: &str, mode: PullMode) -> Result<OperationState> {
        let request = match mode {
            PullMode::Merge => OperationRequest::merge(upstream),
            PullMode::Rebase => OperationRequest::Rebase {
                onto: upstream.to_string(),
            },
            PullMode::FastForwardOnly => OperationRequest::Merge {
                source: upstream.to_string(),
                mode: MergeMode::FastForwardOnly,
                message: None,
            },
        };
        self.begin_blocking(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GitBackend, MemoryBackend, MemoryNetwork};
    use crate::models::ResolutionSide;
    use crate::services::credentials_service::NoPrompter;

    fn orchestrator(backend: Arc<MemoryBackend>) -> OperationOrchestrator {
        OperationOrchestrator::open(backend, Settings::default(), Arc::new(NoPrompter)).unwrap()
    }

    /// `main` and `topic` both edit line 2 of f.txt
    fn diverged() -> Arc<MemoryBackend> {
        let network = MemoryNetwork::new();
        let backend = Arc::new(MemoryBackend::new(&network));
        backend.commit("base", &[("f.txt", "a\nb\nc\n")]);
        backend.create_branch("topic");
        backend.commit("main edit", &[("f.txt", "a\nmain\nc\n")]);
        backend.checkout("topic").unwrap();
        backend.commit("topic edit", &[("f.txt", "a\ntopic\nc\n")]);
        backend.checkout("main").unwrap();
        backend
    }

    #[tokio::test]
    async fn test_clean_merge_completes() {
        let network = MemoryNetwork::new();
        let backend = Arc::new(MemoryBackend::new(&network));
        backend.commit("base", &[("f.txt", "a\n")]);
        backend.create_branch("topic");
        backend.checkout("topic").unwrap();
        backend.commit("topic", &[("g.txt", "g\n")]);
        backend.checkout("main").unwrap();

        let orch = orchestrator(backend.clone());
        let state = orch.begin(OperationRequest::merge("topic")).await.unwrap();
        assert_eq!(state, OperationState::Completed);
        let status = orch.status().unwrap();
        assert_eq!(status.kind, OperationKind::None);
        assert!(status.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_merge_pauses() {
        let orch = orchestrator(diverged());
        let state = orch.begin(OperationRequest::merge("topic")).await.unwrap();
        assert_eq!(state, OperationState::ConflictPaused);

        let status = orch.status().unwrap();
        assert_eq!(status.kind, OperationKind::Merge);
        assert_eq!(status.conflicts.len(), 1);
        assert_eq!(status.conflicts[0].path, "f.txt");
        assert_eq!(status.conflicts[0].hunks.len(), 1);
        assert_eq!(orch.snapshot().banner.as_deref(), Some("MERGING"));
        assert_eq!(orch.snapshot().unresolved_conflicts, 1);
    }

    #[tokio::test]
    async fn test_second_operation_rejected_while_paused() {
        let orch = orchestrator(diverged());
        orch.begin(OperationRequest::merge("topic")).await.unwrap();

        let result = orch
            .begin(OperationRequest::Revert {
                commit: "HEAD".to_string(),
            })
            .await;
        assert!(matches!(
            result,
            Err(WorkcopyError::ConflictKindAlreadyActive(OperationKind::Merge))
        ));
        assert_eq!(orch.status().unwrap().state, OperationState::ConflictPaused);
    }

    #[tokio::test]
    async fn test_continue_requires_resolution() {
        let backend = diverged();
        let orch = orchestrator(backend.clone());
        orch.begin(OperationRequest::merge("topic")).await.unwrap();

        let result = orch.continue_operation().await;
        assert!(matches!(
            result,
            Err(WorkcopyError::UnresolvedConflictsRemain(1))
        ));

        orch.staging()
            .resolve_hunk("f.txt", 0, ResolutionSide::Theirs, None)
            .unwrap();
        let state = orch.continue_operation().await.unwrap();
        assert_eq!(state, OperationState::Completed);

        let head = backend.head_oid().unwrap();
        assert_eq!(backend.network().commit_parents(&head).len(), 2);
        assert_eq!(
            backend.network().commit_file(&head, "f.txt").as_deref(),
            Some("a\ntopic\nc\n")
        );
    }

    #[tokio::test]
    async fn test_abort_restores_head() {
        let backend = diverged();
        let before = backend.head_oid();
        let orch = orchestrator(backend.clone());
        orch.begin(OperationRequest::merge("topic")).await.unwrap();

        let state = orch.abort().await.unwrap();
        assert_eq!(state, OperationState::Aborted);
        assert_eq!(backend.head_oid(), before);
        assert_eq!(
            backend.read_workdir("f.txt").unwrap().as_deref(),
            Some(&b"a\nmain\nc\n"[..])
        );
        assert!(orch.status().unwrap().conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_abort_without_operation() {
        let orch = orchestrator(diverged());
        let result = orch.abort().await;
        assert!(matches!(result, Err(WorkcopyError::OperationConflict(_))));
    }

    #[tokio::test]
    async fn test_abort_blocked_while_staging_in_flight() {
        let orch = orchestrator(diverged());
        orch.begin(OperationRequest::merge("topic")).await.unwrap();

        let guard = orch.context().locks().acquire(&["other.txt"]);
        let result = orch.abort().await;
        assert!(matches!(result, Err(WorkcopyError::OperationBusy(_))));
        drop(guard);

        assert_eq!(orch.abort().await.unwrap(), OperationState::Aborted);
    }

    #[tokio::test]
    async fn test_up_to_date_merge_fails() {
        let orch = orchestrator(diverged());
        let state = orch.begin(OperationRequest::merge("main")).await.unwrap();
        assert_eq!(
            state,
            OperationState::Failed(FailureReason::AlreadyUpToDate)
        );
        assert_eq!(orch.status().unwrap().kind, OperationKind::None);
    }

    #[tokio::test]
    async fn test_transitions_are_published_in_order() {
        let orch = orchestrator(diverged());
        let mut transitions = orch.subscribe_transitions();
        orch.begin(OperationRequest::merge("topic")).await.unwrap();
        orch.abort().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = transitions.try_recv() {
            seen.push(event.to);
        }
        assert_eq!(
            seen,
            vec![
                OperationState::Running,
                OperationState::ConflictPaused,
                OperationState::Aborted
            ]
        );
    }

    #[tokio::test]
    async fn test_reopen_adopts_paused_merge() {
        let backend = diverged();
        let first = orchestrator(backend.clone());
        first.begin(OperationRequest::merge("topic")).await.unwrap();

        let reopened = orchestrator(backend);
        let status = reopened.status().unwrap();
        assert_eq!(status.kind, OperationKind::Merge);
        assert_eq!(status.state, OperationState::ConflictPaused);
        assert_eq!(status.conflicts.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_continue_finalizes_once() {
        let backend = diverged();
        let main_tip = backend.head_oid().unwrap();
        let orch = orchestrator(backend.clone());
        orch.begin(OperationRequest::merge("topic")).await.unwrap();
        orch.staging()
            .resolve_hunk("f.txt", 0, ResolutionSide::Theirs, None)
            .unwrap();

        let (a, b) = tokio::join!(orch.continue_operation(), orch.continue_operation());
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Ok(OperationState::Completed))));
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(WorkcopyError::OperationConflict(_)))));

        let head = backend.head_oid().unwrap();
        let parents = backend.network().commit_parents(&head);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0], main_tip);
    }

    #[tokio::test]
    async fn test_abort_never_exposes_pause_without_conflicts() {
        let orch = orchestrator(diverged());
        orch.begin(OperationRequest::merge("topic")).await.unwrap();

        let reader = orch.clone();
        let watcher = tokio::task::spawn_blocking(move || {
            for _ in 0..500 {
                let status = reader.status().unwrap();
                let paused = status.state == OperationState::ConflictPaused;
                assert_eq!(paused, !status.conflicts.is_empty());
                if status.state == OperationState::Aborted {
                    break;
                }
            }
        });
        assert_eq!(orch.abort().await.unwrap(), OperationState::Aborted);
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_adopts_merge_resolved_elsewhere() {
        let backend = diverged();
        let main_tip = backend.head_oid().unwrap();
        let first = orchestrator(backend.clone());
        first.begin(OperationRequest::merge("topic")).await.unwrap();
        backend.write_workdir("f.txt", b"a\nboth\nc\n").unwrap();
        backend.write_index("f.txt", Some(b"a\nboth\nc\n")).unwrap();

        let reopened = orchestrator(backend.clone());
        let status = reopened.status().unwrap();
        assert_eq!(status.kind, OperationKind::Merge);
        assert_eq!(status.state, OperationState::Idle);
        assert!(status.conflicts.is_empty());
        assert_eq!(reopened.snapshot().banner.as_deref(), Some("MERGING"));

        let other = reopened
            .begin(OperationRequest::Revert {
                commit: "HEAD".to_string(),
            })
            .await;
        assert!(matches!(
            other,
            Err(WorkcopyError::ConflictKindAlreadyActive(OperationKind::Merge))
        ));

        assert_eq!(
            reopened.continue_operation().await.unwrap(),
            OperationState::Completed
        );
        let head = backend.head_oid().unwrap();
        assert_eq!(backend.network().commit_parents(&head)[0], main_tip);
        assert_eq!(
            backend.network().commit_file(&head, "f.txt").as_deref(),
            Some("a\nboth\nc\n")
        );
    }

    #[tokio::test]
    async fn test_reopened_resolved_merge_can_be_aborted() {
        let backend = diverged();
        let main_tip = backend.head_oid();
        let first = orchestrator(backend.clone());
        first.begin(OperationRequest::merge("topic")).await.unwrap();
        backend.write_workdir("f.txt", b"a\ntopic\nc\n").unwrap();
        backend.write_index("f.txt", Some(b"a\ntopic\nc\n")).unwrap();

        let reopened = orchestrator(backend.clone());
        assert_eq!(reopened.abort().await.unwrap(), OperationState::Aborted);
        assert_eq!(backend.head_oid(), main_tip);
        assert_eq!(backend.in_progress_operation().unwrap(), OperationKind::None);
        assert_eq!(
            backend.read_workdir("f.txt").unwrap().as_deref(),
            Some(&b"a\nmain\nc\n"[..])
        );
    }

    #[tokio::test]
    async fn test_open_attaches_store_when_enabled() {
        let settings = Settings {
            store_credentials: true,
            ..Settings::default()
        };
        let orch =
            OperationOrchestrator::open(diverged(), settings, Arc::new(NoPrompter)).unwrap();
        assert!(orch.transfers().negotiator().has_store());
    }
}
