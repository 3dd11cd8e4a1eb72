//! Per-repository state shared by the orchestrator and its services

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, watch};

use super::config::Settings;
use super::path_locks::PathLocks;
use crate::backend::GitBackend;
use crate::conflict::ConflictSet;
use crate::error::{Result, WorkcopyError};
use crate::models::{
    operation_banner, OperationKind, OperationRequest, OperationState, OperationTransition,
    StatusSnapshot, StepProgress,
};

const TRANSITION_CAPACITY: usize = 64;

/// The active compound operation, if any
#[derive(Debug, Clone, Default)]
pub struct ActiveOperation {
    pub request: Option<OperationRequest>,
    pub kind: OperationKind,
    pub state: OperationState,
    pub progress: Option<StepProgress>,
}

impl ActiveOperation {
    pub fn is_active(&self) -> bool {
        self.kind != OperationKind::None
    }
}

/// Everything owned by one open repository
pub struct RepositoryContext {
    backend: Arc<dyn GitBackend>,
    settings: Settings,
    operation: RwLock<ActiveOperation>,
    conflicts: RwLock<ConflictSet>,
    locks: PathLocks,
    status: watch::Sender<StatusSnapshot>,
    transitions: broadcast::Sender<OperationTransition>,
}

impl RepositoryContext {
    pub fn new(backend: Arc<dyn GitBackend>, settings: Settings) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            backend,
            settings,
            operation: RwLock::new(ActiveOperation::default()),
            conflicts: RwLock::new(ConflictSet::new()),
            locks: PathLocks::new(),
            status,
            transitions,
        }
    }

    pub fn backend(&self) -> &Arc<dyn GitBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    pub fn operation(&self) -> Result<RwLockReadGuard<'_, ActiveOperation>> {
        self.operation
            .read()
            .map_err(|_| WorkcopyError::Backend("Lock poisoned".to_string()))
    }

    pub fn operation_mut(&self) -> Result<RwLockWriteGuard<'_, ActiveOperation>> {
        self.operation
            .write()
            .map_err(|_| WorkcopyError::Backend("Lock poisoned".to_string()))
    }

    pub fn conflicts(&self) -> Result<RwLockReadGuard<'_, ConflictSet>> {
        self.conflicts
            .read()
            .map_err(|_| WorkcopyError::Backend("Lock poisoned".to_string()))
    }

    pub fn conflicts_mut(&self) -> Result<RwLockWriteGuard<'_, ConflictSet>> {
        self.conflicts
            .write()
            .map_err(|_| WorkcopyError::Backend("Lock poisoned".to_string()))
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<OperationTransition> {
        self.transitions.subscribe()
    }

    /// Rebuild the snapshot from the backend and the operation record, then
    /// publish it. Backend read failures leave those fields at their defaults.
    pub fn refresh(&self) {
        let (kind, state, progress) = match self.operation() {
            Ok(op) => (op.kind, op.state.clone(), op.progress),
            Err(e) => {
                tracing::warn!("Skipping status refresh: {}", e);
                return;
            }
        };
        let unresolved = self.conflicts().map(|c| c.unresolved_count()).unwrap_or(0);

        let mut snapshot = StatusSnapshot {
            operation: kind,
            banner: operation_banner(kind, &state, progress),
            state,
            unresolved_conflicts: unresolved,
            ..StatusSnapshot::default()
        };

        match self.backend.current_branch() {
            Ok(Some(branch)) => {
                if let Ok(Some(upstream)) = self.backend.upstream(&branch) {
                    snapshot.upstream = Some(upstream.tracking_name());
                }
                if let Ok(Some((ahead, behind))) = self.backend.ahead_behind(&branch) {
                    snapshot.ahead = ahead;
                    snapshot.behind = behind;
                }
                snapshot.branch = Some(branch);
            }
            Ok(None) => snapshot.detached = true,
            Err(e) => tracing::warn!("Failed to read current branch: {}", e),
        }

        self.status.send_replace(snapshot);
    }

    /// Record a state change and refresh the snapshot
    pub fn publish_transition(&self, kind: OperationKind, from: OperationState, to: OperationState) {
        tracing::info!("{} operation: {:?} -> {:?}", kind, from, to);
        let _ = self.transitions.send(OperationTransition {
            kind,
            from,
            to,
            at: chrono::Utc::now(),
        });
        self.refresh();
    }
}
