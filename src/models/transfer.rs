//! Remote transfer models

use serde::{Deserialize, Serialize};

use super::{CredentialKind, OperationState};
use crate::error::ErrorResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferDirection {
    Fetch,
    Pull,
    Push,
}

/// Options for a fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    /// Falls back to the `prune_on_fetch` setting when unset
    pub prune: Option<bool>,
    pub depth: Option<u32>,
}

/// How a pull integrates the fetched upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullMode {
    #[default]
    Merge,
    Rebase,
    FastForwardOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOptions {
    pub force: bool,
    pub set_upstream: bool,
    pub push_tags: bool,
    /// Remote branch name to push to; defaults to the upstream branch
    pub to: Option<String>,
}

/// Object and byte counters for a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub received_objects: usize,
    pub total_objects: usize,
    pub indexed_objects: usize,
    pub received_bytes: usize,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total_objects == 0 {
            return 0.0;
        }
        (self.received_objects as f64 / self.total_objects as f64) * 100.0
    }
}

/// A reference moved by a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdate {
    pub refname: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub session_id: String,
    pub remote: String,
    pub direction: TransferDirection,
    pub progress: TransferProgress,
    pub updated_refs: Vec<RefUpdate>,
    /// Result of integrating the upstream after a pull
    pub integration: Option<OperationState>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Event delivered on a session stream; the last one is always terminal
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum TransferEvent {
    Progress(TransferProgress),
    CredentialRequested { kind: CredentialKind, host: String },
    RefUpdated(RefUpdate),
    Completed(TransferSummary),
    Canceled,
    Failed(ErrorResponse),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed(_) | TransferEvent::Canceled | TransferEvent::Failed(_)
        )
    }
}
