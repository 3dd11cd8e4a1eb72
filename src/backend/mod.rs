//! Git backend capability interface
//!
//! The orchestrator never talks to libgit2 directly; it drives a
//! [`GitBackend`]. [`Git2Backend`] is the production implementation and
//! [`MemoryBackend`] keeps a whole repository (and its remotes) in memory.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    ConflictFile, Credential, CredentialRequest, FetchOptions, MergeMode, OperationKind,
    OperationRequest, RefUpdate, Remote, StepOutcome, SubmoduleRecord, TransferProgress,
    UpstreamInfo,
};

pub mod git2_backend;
pub mod memory;

pub use git2_backend::Git2Backend;
pub use memory::{MemoryBackend, MemoryNetwork};

/// New content for one index entry; `None` removes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexUpdate {
    pub path: String,
    pub content: Option<Vec<u8>>,
}

/// Callbacks a transfer raises while it runs on the blocking pool
pub trait TransferHooks {
    /// Answer a credential request. The transfer is suspended until this
    /// returns; an error aborts the transfer with that error.
    fn credentials(&mut self, request: CredentialRequest) -> Result<Credential>;

    /// Report progress; returning `false` aborts the transfer
    fn progress(&mut self, progress: TransferProgress) -> bool;

    fn ref_updated(&mut self, update: RefUpdate);

    fn is_canceled(&self) -> bool;

    fn accept_invalid_certificate(&self, host: &str) -> bool;
}

/// Repository primitives used by the orchestrator and its services
pub trait GitBackend: Send + Sync {
    /// Checked-out branch, `None` when HEAD is detached
    fn current_branch(&self) -> Result<Option<String>>;

    fn upstream(&self, branch: &str) -> Result<Option<UpstreamInfo>>;

    fn set_upstream(&self, branch: &str, upstream: &UpstreamInfo) -> Result<()>;

    /// Commits `(ahead, behind)` of the branch relative to its upstream
    fn ahead_behind(&self, branch: &str) -> Result<Option<(usize, usize)>>;

    /// Resolve a branch, remote-tracking branch, tag or commit id
    fn resolve(&self, name: &str) -> Result<Option<String>>;

    /// True when `commit` contains `ancestor` (equal ids included)
    fn is_descendant(&self, commit: &str, ancestor: &str) -> Result<bool>;

    fn remotes(&self) -> Result<Vec<Remote>>;

    fn local_tags(&self) -> Result<Vec<String>>;

    fn in_progress_operation(&self) -> Result<OperationKind>;

    /// Tracked files differ between HEAD, index and working tree
    fn has_uncommitted_changes(&self) -> Result<bool>;

    fn merge(&self, source: &str, mode: MergeMode, message: Option<&str>) -> Result<StepOutcome>;

    fn rebase(&self, onto: &str) -> Result<StepOutcome>;

    fn revert(&self, commit: &str) -> Result<StepOutcome>;

    fn cherry_pick(&self, commit: &str) -> Result<StepOutcome>;

    fn stash_apply(&self, index: usize, pop: bool) -> Result<StepOutcome>;

    /// Finalize the paused step from the index: merge commit, next rebase
    /// step, revert/cherry-pick commit, stash drop on pop
    fn continue_operation(&self, request: &OperationRequest) -> Result<StepOutcome>;

    /// Restore HEAD, index and working tree to their state before the operation
    fn abort_operation(&self, kind: OperationKind) -> Result<()>;

    /// Non-conflicted paths whose staged merge result was edited afterwards
    fn merged_paths_with_unstaged_changes(&self) -> Result<Vec<String>>;

    fn conflicted_paths(&self) -> Result<Vec<String>>;

    fn conflict_file(&self, path: &str) -> Result<ConflictFile>;

    fn read_workdir(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn write_workdir(&self, path: &str, content: &[u8]) -> Result<()>;

    fn remove_workdir(&self, path: &str) -> Result<()>;

    fn read_index(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn read_head(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Replace index entries in a single write, clearing their conflict
    /// stages. `None` removes an entry. Nothing is written unless every
    /// entry applies.
    fn write_index_entries(&self, entries: &[IndexUpdate]) -> Result<()>;

    fn write_index(&self, path: &str, content: Option<&[u8]>) -> Result<()> {
        self.write_index_entries(&[IndexUpdate {
            path: path.to_string(),
            content: content.map(<[u8]>::to_vec),
        }])
    }

    /// Reset the working file from the index, else HEAD; untracked files are deleted
    fn discard_path(&self, path: &str) -> Result<()>;

    fn fetch(
        &self,
        remote: &str,
        options: &FetchOptions,
        hooks: &mut dyn TransferHooks,
    ) -> Result<Vec<RefUpdate>>;

    fn push(
        &self,
        remote: &str,
        refspecs: &[String],
        hooks: &mut dyn TransferHooks,
    ) -> Result<Vec<RefUpdate>>;

    fn submodules(&self) -> Result<Vec<SubmoduleRecord>>;

    /// Register the submodule and create its repository with an `origin` remote
    fn init_submodule(&self, path: &str) -> Result<()>;

    fn open_submodule(&self, path: &str) -> Result<Arc<dyn GitBackend>>;

    fn checkout_detached(&self, oid: &str) -> Result<()>;
}
