//! libgit2-backed repository
//!
//! Every call opens the repository fresh from its path so the backend can be
//! shared across threads without holding a `git2::Repository`.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use git2::build::CheckoutBuilder;
use git2::{
    AutotagOption, BranchType, CertificateCheckStatus, Cred, CredentialType, ErrorCode, FetchPrune,
    Oid, RemoteCallbacks, Repository, ResetType, StatusOptions,
};

use super::{GitBackend, IndexUpdate, TransferHooks};
use crate::error::{Result, WorkcopyError, NON_FAST_FORWARD_HINT};
use crate::models::{
    ConflictBlob, ConflictFile, Credential, CredentialKind, CredentialRequest, FetchOptions,
    MergeMode, OperationKind, OperationRequest, RefUpdate, Remote, StepOutcome, StepProgress,
    SubmoduleRecord, TransferProgress, UpstreamInfo,
};

/// Map libgit2 failures onto orchestrator errors
fn classify(err: git2::Error) -> WorkcopyError {
    match err.code() {
        ErrorCode::Conflict
        | ErrorCode::MergeConflict
        | ErrorCode::Uncommitted
        | ErrorCode::IndexDirty => WorkcopyError::DirtyWorkingTree,
        ErrorCode::NotFastForward => {
            WorkcopyError::Backend(format!("{} {}", err.message(), NON_FAST_FORWARD_HINT))
        }
        _ => WorkcopyError::Git(err),
    }
}

fn oid_string(oid: Oid) -> Option<String> {
    (!oid.is_zero()).then(|| oid.to_string())
}

fn entry_path(entry: &git2::IndexEntry) -> String {
    String::from_utf8_lossy(&entry.path).into_owned()
}

/// Repository-relative path with no escaping components
fn checked_path(path: &str) -> Result<&Path> {
    let candidate = Path::new(path);
    let escapes = candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(WorkcopyError::InvalidPath(path.to_string()));
    }
    Ok(candidate)
}

fn conflict_paths(repo: &Repository) -> Result<Vec<String>> {
    let index = repo.index()?;
    if !index.has_conflicts() {
        return Ok(Vec::new());
    }
    let mut paths = BTreeSet::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            paths.insert(entry_path(entry));
        }
    }
    Ok(paths.into_iter().collect())
}

fn conflicted(repo: &Repository, progress: Option<StepProgress>) -> Result<Option<StepOutcome>> {
    let paths = conflict_paths(repo)?;
    if paths.is_empty() {
        return Ok(None);
    }
    Ok(Some(StepOutcome::Conflicted { paths, progress }))
}

/// Commit the index on top of HEAD and clear any operation state
fn commit_index(
    repo: &Repository,
    message: &str,
    extra_parents: &[Oid],
    author: Option<git2::Signature<'_>>,
) -> Result<Oid> {
    let signature = repo.signature()?;
    let mut index = repo.index()?;
    let tree = repo.find_tree(index.write_tree()?)?;

    let mut parents = Vec::new();
    if let Ok(head) = repo.head() {
        parents.push(head.peel_to_commit()?);
    }
    for oid in extra_parents {
        parents.push(repo.find_commit(*oid)?);
    }
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

    let oid = repo.commit(
        Some("HEAD"),
        author.as_ref().unwrap_or(&signature),
        &signature,
        message,
        &tree,
        &parent_refs,
    )?;
    repo.cleanup_state()?;
    Ok(oid)
}

fn lookup_commit<'r>(repo: &'r Repository, name: &str) -> Result<git2::Commit<'r>> {
    let reference = repo
        .find_reference(&format!("refs/heads/{}", name))
        .or_else(|_| repo.find_reference(&format!("refs/remotes/{}", name)))
        .or_else(|_| repo.find_reference(&format!("refs/tags/{}", name)))
        .or_else(|_| repo.find_reference(name));
    let commit = match reference {
        Ok(reference) => reference.peel_to_commit(),
        Err(_) => repo
            .revparse_single(name)
            .and_then(|object| object.peel_to_commit()),
    };
    commit.map_err(|_| WorkcopyError::CommitNotFound(name.to_string()))
}

/// Step through a rebase until it finishes or stops on a conflict
fn run_rebase(repo: &Repository, rebase: &mut git2::Rebase<'_>) -> Result<StepOutcome> {
    let signature = repo.signature()?;
    let total = rebase.len();

    while let Some(op) = rebase.next() {
        op?;
        let current = rebase.operation_current().map_or(total, |idx| idx + 1);
        if let Some(outcome) = conflicted(repo, Some(StepProgress { current, total }))? {
            return Ok(outcome);
        }
        commit_rebase_step(rebase, &signature)?;
    }

    rebase.finish(Some(&signature))?;
    Ok(StepOutcome::Completed)
}

fn commit_rebase_step(rebase: &mut git2::Rebase<'_>, signature: &git2::Signature<'_>) -> Result<()> {
    match rebase.commit(None, signature, None) {
        Ok(_) => Ok(()),
        // Patch already upstream
        Err(e) if e.code() == ErrorCode::Applied => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// State shared by the remote callbacks of one transfer
struct CallbackState<'h> {
    hooks: RefCell<&'h mut dyn TransferHooks>,
    failure: RefCell<Option<WorkcopyError>>,
    attempts: RefCell<HashMap<CredentialKind, u32>>,
    /// Local refs moved by the transfer (fetch)
    updates: RefCell<Vec<RefUpdate>>,
    /// Remote refs a push asked the server to move
    pushed: RefCell<Vec<RefUpdate>>,
    rejections: RefCell<Vec<(String, String)>>,
    /// Tip updates are reported for fetches only; a push reports `pushed`
    report_tips: bool,
}

impl<'h> CallbackState<'h> {
    fn new(hooks: &'h mut dyn TransferHooks, report_tips: bool) -> Self {
        Self {
            hooks: RefCell::new(hooks),
            failure: RefCell::new(None),
            attempts: RefCell::new(HashMap::new()),
            updates: RefCell::new(Vec::new()),
            pushed: RefCell::new(Vec::new()),
            rejections: RefCell::new(Vec::new()),
            report_tips,
        }
    }

    fn next_attempt(&self, kind: CredentialKind) -> u32 {
        let mut attempts = self.attempts.borrow_mut();
        let counter = attempts.entry(kind).or_insert(0);
        let attempt = *counter;
        *counter += 1;
        attempt
    }

    fn fail(&self, error: WorkcopyError) -> git2::Error {
        let error_message = error.to_string();
        *self.failure.borrow_mut() = Some(error);
        git2::Error::from_str(&error_message)
    }

    fn is_canceled(&self) -> bool {
        self.hooks.borrow().is_canceled()
    }

    /// Turn the result of a remote call into the error the callbacks recorded
    fn finish(&self, result: std::result::Result<(), git2::Error>) -> Result<()> {
        if let Err(err) = result {
            if let Some(failure) = self.failure.borrow_mut().take() {
                return Err(failure);
            }
            if self.is_canceled() || err.code() == ErrorCode::User {
                return Err(WorkcopyError::TransferCanceled);
            }
            return Err(classify(err));
        }
        Ok(())
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();

        callbacks.credentials(move |url, username_from_url, allowed_types| {
            tracing::debug!(
                "Credential callback: url={}, username={:?}, allowed={:?}",
                url,
                username_from_url,
                allowed_types
            );

            if allowed_types.contains(CredentialType::USERNAME) {
                return Cred::username(username_from_url.unwrap_or("git"));
            }

            let kind = if allowed_types.contains(CredentialType::SSH_KEY) {
                CredentialKind::SshKeyFile
            } else if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
                CredentialKind::HttpBasic
            } else if allowed_types.contains(CredentialType::DEFAULT) {
                return Cred::default();
            } else {
                return Err(git2::Error::from_str("no supported credential type offered"));
            };

            let request = CredentialRequest::new(kind, url)
                .with_username(username_from_url)
                .with_attempt(self.next_attempt(kind));
            let answer = self.hooks.borrow_mut().credentials(request);
            match answer {
                Ok(credential) => to_cred(&credential),
                Err(err) => Err(self.fail(err)),
            }
        });

        callbacks.transfer_progress(move |stats| {
            let progress = TransferProgress {
                received_objects: stats.received_objects(),
                total_objects: stats.total_objects(),
                indexed_objects: stats.indexed_objects(),
                received_bytes: stats.received_bytes(),
            };
            let mut hooks = self.hooks.borrow_mut();
            !hooks.is_canceled() && hooks.progress(progress)
        });

        callbacks.push_transfer_progress(move |current, total, bytes| {
            let progress = TransferProgress {
                received_objects: current,
                total_objects: total,
                indexed_objects: current,
                received_bytes: bytes,
            };
            self.hooks.borrow_mut().progress(progress);
        });

        callbacks.sideband_progress(move |data| {
            tracing::trace!("remote: {}", String::from_utf8_lossy(data).trim_end());
            !self.is_canceled()
        });

        callbacks.update_tips(move |refname, old, new| {
            if !self.report_tips {
                return true;
            }
            let update = RefUpdate {
                refname: refname.to_string(),
                old: oid_string(old),
                new: oid_string(new),
            };
            self.hooks.borrow_mut().ref_updated(update.clone());
            self.updates.borrow_mut().push(update);
            true
        });

        callbacks.push_negotiation(move |updates| {
            for update in updates {
                if update.src() == update.dst() {
                    continue;
                }
                if let Some(dst) = update.dst_refname() {
                    self.pushed.borrow_mut().push(RefUpdate {
                        refname: dst.to_string(),
                        old: oid_string(update.src()),
                        new: oid_string(update.dst()),
                    });
                }
            }
            Ok(())
        });

        callbacks.push_update_reference(move |refname, status| {
            if let Some(message) = status {
                self.rejections
                    .borrow_mut()
                    .push((refname.to_string(), message.to_string()));
            }
            Ok(())
        });

        callbacks.certificate_check(move |_cert, host| {
            if self.hooks.borrow().accept_invalid_certificate(host) {
                tracing::warn!("Accepting unverified certificate for {}", host);
                Ok(CertificateCheckStatus::CertificateOk)
            } else {
                Ok(CertificateCheckStatus::CertificatePassthrough)
            }
        });

        callbacks
    }
}

fn to_cred(credential: &Credential) -> std::result::Result<Cred, git2::Error> {
    match credential {
        Credential::UserPass { username, password } => Cred::userpass_plaintext(username, password),
        Credential::SshAgent { username } => Cred::ssh_key_from_agent(username),
        Credential::SshKey {
            username,
            public_key,
            private_key,
            passphrase,
        } => Cred::ssh_key(
            username,
            public_key.as_deref(),
            private_key,
            passphrase.as_deref(),
        ),
    }
}

/// Marker in the git directory for a stash application paused on conflicts
const PENDING_STASH_FILE: &str = "WORKCOPY_STASH";

/// Production backend over a working copy on disk
#[derive(Debug)]
pub struct Git2Backend {
    path: PathBuf,
}

impl Git2Backend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let repo = Repository::open(&path)
            .map_err(|_| WorkcopyError::RepositoryNotFound(path.display().to_string()))?;
        let path = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| WorkcopyError::InvalidPath("bare repositories have no working copy".to_string()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.path)
            .map_err(|_| WorkcopyError::RepositoryNotFound(self.path.display().to_string()))
    }

    fn pending_stash_file(&self) -> Result<PathBuf> {
        Ok(self.repo()?.path().join(PENDING_STASH_FILE))
    }

    /// Paused stash application as `(index, pop)`
    fn pending_stash(&self) -> Result<Option<(usize, bool)>> {
        let content = match std::fs::read_to_string(self.pending_stash_file()?) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut fields = content.split_whitespace();
        let index = fields.next().and_then(|f| f.parse::<usize>().ok());
        let pop = fields.next().map(|f| f == "pop");
        match (index, pop) {
            (Some(index), Some(pop)) => Ok(Some((index, pop))),
            _ => {
                tracing::warn!("Ignoring malformed {}: {:?}", PENDING_STASH_FILE, content);
                Ok(None)
            }
        }
    }

    fn set_pending_stash(&self, value: Option<(usize, bool)>) -> Result<()> {
        let file = self.pending_stash_file()?;
        match value {
            Some((index, pop)) => {
                let mode = if pop { "pop" } else { "apply" };
                std::fs::write(file, format!("{} {}\n", index, mode))?;
            }
            None => match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    fn ensure_idle(&self, repo: &Repository) -> Result<()> {
        if repo.state() != git2::RepositoryState::Clean || self.pending_stash()?.is_some() {
            return Err(WorkcopyError::OperationConflict(
                "another operation is in progress".to_string(),
            ));
        }
        Ok(())
    }

    fn fast_forward(&self, repo: &Repository, target: &git2::Commit<'_>) -> Result<()> {
        repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))
            .map_err(classify)?;

        let head = repo.find_reference("HEAD")?;
        match head.symbolic_target() {
            Some(refname) => {
                let refname = refname.to_string();
                repo.reference(&refname, target.id(), true, "Fast-forward")?;
            }
            None => repo.set_head_detached(target.id())?,
        }
        Ok(())
    }

    fn blob_content(repo: &Repository, oid: Oid) -> Result<Vec<u8>> {
        Ok(repo.find_blob(oid)?.content().to_vec())
    }
}

impl GitBackend for Git2Backend {
    fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        if repo.head_detached().unwrap_or(false) {
            return Ok(None);
        }
        let head = repo.find_reference("HEAD")?;
        Ok(head
            .symbolic_target()
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .map(|name| name.to_string()))
    }

    fn upstream(&self, branch: &str) -> Result<Option<UpstreamInfo>> {
        let repo = self.repo()?;
        let config = repo.config()?;
        let remote = config.get_string(&format!("branch.{}.remote", branch));
        let merge = config.get_string(&format!("branch.{}.merge", branch));
        match (remote, merge) {
            (Ok(remote), Ok(merge)) => Ok(Some(UpstreamInfo {
                remote,
                branch: merge
                    .strip_prefix("refs/heads/")
                    .unwrap_or(&merge)
                    .to_string(),
            })),
            _ => Ok(None),
        }
    }

    fn set_upstream(&self, branch: &str, upstream: &UpstreamInfo) -> Result<()> {
        let repo = self.repo()?;
        let mut config = repo.config()?;
        config.set_str(&format!("branch.{}.remote", branch), &upstream.remote)?;
        config.set_str(
            &format!("branch.{}.merge", branch),
            &format!("refs/heads/{}", upstream.branch),
        )?;
        Ok(())
    }

    fn ahead_behind(&self, branch: &str) -> Result<Option<(usize, usize)>> {
        let Some(upstream) = self.upstream(branch)? else {
            return Ok(None);
        };
        let repo = self.repo()?;
        let local = repo
            .find_branch(branch, BranchType::Local)
            .ok()
            .and_then(|b| b.get().target());
        let remote = repo
            .find_reference(&upstream.tracking_ref())
            .ok()
            .and_then(|r| r.target());
        match (local, remote) {
            (Some(local), Some(remote)) => Ok(Some(repo.graph_ahead_behind(local, remote)?)),
            _ => Ok(None),
        }
    }

    fn resolve(&self, name: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        Ok(lookup_commit(&repo, name).ok().map(|c| c.id().to_string()))
    }

    fn is_descendant(&self, commit: &str, ancestor: &str) -> Result<bool> {
        let repo = self.repo()?;
        let commit = Oid::from_str(commit)?;
        let ancestor = Oid::from_str(ancestor)?;
        Ok(commit == ancestor || repo.graph_descendant_of(commit, ancestor)?)
    }

    fn remotes(&self) -> Result<Vec<Remote>> {
        let repo = self.repo()?;
        let mut result = Vec::new();
        for name in repo.remotes()?.iter().flatten() {
            if let Ok(remote) = repo.find_remote(name) {
                result.push(Remote {
                    name: name.to_string(),
                    url: remote.url().unwrap_or("").to_string(),
                    push_url: remote.pushurl().map(|s| s.to_string()),
                });
            }
        }
        Ok(result)
    }

    fn local_tags(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let tags = repo.tag_names(None)?;
        Ok(tags.iter().flatten().map(|t| t.to_string()).collect())
    }

    fn in_progress_operation(&self) -> Result<OperationKind> {
        let repo = self.repo()?;
        let kind = OperationKind::from(repo.state());
        if kind == OperationKind::None && self.pending_stash()?.is_some() {
            return Ok(OperationKind::Stash);
        }
        Ok(kind)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.iter().any(|entry| {
            let status = entry.status();
            !status.is_empty() && !status.is_ignored() && !status.is_wt_new()
        }))
    }

    fn merge(&self, source: &str, mode: MergeMode, message: Option<&str>) -> Result<StepOutcome> {
        let repo = self.repo()?;
        self.ensure_idle(&repo)?;

        let source_commit = lookup_commit(&repo, source)?;
        let annotated = repo.find_annotated_commit(source_commit.id())?;
        let (analysis, _preference) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Err(WorkcopyError::AlreadyUpToDate);
        }
        if analysis.is_unborn()
            || (analysis.is_fast_forward()
                && matches!(mode, MergeMode::Default | MergeMode::FastForwardOnly))
        {
            self.fast_forward(&repo, &source_commit)?;
            return Ok(StepOutcome::Completed);
        }
        if mode == MergeMode::FastForwardOnly {
            return Err(WorkcopyError::FastForwardOnlyViolated);
        }
        if self.has_uncommitted_changes()? {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        repo.merge(
            &[&annotated],
            None,
            Some(CheckoutBuilder::new().safe().allow_conflicts(true)),
        )
        .map_err(classify)?;

        if let Some(outcome) = conflicted(&repo, None)? {
            return Ok(outcome);
        }

        let branch = self.current_branch()?.unwrap_or_else(|| "HEAD".to_string());
        let message = message
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("Merge '{}' into {}", source, branch));
        let extra: Vec<Oid> = if mode == MergeMode::Squash {
            Vec::new()
        } else {
            vec![source_commit.id()]
        };
        commit_index(&repo, &message, &extra, None)?;
        Ok(StepOutcome::Completed)
    }

    fn rebase(&self, onto: &str) -> Result<StepOutcome> {
        let repo = self.repo()?;
        self.ensure_idle(&repo)?;

        if self.current_branch()?.is_none() {
            return Err(WorkcopyError::OperationConflict(
                "cannot rebase a detached HEAD".to_string(),
            ));
        }

        let onto_commit = lookup_commit(&repo, onto)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        if head_commit.id() == onto_commit.id()
            || repo.graph_descendant_of(head_commit.id(), onto_commit.id())?
        {
            return Err(WorkcopyError::AlreadyUpToDate);
        }
        if repo.graph_descendant_of(onto_commit.id(), head_commit.id())? {
            self.fast_forward(&repo, &onto_commit)?;
            return Ok(StepOutcome::Completed);
        }
        if self.has_uncommitted_changes()? {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        let head = repo.head()?;
        let head_annotated = repo.reference_to_annotated_commit(&head)?;
        let onto_annotated = repo.find_annotated_commit(onto_commit.id())?;
        let mut rebase = repo
            .rebase(Some(&head_annotated), Some(&onto_annotated), None, None)
            .map_err(classify)?;
        run_rebase(&repo, &mut rebase)
    }

    fn revert(&self, commit: &str) -> Result<StepOutcome> {
        let repo = self.repo()?;
        self.ensure_idle(&repo)?;
        if self.has_uncommitted_changes()? {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        let target = lookup_commit(&repo, commit)?;
        if target.parent_count() == 0 {
            return Err(WorkcopyError::OperationConflict(
                "cannot revert a root commit".to_string(),
            ));
        }

        repo.revert(&target, None).map_err(classify)?;
        if let Some(outcome) = conflicted(&repo, None)? {
            return Ok(outcome);
        }

        let message = format!(
            "Revert \"{}\"\n\nThis reverts commit {}.",
            target.summary().unwrap_or(""),
            target.id()
        );
        commit_index(&repo, &message, &[], None)?;
        Ok(StepOutcome::Completed)
    }

    fn cherry_pick(&self, commit: &str) -> Result<StepOutcome> {
        let repo = self.repo()?;
        self.ensure_idle(&repo)?;
        if self.has_uncommitted_changes()? {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        let target = lookup_commit(&repo, commit)?;
        repo.cherrypick(&target, None).map_err(classify)?;
        if let Some(outcome) = conflicted(&repo, None)? {
            return Ok(outcome);
        }

        let message = target.message().unwrap_or("").to_string();
        commit_index(&repo, &message, &[], Some(target.author().to_owned()))?;
        Ok(StepOutcome::Completed)
    }

    fn stash_apply(&self, index: usize, pop: bool) -> Result<StepOutcome> {
        let mut repo = self.repo()?;
        self.ensure_idle(&repo)?;
        if self.has_uncommitted_changes()? {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        let mut checkout = CheckoutBuilder::new();
        checkout.safe().allow_conflicts(true);
        let mut options = git2::StashApplyOptions::new();
        options.checkout_options(checkout);
        repo.stash_apply(index, Some(&mut options)).map_err(classify)?;

        if let Some(outcome) = conflicted(&repo, None)? {
            self.set_pending_stash(Some((index, pop)))?;
            return Ok(outcome);
        }
        if pop {
            repo.stash_drop(index)?;
        }
        Ok(StepOutcome::Completed)
    }

    fn continue_operation(&self, request: &OperationRequest) -> Result<StepOutcome> {
        let mut repo = self.repo()?;
        if !conflict_paths(&repo)?.is_empty() {
            return Err(WorkcopyError::Backend(
                "unmerged paths remain in the index".to_string(),
            ));
        }

        match request {
            OperationRequest::Merge {
                source,
                mode,
                message,
            } => {
                let mut heads = Vec::new();
                if *mode != MergeMode::Squash {
                    repo.mergehead_foreach(|oid| {
                        heads.push(*oid);
                        true
                    })?;
                }
                let branch = self.current_branch()?.unwrap_or_else(|| "HEAD".to_string());
                let message = message
                    .clone()
                    .unwrap_or_else(|| format!("Merge '{}' into {}", source, branch));
                commit_index(&repo, &message, &heads, None)?;
                Ok(StepOutcome::Completed)
            }
            OperationRequest::Rebase { .. } => {
                let mut rebase = repo.open_rebase(None)?;
                let signature = repo.signature()?;
                if rebase.operation_current().is_some() {
                    commit_rebase_step(&mut rebase, &signature)?;
                }
                run_rebase(&repo, &mut rebase)
            }
            OperationRequest::Revert { commit } | OperationRequest::CherryPick { commit } => {
                let message = match repo.message() {
                    Ok(message) => message,
                    Err(_) => {
                        let target = lookup_commit(&repo, commit)?;
                        target.message().unwrap_or("").to_string()
                    }
                };
                let author = match request {
                    OperationRequest::CherryPick { .. } => repo
                        .find_reference("CHERRY_PICK_HEAD")
                        .and_then(|r| r.peel_to_commit())
                        .ok()
                        .map(|c| c.author().to_owned()),
                    _ => None,
                };
                commit_index(&repo, &message, &[], author)?;
                Ok(StepOutcome::Completed)
            }
            OperationRequest::Stash { .. } => {
                if let Some((index, true)) = self.pending_stash()? {
                    repo.stash_drop(index)?;
                }
                self.set_pending_stash(None)?;
                Ok(StepOutcome::Completed)
            }
        }
    }

    fn abort_operation(&self, kind: OperationKind) -> Result<()> {
        let repo = self.repo()?;
        if kind == OperationKind::Rebase {
            if let Ok(mut rebase) = repo.open_rebase(None) {
                rebase.abort()?;
                return Ok(());
            }
        }
        let head = repo.head()?.peel_to_commit()?;
        repo.reset(head.as_object(), ResetType::Hard, None)?;
        repo.cleanup_state()?;
        self.set_pending_stash(None)?;
        Ok(())
    }

    fn merged_paths_with_unstaged_changes(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let staged = git2::Status::INDEX_NEW | git2::Status::INDEX_MODIFIED;
        let unstaged = git2::Status::WT_MODIFIED | git2::Status::WT_DELETED;
        Ok(statuses
            .iter()
            .filter(|entry| {
                let status = entry.status();
                !status.is_conflicted() && status.intersects(staged) && status.intersects(unstaged)
            })
            .filter_map(|entry| entry.path().map(|p| p.to_string()))
            .collect())
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        conflict_paths(&self.repo()?)
    }

    fn conflict_file(&self, path: &str) -> Result<ConflictFile> {
        let repo = self.repo()?;
        let index = repo.index()?;
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let matches = [&conflict.ancestor, &conflict.our, &conflict.their]
                .into_iter()
                .flatten()
                .any(|entry| entry_path(entry) == path);
            if !matches {
                continue;
            }
            let blob = |entry: &Option<git2::IndexEntry>| -> Result<Option<ConflictBlob>> {
                match entry {
                    Some(entry) => Ok(Some(ConflictBlob {
                        oid: entry.id.to_string(),
                        mode: entry.mode,
                        content: Self::blob_content(&repo, entry.id)?,
                    })),
                    None => Ok(None),
                }
            };
            return Ok(ConflictFile {
                path: path.to_string(),
                ancestor: blob(&conflict.ancestor)?,
                ours: blob(&conflict.our)?,
                theirs: blob(&conflict.their)?,
            });
        }
        Err(WorkcopyError::InvalidPath(format!("{} is not conflicted", path)))
    }

    fn read_workdir(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.path.join(checked_path(path)?);
        match std::fs::read(&full) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_workdir(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.path.join(checked_path(path)?);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, content)?;
        Ok(())
    }

    fn remove_workdir(&self, path: &str) -> Result<()> {
        let full = self.path.join(checked_path(path)?);
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_index(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let repo = self.repo()?;
        let index = repo.index()?;
        match index.get_path(checked_path(path)?, 0) {
            Some(entry) => Ok(Some(Self::blob_content(&repo, entry.id)?)),
            None => Ok(None),
        }
    }

    fn read_head(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let repo = self.repo()?;
        let Ok(head) = repo.head() else {
            return Ok(None);
        };
        let tree = head.peel_to_tree()?;
        match tree.get_path(checked_path(path)?) {
            Ok(entry) => Ok(Some(Self::blob_content(&repo, entry.id())?)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_index_entries(&self, entries: &[IndexUpdate]) -> Result<()> {
        let repo = self.repo()?;
        let mut index = repo.index()?;

        // Changes stay in memory until the single write below
        for update in entries {
            let rel = checked_path(&update.path)?;
            let mode = index
                .get_path(rel, 0)
                .or_else(|| index.get_path(rel, 2))
                .map_or(0o100644, |entry| entry.mode);
            // Missing conflict stages are not an error
            let _ = index.conflict_remove(rel);

            match &update.content {
                Some(bytes) => {
                    let entry = git2::IndexEntry {
                        ctime: git2::IndexTime::new(0, 0),
                        mtime: git2::IndexTime::new(0, 0),
                        dev: 0,
                        ino: 0,
                        mode,
                        uid: 0,
                        gid: 0,
                        file_size: bytes.len() as u32,
                        id: Oid::zero(),
                        flags: 0,
                        flags_extended: 0,
                        path: update.path.as_bytes().to_vec(),
                    };
                    index.add_frombuffer(&entry, bytes)?;
                }
                None => {
                    if index.get_path(rel, 0).is_some() {
                        index.remove_path(rel)?;
                    }
                }
            }
        }
        index.write()?;
        Ok(())
    }

    fn discard_path(&self, path: &str) -> Result<()> {
        let repo = self.repo()?;
        let rel = checked_path(path)?;
        let index = repo.index()?;

        if index.get_path(rel, 0).is_some() {
            let mut checkout = CheckoutBuilder::new();
            checkout.force().path(rel);
            repo.checkout_index(None, Some(&mut checkout))?;
        } else if self.read_head(path)?.is_some() {
            let mut checkout = CheckoutBuilder::new();
            checkout.force().path(rel);
            repo.checkout_head(Some(&mut checkout))?;
        } else {
            self.remove_workdir(path)?;
        }
        Ok(())
    }

    fn fetch(
        &self,
        remote: &str,
        options: &FetchOptions,
        hooks: &mut dyn TransferHooks,
    ) -> Result<Vec<RefUpdate>> {
        if hooks.is_canceled() {
            return Err(WorkcopyError::TransferCanceled);
        }
        let repo = self.repo()?;
        let mut git_remote = repo
            .find_remote(remote)
            .map_err(|_| WorkcopyError::RemoteNotFound(remote.to_string()))?;

        let refspecs: Vec<String> = git_remote
            .fetch_refspecs()?
            .iter()
            .flatten()
            .map(|s| s.to_string())
            .collect();
        let refspec_strs: Vec<&str> = refspecs.iter().map(|s| s.as_str()).collect();

        let state = CallbackState::new(hooks, true);
        let result = {
            let mut fetch_opts = git2::FetchOptions::new();
            fetch_opts.remote_callbacks(state.callbacks());
            fetch_opts.download_tags(AutotagOption::All);
            if options.prune.unwrap_or(false) {
                fetch_opts.prune(FetchPrune::On);
            }
            if let Some(depth) = options.depth {
                fetch_opts.depth(depth as i32);
            }
            git_remote.fetch(&refspec_strs, Some(&mut fetch_opts), None)
        };
        state.finish(result)?;

        Ok(state.updates.take())
    }

    fn push(
        &self,
        remote: &str,
        refspecs: &[String],
        hooks: &mut dyn TransferHooks,
    ) -> Result<Vec<RefUpdate>> {
        if hooks.is_canceled() {
            return Err(WorkcopyError::TransferCanceled);
        }
        let repo = self.repo()?;
        let mut git_remote = repo
            .find_remote(remote)
            .map_err(|_| WorkcopyError::RemoteNotFound(remote.to_string()))?;
        let refspec_strs: Vec<&str> = refspecs.iter().map(|s| s.as_str()).collect();

        let state = CallbackState::new(hooks, false);
        let result = {
            let mut push_opts = git2::PushOptions::new();
            push_opts.remote_callbacks(state.callbacks());
            git_remote.push(&refspec_strs, Some(&mut push_opts))
        };
        state.finish(result)?;

        let rejections = state.rejections.take();
        if let Some((refname, reason)) = rejections.first() {
            let non_ff = reason.contains("non-fast-forward") || reason.contains("fetch first");
            let message = if non_ff {
                format!("{} was rejected ({}). {}", refname, reason, NON_FAST_FORWARD_HINT)
            } else {
                format!("{} was rejected ({})", refname, reason)
            };
            return Err(WorkcopyError::Backend(message));
        }

        let pushed = state.pushed.take();
        for update in &pushed {
            state.hooks.borrow_mut().ref_updated(update.clone());
        }
        Ok(pushed)
    }

    fn submodules(&self) -> Result<Vec<SubmoduleRecord>> {
        let repo = self.repo()?;
        let mut records = Vec::new();
        for submodule in repo.submodules()? {
            records.push(SubmoduleRecord {
                name: submodule.name().unwrap_or("").to_string(),
                path: submodule.path().to_string_lossy().to_string(),
                url: submodule.url().map(|s| s.to_string()),
                branch: submodule.branch().map(|s| s.to_string()),
                initialized: submodule.open().is_ok(),
                head_oid: submodule
                    .index_id()
                    .or_else(|| submodule.head_id())
                    .map(|oid| oid.to_string()),
            });
        }
        Ok(records)
    }

    fn init_submodule(&self, path: &str) -> Result<()> {
        let repo = self.repo()?;
        let mut submodule = repo
            .find_submodule(path)
            .map_err(|_| WorkcopyError::InvalidPath(format!("no submodule at {}", path)))?;
        submodule.init(false)?;
        if submodule.open().is_err() {
            submodule.repo_init(true)?;
        }
        Ok(())
    }

    fn open_submodule(&self, path: &str) -> Result<Arc<dyn GitBackend>> {
        let repo = self.repo()?;
        let submodule = repo
            .find_submodule(path)
            .map_err(|_| WorkcopyError::RepositoryNotFound(path.to_string()))?;
        let sub_repo = submodule
            .open()
            .map_err(|_| WorkcopyError::RepositoryNotFound(path.to_string()))?;
        let workdir = sub_repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| WorkcopyError::RepositoryNotFound(path.to_string()))?;
        Ok(Arc::new(Git2Backend::open(workdir)?))
    }

    fn checkout_detached(&self, oid: &str) -> Result<()> {
        let repo = self.repo()?;
        let oid = Oid::from_str(oid).map_err(|_| WorkcopyError::CommitNotFound(oid.to_string()))?;
        let commit = repo
            .find_commit(oid)
            .map_err(|_| WorkcopyError::CommitNotFound(oid.to_string()))?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))
            .map_err(classify)?;
        repo.set_head_detached(oid)?;
        Ok(())
    }
}
