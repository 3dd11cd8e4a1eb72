//! In-memory repository
//!
//! Keeps a commit DAG, index, working tree, stashes and submodules in memory.
//! Remotes live on a shared [`MemoryNetwork`] keyed by URL, so several
//! backends can push and fetch against the same simulated server.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{GitBackend, IndexUpdate, TransferHooks};
use crate::error::{Result, WorkcopyError, NON_FAST_FORWARD_HINT};
use crate::models::{
    ConflictBlob, ConflictFile, Credential, CredentialKind, CredentialRequest, FetchOptions,
    MergeMode, OperationKind, OperationRequest, RefUpdate, Remote, StepOutcome, StepProgress,
    SubmoduleRecord, TransferProgress, UpstreamInfo,
};

type Tree = BTreeMap<String, String>;

/// Answers beyond this are treated as a failed login even if hooks keep answering
const MAX_AUTH_ROUNDS: u32 = 16;
const BYTES_PER_OBJECT: usize = 256;

#[derive(Debug, Clone)]
struct MemoryCommit {
    parents: Vec<String>,
    tree: Tree,
    message: String,
}

#[derive(Debug, Clone, Default)]
struct RemoteRepository {
    branches: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    auth: Option<(String, String)>,
    unreachable: bool,
    requests: usize,
}

#[derive(Debug, Default)]
struct NetworkState {
    commits: HashMap<String, MemoryCommit>,
    remotes: HashMap<String, RemoteRepository>,
    next_id: u64,
    paused: bool,
}

impl NetworkState {
    fn create_commit(&mut self, parents: Vec<String>, tree: Tree, message: &str) -> String {
        self.next_id += 1;
        let id = format!("{:040x}", self.next_id);
        self.commits.insert(
            id.clone(),
            MemoryCommit {
                parents,
                tree,
                message: message.to_string(),
            },
        );
        id
    }

    fn tree(&self, id: &str) -> Tree {
        self.commits
            .get(id)
            .map(|c| c.tree.clone())
            .unwrap_or_default()
    }

    fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = vec![id.to_string()];
        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&current) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    fn is_descendant(&self, commit: &str, ancestor: &str) -> bool {
        self.ancestors(commit).contains(ancestor)
    }

    /// Nearest common ancestor, walking breadth-first from `a`
    fn merge_base(&self, a: &str, b: &str) -> Option<String> {
        let of_b = self.ancestors(b);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([a.to_string()]);
        while let Some(current) = queue.pop_front() {
            if of_b.contains(&current) {
                return Some(current);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&current) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        None
    }

    /// Commits reachable from `tips` but not from `known`
    fn missing_objects(&self, tips: &[String], known: &[String]) -> usize {
        let known: HashSet<String> = known.iter().flat_map(|k| self.ancestors(k)).collect();
        let wanted: HashSet<String> = tips.iter().flat_map(|t| self.ancestors(t)).collect();
        wanted.difference(&known).count()
    }
}

/// Simulated network of remote repositories, shared between backends
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<(Mutex<NetworkState>, Condvar)>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_remote(&self, url: &str) {
        self.state().remotes.entry(url.to_string()).or_default();
    }

    /// Commit a tree straight into the object store
    pub fn create_commit(&self, parents: &[&str], files: &[(&str, &str)], message: &str) -> String {
        let mut state = self.state();
        let mut tree = parents
            .first()
            .map(|p| state.tree(p))
            .unwrap_or_default();
        for (path, content) in files {
            tree.insert(path.to_string(), content.to_string());
        }
        let parents = parents.iter().map(|p| p.to_string()).collect();
        state.create_commit(parents, tree, message)
    }

    pub fn set_remote_branch(&self, url: &str, branch: &str, oid: &str) {
        self.state()
            .remotes
            .entry(url.to_string())
            .or_default()
            .branches
            .insert(branch.to_string(), oid.to_string());
    }

    pub fn remote_branch(&self, url: &str, branch: &str) -> Option<String> {
        self.state()
            .remotes
            .get(url)
            .and_then(|r| r.branches.get(branch).cloned())
    }

    pub fn remote_tag(&self, url: &str, tag: &str) -> Option<String> {
        self.state()
            .remotes
            .get(url)
            .and_then(|r| r.tags.get(tag).cloned())
    }

    /// Require HTTP basic credentials for every connection to `url`
    pub fn require_auth(&self, url: &str, username: &str, password: &str) {
        self.state().remotes.entry(url.to_string()).or_default().auth =
            Some((username.to_string(), password.to_string()));
    }

    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        self.state()
            .remotes
            .entry(url.to_string())
            .or_default()
            .unreachable = unreachable;
    }

    /// Connections made to `url` so far
    pub fn request_count(&self, url: &str) -> usize {
        self.state().remotes.get(url).map_or(0, |r| r.requests)
    }

    pub fn commit_message(&self, oid: &str) -> Option<String> {
        self.state().commits.get(oid).map(|c| c.message.clone())
    }

    pub fn commit_parents(&self, oid: &str) -> Vec<String> {
        self.state()
            .commits
            .get(oid)
            .map(|c| c.parents.clone())
            .unwrap_or_default()
    }

    pub fn commit_file(&self, oid: &str, path: &str) -> Option<String> {
        self.state()
            .commits
            .get(oid)
            .and_then(|c| c.tree.get(path).cloned())
    }

    /// Hold every new connection until [`MemoryNetwork::resume`]
    pub fn pause(&self) {
        self.state().paused = true;
    }

    pub fn resume(&self) {
        self.state().paused = false;
        self.inner.1.notify_all();
    }

    fn wait_until_open(&self) {
        let mut state = self.state();
        while state.paused {
            state = self
                .inner
                .1
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Open a connection, then authenticate through the hooks
    fn connect(&self, url: &str, hooks: &mut dyn TransferHooks) -> Result<()> {
        self.wait_until_open();
        if hooks.is_canceled() {
            return Err(WorkcopyError::TransferCanceled);
        }

        let auth = {
            let mut state = self.state();
            let remote = state
                .remotes
                .get_mut(url)
                .ok_or_else(|| WorkcopyError::Backend(format!("repository '{url}' not found")))?;
            if remote.unreachable {
                return Err(WorkcopyError::Backend(format!(
                    "failed to connect to {url}: host unreachable"
                )));
            }
            remote.requests += 1;
            remote.auth.clone()
        };

        let Some((expected_user, expected_password)) = auth else {
            return Ok(());
        };

        for attempt in 0..MAX_AUTH_ROUNDS {
            if hooks.is_canceled() {
                return Err(WorkcopyError::TransferCanceled);
            }
            let request = CredentialRequest::new(CredentialKind::HttpBasic, url).with_attempt(attempt);
            if let Credential::UserPass { username, password } = hooks.credentials(request)? {
                if username == expected_user && password == expected_password {
                    return Ok(());
                }
            }
            tracing::debug!("Rejected credentials for {} (attempt {})", url, attempt + 1);
        }
        Err(WorkcopyError::Backend(format!("authentication failed for '{url}'")))
    }

    /// Emit one progress callback per object
    fn transfer_objects(&self, count: usize, hooks: &mut dyn TransferHooks) -> Result<TransferProgress> {
        let mut progress = TransferProgress {
            total_objects: count,
            ..TransferProgress::default()
        };
        for received in 1..=count {
            progress.received_objects = received;
            progress.indexed_objects = received;
            progress.received_bytes = received * BYTES_PER_OBJECT;
            if hooks.is_canceled() || !hooks.progress(progress) {
                return Err(WorkcopyError::TransferCanceled);
            }
        }
        Ok(progress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Head {
    Branch(String),
    Detached(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IndexEntry {
    Staged(String),
    Conflict {
        ancestor: Option<String>,
        ours: Option<String>,
        theirs: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct Checkpoint {
    head: Head,
    branches: BTreeMap<String, String>,
    index: BTreeMap<String, IndexEntry>,
    workdir: Tree,
}

#[derive(Debug, Clone)]
enum Pending {
    Merge {
        theirs: String,
        squash: bool,
        message: String,
    },
    Rebase {
        branch: String,
        tip: String,
        current: String,
        remaining: VecDeque<String>,
        total: usize,
    },
    Pick {
        kind: OperationKind,
        message: String,
    },
    Stash {
        index: usize,
        pop: bool,
    },
}

#[derive(Debug, Clone)]
struct StashEntry {
    base: Option<String>,
    changes: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone)]
struct MemorySubmodule {
    name: String,
    url: Option<String>,
    branch: Option<String>,
    recorded: Option<String>,
    repo: Option<Arc<MemoryBackend>>,
}

#[derive(Debug)]
struct RepoState {
    head: Head,
    branches: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    remotes: BTreeMap<String, String>,
    tracking: BTreeMap<String, String>,
    upstreams: BTreeMap<String, UpstreamInfo>,
    index: BTreeMap<String, IndexEntry>,
    workdir: Tree,
    stashes: Vec<StashEntry>,
    submodules: BTreeMap<String, MemorySubmodule>,
    pending: Option<(Pending, Checkpoint)>,
}

impl RepoState {
    fn head_oid(&self) -> Option<String> {
        match &self.head {
            Head::Branch(name) => self.branches.get(name).cloned(),
            Head::Detached(oid) => Some(oid.clone()),
        }
    }

    fn head_tree(&self, net: &NetworkState) -> Tree {
        self.head_oid().map(|oid| net.tree(&oid)).unwrap_or_default()
    }

    fn set_head_oid(&mut self, oid: &str) {
        match &self.head {
            Head::Branch(name) => {
                self.branches.insert(name.clone(), oid.to_string());
            }
            Head::Detached(_) => self.head = Head::Detached(oid.to_string()),
        }
    }

    fn checkout_tree(&mut self, tree: &Tree) {
        self.index = tree
            .iter()
            .map(|(path, content)| (path.clone(), IndexEntry::Staged(content.clone())))
            .collect();
        self.workdir = tree.clone();
    }

    fn staged(&self, path: &str) -> Option<&String> {
        match self.index.get(path) {
            Some(IndexEntry::Staged(content)) => Some(content),
            _ => None,
        }
    }

    fn conflicted_paths(&self) -> Vec<String> {
        self.index
            .iter()
            .filter(|(_, entry)| matches!(entry, IndexEntry::Conflict { .. }))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Tree built from stage-0 entries; `None` while conflicts remain
    fn index_tree(&self) -> Option<Tree> {
        let mut tree = Tree::new();
        for (path, entry) in &self.index {
            match entry {
                IndexEntry::Staged(content) => {
                    tree.insert(path.clone(), content.clone());
                }
                IndexEntry::Conflict { .. } => return None,
            }
        }
        Some(tree)
    }

    fn is_dirty(&self, net: &NetworkState) -> bool {
        let head = self.head_tree(net);
        let mut paths: BTreeSet<&String> = head.keys().collect();
        paths.extend(self.index.keys());
        let dirty = paths.into_iter().any(|path| {
            let staged = match self.index.get(path) {
                Some(IndexEntry::Staged(content)) => Some(content),
                Some(IndexEntry::Conflict { .. }) => return true,
                None => None,
            };
            staged != head.get(path) || (staged.is_some() && self.workdir.get(path) != staged)
        });
        dirty
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            head: self.head.clone(),
            branches: self.branches.clone(),
            index: self.index.clone(),
            workdir: self.workdir.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.head = checkpoint.head;
        self.branches = checkpoint.branches;
        self.index = checkpoint.index;
        self.workdir = checkpoint.workdir;
    }

    fn resolve(&self, net: &NetworkState, name: &str) -> Option<String> {
        if name == "HEAD" {
            return self.head_oid();
        }
        let short = name
            .strip_prefix("refs/heads/")
            .or_else(|| name.strip_prefix("refs/remotes/"))
            .or_else(|| name.strip_prefix("refs/tags/"))
            .unwrap_or(name);
        self.branches
            .get(short)
            .or_else(|| self.tracking.get(short))
            .or_else(|| self.tags.get(short))
            .cloned()
            .or_else(|| net.commits.contains_key(name).then(|| name.to_string()))
    }

    fn apply_merge(&mut self, merged: TreeMerge) {
        let mut index: BTreeMap<String, IndexEntry> = merged
            .tree
            .into_iter()
            .map(|(path, content)| (path, IndexEntry::Staged(content)))
            .collect();
        for (path, (ancestor, ours, theirs)) in merged.conflicts {
            index.insert(
                path,
                IndexEntry::Conflict {
                    ancestor,
                    ours,
                    theirs,
                },
            );
        }
        self.index = index;
        self.workdir = merged.workdir;
    }

    fn commit_index(
        &mut self,
        net: &mut NetworkState,
        parents: Vec<String>,
        message: &str,
    ) -> Result<String> {
        let tree = self
            .index_tree()
            .ok_or_else(|| WorkcopyError::Backend("unmerged paths remain in the index".to_string()))?;
        let oid = net.create_commit(parents, tree, message);
        self.set_head_oid(&oid);
        Ok(oid)
    }

    fn fast_forward(&mut self, net: &NetworkState, oid: &str) -> Result<()> {
        if self.is_dirty(net) {
            return Err(WorkcopyError::DirtyWorkingTree);
        }
        self.set_head_oid(oid);
        let tree = net.tree(oid);
        self.checkout_tree(&tree);
        Ok(())
    }

    fn branch_label(&self) -> String {
        match &self.head {
            Head::Branch(name) => name.clone(),
            Head::Detached(_) => "HEAD".to_string(),
        }
    }
}

struct TreeMerge {
    tree: Tree,
    conflicts: BTreeMap<String, (Option<String>, Option<String>, Option<String>)>,
    workdir: Tree,
}

impl TreeMerge {
    fn conflict_paths(&self) -> Vec<String> {
        self.conflicts.keys().cloned().collect()
    }
}

fn push_block_part(out: &mut String, part: &str) {
    out.push_str(part);
    if !part.is_empty() && !part.ends_with('\n') {
        out.push('\n');
    }
}

fn conflict_block(ours: &str, theirs: &str, ours_label: &str, theirs_label: &str) -> String {
    let mut out = format!("<<<<<<< {ours_label}\n");
    push_block_part(&mut out, ours);
    out.push_str("=======\n");
    push_block_part(&mut out, theirs);
    out.push_str(&format!(">>>>>>> {theirs_label}\n"));
    out
}

/// Line-wise three-way merge. Equal line counts merge line by line with
/// adjacent conflicting lines grouped into one block; anything else
/// conflicts as a whole file.
fn merge_text(
    base: &str,
    ours: &str,
    theirs: &str,
    ours_label: &str,
    theirs_label: &str,
) -> std::result::Result<String, String> {
    let b: Vec<&str> = base.split_inclusive('\n').collect();
    let o: Vec<&str> = ours.split_inclusive('\n').collect();
    let t: Vec<&str> = theirs.split_inclusive('\n').collect();

    if b.len() != o.len() || b.len() != t.len() {
        return Err(conflict_block(ours, theirs, ours_label, theirs_label));
    }

    let mut out = String::new();
    let mut pending_ours = String::new();
    let mut pending_theirs = String::new();
    let mut conflicted = false;

    for i in 0..b.len() {
        let line = if o[i] == t[i] || t[i] == b[i] {
            Some(o[i])
        } else if o[i] == b[i] {
            Some(t[i])
        } else {
            None
        };
        match line {
            Some(line) => {
                if !pending_ours.is_empty() || !pending_theirs.is_empty() {
                    out.push_str(&conflict_block(
                        &std::mem::take(&mut pending_ours),
                        &std::mem::take(&mut pending_theirs),
                        ours_label,
                        theirs_label,
                    ));
                }
                out.push_str(line);
            }
            None => {
                conflicted = true;
                pending_ours.push_str(o[i]);
                pending_theirs.push_str(t[i]);
            }
        }
    }
    if !pending_ours.is_empty() || !pending_theirs.is_empty() {
        out.push_str(&conflict_block(
            &pending_ours,
            &pending_theirs,
            ours_label,
            theirs_label,
        ));
    }

    if conflicted {
        Err(out)
    } else {
        Ok(out)
    }
}

fn merge_trees(
    base: &Tree,
    ours: &Tree,
    theirs: &Tree,
    ours_label: &str,
    theirs_label: &str,
) -> TreeMerge {
    let mut paths: BTreeSet<&String> = base.keys().collect();
    paths.extend(ours.keys());
    paths.extend(theirs.keys());

    let mut result = TreeMerge {
        tree: Tree::new(),
        conflicts: BTreeMap::new(),
        workdir: Tree::new(),
    };

    for path in paths {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        let clean = if o == t || t == b {
            Some(o.cloned())
        } else if o == b {
            Some(t.cloned())
        } else {
            None
        };

        if let Some(content) = clean {
            if let Some(content) = content {
                result.tree.insert(path.clone(), content.clone());
                result.workdir.insert(path.clone(), content);
            }
            continue;
        }

        let working = match (b, o, t) {
            (Some(b), Some(o), Some(t)) => match merge_text(b, o, t, ours_label, theirs_label) {
                Ok(merged) => {
                    result.tree.insert(path.clone(), merged.clone());
                    result.workdir.insert(path.clone(), merged);
                    continue;
                }
                Err(marked) => marked,
            },
            (None, Some(o), Some(t)) => conflict_block(o, t, ours_label, theirs_label),
            // modify/delete keeps the surviving version in the working tree
            (_, Some(o), None) => o.clone(),
            (_, None, Some(t)) => t.clone(),
            (_, None, None) => continue,
        };
        result
            .conflicts
            .insert(path.clone(), (b.cloned(), o.cloned(), t.cloned()));
        result.workdir.insert(path.clone(), working);
    }

    result
}

/// Relative path that stays inside the repository
fn is_repo_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && path.split('/').all(|part| !part.is_empty() && part != "..")
}

fn blob_id(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Repository held entirely in memory
#[derive(Debug)]
pub struct MemoryBackend {
    network: MemoryNetwork,
    state: Mutex<RepoState>,
}

impl MemoryBackend {
    /// Empty repository on branch `main`
    pub fn new(network: &MemoryNetwork) -> Self {
        Self {
            network: network.clone(),
            state: Mutex::new(RepoState {
                head: Head::Branch("main".to_string()),
                branches: BTreeMap::new(),
                tags: BTreeMap::new(),
                remotes: BTreeMap::new(),
                tracking: BTreeMap::new(),
                upstreams: BTreeMap::new(),
                index: BTreeMap::new(),
                workdir: Tree::new(),
                stashes: Vec::new(),
                submodules: BTreeMap::new(),
                pending: None,
            }),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commit `files` on top of HEAD and check the result out
    pub fn commit(&self, message: &str, files: &[(&str, &str)]) -> String {
        let mut state = self.lock();
        let mut net = self.network.state();
        let mut tree = state.head_tree(&net);
        for (path, content) in files {
            tree.insert(path.to_string(), content.to_string());
        }
        let parents = state.head_oid().into_iter().collect();
        let oid = net.create_commit(parents, tree.clone(), message);
        state.set_head_oid(&oid);
        state.checkout_tree(&tree);
        oid
    }

    pub fn create_branch(&self, name: &str) {
        let mut state = self.lock();
        if let Some(oid) = state.head_oid() {
            state.branches.insert(name.to_string(), oid);
        }
    }

    pub fn checkout(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let net = self.network.state();
        let oid = state
            .branches
            .get(name)
            .cloned()
            .ok_or_else(|| WorkcopyError::Backend(format!("branch '{name}' not found")))?;
        state.head = Head::Branch(name.to_string());
        let tree = net.tree(&oid);
        state.checkout_tree(&tree);
        Ok(())
    }

    pub fn add_remote(&self, name: &str, url: &str) {
        self.network.create_remote(url);
        self.lock()
            .remotes
            .insert(name.to_string(), url.to_string());
    }

    pub fn tag(&self, name: &str) {
        let mut state = self.lock();
        if let Some(oid) = state.head_oid() {
            state.tags.insert(name.to_string(), oid);
        }
    }

    pub fn head_oid(&self) -> Option<String> {
        self.lock().head_oid()
    }

    pub fn branch_oid(&self, name: &str) -> Option<String> {
        self.lock().branches.get(name).cloned()
    }

    /// Remote-tracking branch such as `origin/main`
    pub fn tracking_oid(&self, name: &str) -> Option<String> {
        self.lock().tracking.get(name).cloned()
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.lock().head, Head::Detached(_))
    }

    pub fn detach(&self) {
        let mut state = self.lock();
        if let Some(oid) = state.head_oid() {
            state.head = Head::Detached(oid);
        }
    }

    /// Save working-tree changes of tracked files as a new stash@{0}
    pub fn stash_save(&self) -> Result<()> {
        let mut state = self.lock();
        let net = self.network.state();
        let head = state.head_tree(&net);
        let mut changes = BTreeMap::new();
        let mut paths: BTreeSet<String> = head.keys().cloned().collect();
        paths.extend(state.index.keys().cloned());
        for path in paths {
            let current = state.workdir.get(&path);
            if current != head.get(&path) {
                changes.insert(path.clone(), current.cloned());
            }
        }
        if changes.is_empty() {
            return Err(WorkcopyError::Backend("no local changes to save".to_string()));
        }
        let base = state.head_oid();
        state.stashes.insert(0, StashEntry { base, changes });
        state.checkout_tree(&head);
        Ok(())
    }

    pub fn stash_count(&self) -> usize {
        self.lock().stashes.len()
    }

    /// Record a submodule in `.gitmodules` without initializing it
    pub fn add_submodule(&self, path: &str, url: Option<&str>, recorded: Option<&str>) {
        self.lock().submodules.insert(
            path.to_string(),
            MemorySubmodule {
                name: path.to_string(),
                url: url.map(|u| u.to_string()),
                branch: None,
                recorded: recorded.map(|r| r.to_string()),
                repo: None,
            },
        );
    }

    pub fn submodule_repo(&self, path: &str) -> Option<Arc<MemoryBackend>> {
        self.lock()
            .submodules
            .get(path)
            .and_then(|sm| sm.repo.clone())
    }

    fn begin_step(&self, state: &RepoState, net: &NetworkState) -> Result<()> {
        if state.pending.is_some() {
            return Err(WorkcopyError::OperationConflict(
                "another operation is in progress".to_string(),
            ));
        }
        if state.is_dirty(net) {
            return Err(WorkcopyError::DirtyWorkingTree);
        }
        Ok(())
    }

    fn resolve_commit(&self, state: &RepoState, net: &NetworkState, name: &str) -> Result<String> {
        state
            .resolve(net, name)
            .ok_or_else(|| WorkcopyError::CommitNotFound(name.to_string()))
    }

    /// Replay the remaining rebase commits onto the current tip
    fn run_rebase(&self, state: &mut RepoState, net: &mut NetworkState) -> Result<StepOutcome> {
        loop {
            let Some((Pending::Rebase {
                branch,
                tip,
                current,
                remaining,
                total,
            }, _)) = state.pending.as_mut()
            else {
                return Err(WorkcopyError::Backend("no rebase in progress".to_string()));
            };

            let Some(next) = remaining.pop_front() else {
                let (branch, tip) = (branch.clone(), tip.clone());
                state.branches.insert(branch.clone(), tip.clone());
                state.head = Head::Branch(branch);
                let tree = net.tree(&tip);
                state.checkout_tree(&tree);
                state.pending = None;
                return Ok(StepOutcome::Completed);
            };

            *current = next.clone();
            let step = *total - remaining.len();
            let total = *total;
            let onto = tip.clone();

            let commit = net
                .commits
                .get(&next)
                .cloned()
                .ok_or_else(|| WorkcopyError::CommitNotFound(next.clone()))?;
            let base = commit
                .parents
                .first()
                .map(|p| net.tree(p))
                .unwrap_or_default();
            let merged = merge_trees(
                &base,
                &net.tree(&onto),
                &commit.tree,
                &onto,
                &next,
            );

            if !merged.conflicts.is_empty() {
                let paths = merged.conflict_paths();
                state.apply_merge(merged);
                return Ok(StepOutcome::Conflicted {
                    paths,
                    progress: Some(StepProgress {
                        current: step,
                        total,
                    }),
                });
            }

            let new_tip = net.create_commit(vec![onto], merged.tree.clone(), &commit.message);
            state.head = Head::Detached(new_tip.clone());
            state.checkout_tree(&merged.tree);
            if let Some((Pending::Rebase { tip, .. }, _)) = state.pending.as_mut() {
                *tip = new_tip;
            }
        }
    }

    fn pick(&self, commit: &str, revert: bool) -> Result<StepOutcome> {
        let mut state = self.lock();
        let mut net = self.network.state();
        self.begin_step(&state, &net)?;

        let oid = self.resolve_commit(&state, &net, commit)?;
        let picked = net
            .commits
            .get(&oid)
            .cloned()
            .ok_or_else(|| WorkcopyError::CommitNotFound(oid.clone()))?;
        let parent_tree = picked
            .parents
            .first()
            .map(|p| net.tree(p))
            .unwrap_or_default();

        let (base, theirs, message) = if revert {
            if picked.parents.is_empty() {
                return Err(WorkcopyError::OperationConflict(
                    "cannot revert a root commit".to_string(),
                ));
            }
            let summary = picked.message.lines().next().unwrap_or_default();
            let message = format!("Revert \"{summary}\"\n\nThis reverts commit {oid}.");
            (picked.tree.clone(), parent_tree, message)
        } else {
            (parent_tree, picked.tree.clone(), picked.message.clone())
        };

        let checkpoint = state.checkpoint();
        let ours = state.head_tree(&net);
        let label = state.branch_label();
        let merged = merge_trees(&base, &ours, &theirs, &label, &oid);
        let conflicted = merged.conflict_paths();
        state.apply_merge(merged);

        if !conflicted.is_empty() {
            let kind = if revert {
                OperationKind::Revert
            } else {
                OperationKind::CherryPick
            };
            state.pending = Some((Pending::Pick { kind, message }, checkpoint));
            return Ok(StepOutcome::Conflicted {
                paths: conflicted,
                progress: None,
            });
        }

        let parents = state.head_oid().into_iter().collect();
        state.commit_index(&mut net, parents, &message)?;
        Ok(StepOutcome::Completed)
    }
}

impl GitBackend for MemoryBackend {
    fn current_branch(&self) -> Result<Option<String>> {
        let state = self.lock();
        Ok(match &state.head {
            Head::Branch(name) => Some(name.clone()),
            Head::Detached(_) => None,
        })
    }

    fn upstream(&self, branch: &str) -> Result<Option<UpstreamInfo>> {
        Ok(self.lock().upstreams.get(branch).cloned())
    }

    fn set_upstream(&self, branch: &str, upstream: &UpstreamInfo) -> Result<()> {
        self.lock()
            .upstreams
            .insert(branch.to_string(), upstream.clone());
        Ok(())
    }

    fn ahead_behind(&self, branch: &str) -> Result<Option<(usize, usize)>> {
        let state = self.lock();
        let net = self.network.state();
        let Some(upstream) = state.upstreams.get(branch) else {
            return Ok(None);
        };
        let (Some(local), Some(remote)) = (
            state.branches.get(branch),
            state.tracking.get(&upstream.tracking_name()),
        ) else {
            return Ok(None);
        };
        let ours = net.ancestors(local);
        let theirs = net.ancestors(remote);
        Ok(Some((
            ours.difference(&theirs).count(),
            theirs.difference(&ours).count(),
        )))
    }

    fn resolve(&self, name: &str) -> Result<Option<String>> {
        let state = self.lock();
        let net = self.network.state();
        Ok(state.resolve(&net, name))
    }

    fn is_descendant(&self, commit: &str, ancestor: &str) -> Result<bool> {
        Ok(self.network.state().is_descendant(commit, ancestor))
    }

    fn remotes(&self) -> Result<Vec<Remote>> {
        Ok(self
            .lock()
            .remotes
            .iter()
            .map(|(name, url)| Remote {
                name: name.clone(),
                url: url.clone(),
                push_url: None,
            })
            .collect())
    }

    fn local_tags(&self) -> Result<Vec<String>> {
        Ok(self.lock().tags.keys().cloned().collect())
    }

    fn in_progress_operation(&self) -> Result<OperationKind> {
        let state = self.lock();
        Ok(match &state.pending {
            None => OperationKind::None,
            Some((Pending::Merge { .. }, _)) => OperationKind::Merge,
            Some((Pending::Rebase { .. }, _)) => OperationKind::Rebase,
            Some((Pending::Pick { kind, .. }, _)) => *kind,
            Some((Pending::Stash { .. }, _)) => OperationKind::Stash,
        })
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let state = self.lock();
        let net = self.network.state();
        Ok(state.is_dirty(&net))
    }

    fn merge(&self, source: &str, mode: MergeMode, message: Option<&str>) -> Result<StepOutcome> {
        let mut state = self.lock();
        let mut net = self.network.state();
        if state.pending.is_some() {
            return Err(WorkcopyError::OperationConflict(
                "another operation is in progress".to_string(),
            ));
        }

        let theirs = self.resolve_commit(&state, &net, source)?;
        let Some(head) = state.head_oid() else {
            state.fast_forward(&net, &theirs)?;
            return Ok(StepOutcome::Completed);
        };

        if net.is_descendant(&head, &theirs) {
            return Err(WorkcopyError::AlreadyUpToDate);
        }
        let can_fast_forward = net.is_descendant(&theirs, &head);
        if can_fast_forward && matches!(mode, MergeMode::Default | MergeMode::FastForwardOnly) {
            state.fast_forward(&net, &theirs)?;
            return Ok(StepOutcome::Completed);
        }
        if mode == MergeMode::FastForwardOnly {
            return Err(WorkcopyError::FastForwardOnlyViolated);
        }
        if state.is_dirty(&net) {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        let base = net
            .merge_base(&head, &theirs)
            .map(|b| net.tree(&b))
            .unwrap_or_default();
        let checkpoint = state.checkpoint();
        let merged = merge_trees(&base, &net.tree(&head), &net.tree(&theirs), "HEAD", source);
        let conflicted = merged.conflict_paths();
        state.apply_merge(merged);

        let squash = mode == MergeMode::Squash;
        let message = message
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("Merge '{}' into {}", source, state.branch_label()));

        if !conflicted.is_empty() {
            state.pending = Some((
                Pending::Merge {
                    theirs,
                    squash,
                    message,
                },
                checkpoint,
            ));
            return Ok(StepOutcome::Conflicted {
                paths: conflicted,
                progress: None,
            });
        }

        let mut parents = vec![head];
        if !squash {
            parents.push(theirs);
        }
        state.commit_index(&mut net, parents, &message)?;
        Ok(StepOutcome::Completed)
    }

    fn rebase(&self, onto: &str) -> Result<StepOutcome> {
        let mut state = self.lock();
        let mut net = self.network.state();
        if state.pending.is_some() {
            return Err(WorkcopyError::OperationConflict(
                "another operation is in progress".to_string(),
            ));
        }

        let Head::Branch(branch) = state.head.clone() else {
            return Err(WorkcopyError::OperationConflict(
                "cannot rebase a detached HEAD".to_string(),
            ));
        };
        let onto_oid = self.resolve_commit(&state, &net, onto)?;
        let head = state
            .head_oid()
            .ok_or_else(|| WorkcopyError::Backend(format!("branch '{branch}' has no commits")))?;

        if net.is_descendant(&head, &onto_oid) {
            return Err(WorkcopyError::AlreadyUpToDate);
        }
        if net.is_descendant(&onto_oid, &head) {
            state.fast_forward(&net, &onto_oid)?;
            return Ok(StepOutcome::Completed);
        }
        if state.is_dirty(&net) {
            return Err(WorkcopyError::DirtyWorkingTree);
        }

        let upstream = net.ancestors(&onto_oid);
        let mut replay = VecDeque::new();
        let mut cursor = Some(head);
        while let Some(oid) = cursor {
            if upstream.contains(&oid) {
                break;
            }
            cursor = net.commits.get(&oid).and_then(|c| c.parents.first().cloned());
            replay.push_front(oid);
        }

        let checkpoint = state.checkpoint();
        let total = replay.len();
        state.head = Head::Detached(onto_oid.clone());
        let tree = net.tree(&onto_oid);
        state.checkout_tree(&tree);
        state.pending = Some((
            Pending::Rebase {
                branch,
                tip: onto_oid,
                current: String::new(),
                remaining: replay,
                total,
            },
            checkpoint,
        ));
        self.run_rebase(&mut state, &mut net)
    }

    fn revert(&self, commit: &str) -> Result<StepOutcome> {
        self.pick(commit, true)
    }

    fn cherry_pick(&self, commit: &str) -> Result<StepOutcome> {
        self.pick(commit, false)
    }

    fn stash_apply(&self, index: usize, pop: bool) -> Result<StepOutcome> {
        let mut state = self.lock();
        let net = self.network.state();
        if state.pending.is_some() {
            return Err(WorkcopyError::OperationConflict(
                "another operation is in progress".to_string(),
            ));
        }
        let stash = state
            .stashes
            .get(index)
            .cloned()
            .ok_or_else(|| WorkcopyError::Backend(format!("no stash entry at stash@{{{index}}}")))?;

        let head = state.head_tree(&net);
        for path in stash.changes.keys() {
            let staged = state.staged(path);
            if staged != head.get(path) || state.workdir.get(path) != staged {
                return Err(WorkcopyError::DirtyWorkingTree);
            }
        }

        let stash_base = stash.base.as_deref().map(|b| net.tree(b)).unwrap_or_default();
        let mut base = Tree::new();
        let mut ours = Tree::new();
        let mut theirs = Tree::new();
        for (path, content) in &stash.changes {
            if let Some(b) = stash_base.get(path) {
                base.insert(path.clone(), b.clone());
            }
            if let Some(o) = head.get(path) {
                ours.insert(path.clone(), o.clone());
            }
            if let Some(t) = content {
                theirs.insert(path.clone(), t.clone());
            }
        }

        let checkpoint = state.checkpoint();
        let merged = merge_trees(&base, &ours, &theirs, "Updated upstream", "Stashed changes");
        for path in stash.changes.keys() {
            match merged.workdir.get(path) {
                Some(content) => state.workdir.insert(path.clone(), content.clone()),
                None => state.workdir.remove(path),
            };
        }
        for (path, (ancestor, ours, theirs)) in &merged.conflicts {
            state.index.insert(
                path.clone(),
                IndexEntry::Conflict {
                    ancestor: ancestor.clone(),
                    ours: ours.clone(),
                    theirs: theirs.clone(),
                },
            );
        }

        if !merged.conflicts.is_empty() {
            let paths = merged.conflict_paths();
            state.pending = Some((Pending::Stash { index, pop }, checkpoint));
            return Ok(StepOutcome::Conflicted {
                paths,
                progress: None,
            });
        }

        if pop {
            state.stashes.remove(index);
        }
        Ok(StepOutcome::Completed)
    }

    fn continue_operation(&self, request: &OperationRequest) -> Result<StepOutcome> {
        let mut state = self.lock();
        let mut net = self.network.state();
        let Some((pending, checkpoint)) = state.pending.take() else {
            return Err(WorkcopyError::OperationConflict(format!(
                "no {} in progress",
                request.kind()
            )));
        };
        if !state.conflicted_paths().is_empty() {
            state.pending = Some((pending, checkpoint));
            return Err(WorkcopyError::Backend(
                "unmerged paths remain in the index".to_string(),
            ));
        }

        match pending {
            Pending::Merge {
                theirs,
                squash,
                message,
            } => {
                let mut parents: Vec<String> = state.head_oid().into_iter().collect();
                if !squash {
                    parents.push(theirs);
                }
                state.commit_index(&mut net, parents, &message)?;
                Ok(StepOutcome::Completed)
            }
            Pending::Pick { message, .. } => {
                let parents = state.head_oid().into_iter().collect();
                state.commit_index(&mut net, parents, &message)?;
                Ok(StepOutcome::Completed)
            }
            Pending::Stash { index, pop } => {
                if pop && index < state.stashes.len() {
                    state.stashes.remove(index);
                }
                Ok(StepOutcome::Completed)
            }
            Pending::Rebase {
                branch,
                tip,
                current,
                remaining,
                total,
            } => {
                let message = net
                    .commits
                    .get(&current)
                    .map(|c| c.message.clone())
                    .unwrap_or_default();
                let tree = state
                    .index_tree()
                    .ok_or_else(|| WorkcopyError::Backend("unmerged paths remain".to_string()))?;
                let new_tip = net.create_commit(vec![tip], tree.clone(), &message);
                state.head = Head::Detached(new_tip.clone());
                state.checkout_tree(&tree);
                state.pending = Some((
                    Pending::Rebase {
                        branch,
                        tip: new_tip,
                        current,
                        remaining,
                        total,
                    },
                    checkpoint,
                ));
                self.run_rebase(&mut state, &mut net)
            }
        }
    }

    fn abort_operation(&self, _kind: OperationKind) -> Result<()> {
        let mut state = self.lock();
        if let Some((_, checkpoint)) = state.pending.take() {
            state.restore(checkpoint);
        }
        Ok(())
    }

    fn merged_paths_with_unstaged_changes(&self) -> Result<Vec<String>> {
        let state = self.lock();
        let net = self.network.state();
        let head = state.head_tree(&net);
        Ok(state
            .index
            .iter()
            .filter_map(|(path, entry)| match entry {
                IndexEntry::Staged(content)
                    if head.get(path) != Some(content)
                        && state.workdir.get(path) != Some(content) =>
                {
                    Some(path.clone())
                }
                _ => None,
            })
            .collect())
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        Ok(self.lock().conflicted_paths())
    }

    fn conflict_file(&self, path: &str) -> Result<ConflictFile> {
        let state = self.lock();
        let Some(IndexEntry::Conflict {
            ancestor,
            ours,
            theirs,
        }) = state.index.get(path)
        else {
            return Err(WorkcopyError::InvalidPath(format!("{path} is not conflicted")));
        };
        let blob = |content: &Option<String>| {
            content.as_ref().map(|c| ConflictBlob {
                oid: blob_id(c),
                mode: 0o100644,
                content: c.as_bytes().to_vec(),
            })
        };
        Ok(ConflictFile {
            path: path.to_string(),
            ancestor: blob(ancestor),
            ours: blob(ours),
            theirs: blob(theirs),
        })
    }

    fn read_workdir(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .workdir
            .get(path)
            .map(|c| c.as_bytes().to_vec()))
    }

    fn write_workdir(&self, path: &str, content: &[u8]) -> Result<()> {
        self.lock().workdir.insert(path.to_string(), text(content));
        Ok(())
    }

    fn remove_workdir(&self, path: &str) -> Result<()> {
        self.lock().workdir.remove(path);
        Ok(())
    }

    fn read_index(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().staged(path).map(|c| c.as_bytes().to_vec()))
    }

    fn read_head(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        let net = self.network.state();
        Ok(state
            .head_tree(&net)
            .get(path)
            .map(|c| c.as_bytes().to_vec()))
    }

    fn write_index_entries(&self, entries: &[IndexUpdate]) -> Result<()> {
        if let Some(bad) = entries.iter().find(|u| !is_repo_path(&u.path)) {
            return Err(WorkcopyError::InvalidPath(bad.path.clone()));
        }
        let mut state = self.lock();
        for update in entries {
            match &update.content {
                Some(bytes) => {
                    state
                        .index
                        .insert(update.path.clone(), IndexEntry::Staged(text(bytes)));
                }
                None => {
                    state.index.remove(&update.path);
                }
            }
        }
        Ok(())
    }

    fn discard_path(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        let net = self.network.state();
        let restored = state
            .staged(path)
            .cloned()
            .or_else(|| state.head_tree(&net).get(path).cloned());
        match restored {
            Some(content) => state.workdir.insert(path.to_string(), content),
            None => state.workdir.remove(path),
        };
        Ok(())
    }

    fn fetch(
        &self,
        remote: &str,
        options: &FetchOptions,
        hooks: &mut dyn TransferHooks,
    ) -> Result<Vec<RefUpdate>> {
        let (url, known) = {
            let state = self.lock();
            let url = state
                .remotes
                .get(remote)
                .cloned()
                .ok_or_else(|| WorkcopyError::RemoteNotFound(remote.to_string()))?;
            let known: Vec<String> = state
                .branches
                .values()
                .chain(state.tracking.values())
                .cloned()
                .collect();
            (url, known)
        };

        self.network.connect(&url, hooks)?;

        let (branches, tags, missing) = {
            let net = self.network.state();
            let repo = net.remotes.get(&url).cloned().unwrap_or_default();
            let tips: Vec<String> = repo.branches.values().cloned().collect();
            let missing = net.missing_objects(&tips, &known);
            (repo.branches, repo.tags, missing)
        };
        self.network.transfer_objects(missing, hooks)?;

        let mut state = self.lock();
        let mut updates = Vec::new();
        for (branch, oid) in &branches {
            let key = format!("{remote}/{branch}");
            let old = state.tracking.insert(key.clone(), oid.clone());
            if old.as_deref() != Some(oid.as_str()) {
                updates.push(RefUpdate {
                    refname: format!("refs/remotes/{key}"),
                    old,
                    new: Some(oid.clone()),
                });
            }
        }
        if options.prune.unwrap_or(false) {
            let prefix = format!("{remote}/");
            let stale: Vec<String> = state
                .tracking
                .keys()
                .filter(|k| {
                    k.strip_prefix(&prefix)
                        .is_some_and(|branch| !branches.contains_key(branch))
                })
                .cloned()
                .collect();
            for key in stale {
                let old = state.tracking.remove(&key);
                updates.push(RefUpdate {
                    refname: format!("refs/remotes/{key}"),
                    old,
                    new: None,
                });
            }
        }
        for (tag, oid) in tags {
            if !state.tags.contains_key(&tag) {
                state.tags.insert(tag.clone(), oid.clone());
                updates.push(RefUpdate {
                    refname: format!("refs/tags/{tag}"),
                    old: None,
                    new: Some(oid),
                });
            }
        }
        drop(state);

        for update in &updates {
            hooks.ref_updated(update.clone());
        }
        Ok(updates)
    }

    fn push(
        &self,
        remote: &str,
        refspecs: &[String],
        hooks: &mut dyn TransferHooks,
    ) -> Result<Vec<RefUpdate>> {
        let (url, planned) = {
            let state = self.lock();
            let net = self.network.state();
            let url = state
                .remotes
                .get(remote)
                .cloned()
                .ok_or_else(|| WorkcopyError::RemoteNotFound(remote.to_string()))?;
            let mut planned = Vec::new();
            for spec in refspecs {
                let (force, spec) = match spec.strip_prefix('+') {
                    Some(rest) => (true, rest),
                    None => (false, spec.as_str()),
                };
                let (src, dst) = spec.split_once(':').unwrap_or((spec, spec));
                let oid = state
                    .resolve(&net, src)
                    .ok_or_else(|| WorkcopyError::Backend(format!("src refspec {src} does not match any")))?;
                planned.push((force, dst.to_string(), oid));
            }
            (url, planned)
        };

        self.network.connect(&url, hooks)?;

        let missing = {
            let net = self.network.state();
            let repo = net.remotes.get(&url).cloned().unwrap_or_default();
            let tips: Vec<String> = planned.iter().map(|(_, _, oid)| oid.clone()).collect();
            let known: Vec<String> = repo.branches.values().cloned().collect();

            for (force, dst, oid) in &planned {
                let current = if let Some(branch) = dst.strip_prefix("refs/heads/") {
                    repo.branches.get(branch)
                } else if let Some(tag) = dst.strip_prefix("refs/tags/") {
                    repo.tags.get(tag)
                } else {
                    None
                };
                if let Some(current) = current {
                    if !force && current != oid && !net.is_descendant(oid, current) {
                        return Err(WorkcopyError::Backend(format!(
                            "failed to push some refs to '{url}': {dst} was rejected (non-fast-forward). {NON_FAST_FORWARD_HINT}"
                        )));
                    }
                }
            }
            net.missing_objects(&tips, &known)
        };
        self.network.transfer_objects(missing, hooks)?;

        let mut updates = Vec::new();
        {
            let mut net = self.network.state();
            let repo = net.remotes.entry(url.clone()).or_default();
            for (_, dst, oid) in &planned {
                let old = if let Some(branch) = dst.strip_prefix("refs/heads/") {
                    repo.branches.insert(branch.to_string(), oid.clone())
                } else if let Some(tag) = dst.strip_prefix("refs/tags/") {
                    repo.tags.insert(tag.to_string(), oid.clone())
                } else {
                    continue;
                };
                if old.as_deref() != Some(oid.as_str()) {
                    updates.push(RefUpdate {
                        refname: dst.clone(),
                        old,
                        new: Some(oid.clone()),
                    });
                }
            }
        }

        {
            let mut state = self.lock();
            for (_, dst, oid) in &planned {
                if let Some(branch) = dst.strip_prefix("refs/heads/") {
                    state
                        .tracking
                        .insert(format!("{remote}/{branch}"), oid.clone());
                }
            }
        }

        for update in &updates {
            hooks.ref_updated(update.clone());
        }
        Ok(updates)
    }

    fn submodules(&self) -> Result<Vec<SubmoduleRecord>> {
        Ok(self
            .lock()
            .submodules
            .iter()
            .map(|(path, sm)| SubmoduleRecord {
                name: sm.name.clone(),
                path: path.clone(),
                url: sm.url.clone(),
                branch: sm.branch.clone(),
                initialized: sm.repo.is_some(),
                head_oid: sm.recorded.clone(),
            })
            .collect())
    }

    fn init_submodule(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        let submodule = state
            .submodules
            .get_mut(path)
            .ok_or_else(|| WorkcopyError::InvalidPath(format!("no submodule at {path}")))?;
        if submodule.repo.is_some() {
            return Ok(());
        }
        let url = submodule
            .url
            .clone()
            .ok_or_else(|| WorkcopyError::Backend(format!("submodule {path} has no url")))?;
        let repo = MemoryBackend::new(&self.network);
        repo.add_remote("origin", &url);
        submodule.repo = Some(Arc::new(repo));
        Ok(())
    }

    fn open_submodule(&self, path: &str) -> Result<Arc<dyn GitBackend>> {
        let repo = self
            .submodule_repo(path)
            .ok_or_else(|| WorkcopyError::RepositoryNotFound(path.to_string()))?;
        Ok(repo)
    }

    fn checkout_detached(&self, oid: &str) -> Result<()> {
        let mut state = self.lock();
        let net = self.network.state();
        if !net.commits.contains_key(oid) {
            return Err(WorkcopyError::CommitNotFound(oid.to_string()));
        }
        state.head = Head::Detached(oid.to_string());
        let tree = net.tree(oid);
        state.checkout_tree(&tree);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_merge_takes_both_sides() {
        let merged = merge_text("a\nb\nc\n", "A\nb\nc\n", "a\nb\nC\n", "HEAD", "topic");
        assert_eq!(merged, Ok("A\nb\nC\n".to_string()));
    }

    #[test]
    fn test_line_merge_groups_adjacent_conflicts() {
        let merged = merge_text("a\nb\nc\n", "x\ny\nc\n", "1\n2\nc\n", "HEAD", "topic");
        assert_eq!(
            merged,
            Err("<<<<<<< HEAD\nx\ny\n=======\n1\n2\n>>>>>>> topic\nc\n".to_string())
        );
    }

    #[test]
    fn test_modify_delete_keeps_modified_version() {
        let base = Tree::from([("f".to_string(), "a\n".to_string())]);
        let ours = Tree::from([("f".to_string(), "b\n".to_string())]);
        let theirs = Tree::new();
        let merged = merge_trees(&base, &ours, &theirs, "HEAD", "topic");
        assert_eq!(merged.conflict_paths(), vec!["f".to_string()]);
        assert_eq!(merged.workdir.get("f").map(String::as_str), Some("b\n"));
    }

    #[test]
    fn test_commit_and_branch() {
        let network = MemoryNetwork::new();
        let repo = MemoryBackend::new(&network);
        let first = repo.commit("first", &[("a.txt", "1\n")]);
        repo.create_branch("topic");
        let second = repo.commit("second", &[("a.txt", "2\n")]);
        assert_eq!(repo.branch_oid("topic"), Some(first.clone()));
        assert_eq!(network.commit_parents(&second), vec![first]);
        assert!(!repo.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn test_dirty_detection_ignores_untracked() {
        let network = MemoryNetwork::new();
        let repo = MemoryBackend::new(&network);
        repo.commit("first", &[("a.txt", "1\n")]);
        repo.write_workdir("new.txt", b"x").unwrap();
        assert!(!repo.has_uncommitted_changes().unwrap());
        repo.write_workdir("a.txt", b"2\n").unwrap();
        assert!(repo.has_uncommitted_changes().unwrap());
    }
}
