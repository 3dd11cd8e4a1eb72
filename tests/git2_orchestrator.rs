//! The orchestrator over a real repository on disk

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use workcopy::models::{
    OperationKind, OperationRequest, OperationState, ResolutionSide, StageTarget,
    SubmoduleUpdateOptions, SubmoduleUpdateStatus,
};
use workcopy::services::NoPrompter;
use workcopy::{Git2Backend, GitBackend, OperationOrchestrator, Settings};

fn commit_files(repo: &git2::Repository, message: &str, files: &[(&str, &str)]) -> git2::Oid {
    let workdir = repo.workdir().expect("non-bare repository");
    let mut index = repo.index().expect("index");
    for (name, content) in files {
        std::fs::write(workdir.join(name), content).expect("write file");
        index.add_path(Path::new(name)).expect("stage file");
    }
    index.write().expect("write index");
    let tree = repo
        .find_tree(index.write_tree().expect("write tree"))
        .expect("find tree");
    let signature = repo.signature().expect("signature");
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .expect("commit")
}

fn switch(repo: &git2::Repository, refname: &str) {
    repo.set_head(refname).expect("set HEAD");
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .expect("checkout");
}

fn init_repo(path: &Path) -> git2::Repository {
    let repo = git2::Repository::init(path).expect("init");
    {
        let mut config = repo.config().expect("config");
        config.set_str("user.name", "Test User").expect("user.name");
        config
            .set_str("user.email", "test@example.com")
            .expect("user.email");
    }
    repo
}

fn branch_name(repo: &git2::Repository) -> String {
    repo.head()
        .expect("HEAD")
        .shorthand()
        .expect("utf-8 branch")
        .to_string()
}

fn file_at(repo: &git2::Repository, commit: &git2::Commit, path: &str) -> String {
    let blob = commit
        .tree()
        .expect("tree")
        .get_path(Path::new(path))
        .expect("tree entry")
        .to_object(repo)
        .expect("object")
        .peel_to_blob()
        .expect("blob");
    String::from_utf8(blob.content().to_vec()).expect("utf-8 blob")
}

/// Repository on its default branch with `topic` editing the same line
fn diverged() -> (TempDir, git2::Repository) {
    let dir = TempDir::new().expect("temp dir");
    let repo = init_repo(dir.path());

    let base = commit_files(&repo, "base", &[("f.txt", "a\nb\nc\n")]);
    let default_branch = repo
        .head()
        .expect("HEAD")
        .name()
        .expect("utf-8 ref")
        .to_string();
    repo.branch("topic", &repo.find_commit(base).expect("base"), false)
        .expect("branch");
    commit_files(&repo, "main edit", &[("f.txt", "a\nmain\nc\n")]);

    switch(&repo, "refs/heads/topic");
    commit_files(&repo, "topic edit", &[("f.txt", "a\ntopic\nc\n")]);
    switch(&repo, &default_branch);

    (dir, repo)
}

fn open(path: &Path) -> OperationOrchestrator {
    let backend = Git2Backend::open(path).expect("open backend");
    OperationOrchestrator::open(Arc::new(backend), Settings::default(), Arc::new(NoPrompter))
        .expect("open orchestrator")
}

#[tokio::test]
async fn conflicting_merge_resolved_by_hunk() {
    let (dir, repo) = diverged();
    let orch = open(dir.path());
    let head_before = repo.head().unwrap().target().unwrap();

    let state = orch.begin(OperationRequest::merge("topic")).await.unwrap();
    assert_eq!(state, OperationState::ConflictPaused);

    let status = orch.status().unwrap();
    assert_eq!(status.kind, OperationKind::Merge);
    assert_eq!(status.conflicts.len(), 1);
    assert_eq!(status.conflicts[0].path, "f.txt");
    assert_eq!(status.conflicts[0].hunks.len(), 1);

    orch.staging()
        .resolve_hunk("f.txt", 0, ResolutionSide::Theirs, None)
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "a\ntopic\nc\n"
    );

    let state = orch.continue_operation().await.unwrap();
    assert_eq!(state, OperationState::Completed);

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert_eq!(head.parent_count(), 2);
    assert_eq!(head.parent_id(0).unwrap(), head_before);
    assert_eq!(repo.state(), git2::RepositoryState::Clean);

    let blob = head
        .tree()
        .unwrap()
        .get_path(Path::new("f.txt"))
        .unwrap()
        .to_object(&repo)
        .unwrap()
        .peel_to_blob()
        .unwrap();
    assert_eq!(blob.content(), b"a\ntopic\nc\n");
}

#[tokio::test]
async fn abort_restores_the_pre_merge_state() {
    let (dir, repo) = diverged();
    let orch = open(dir.path());
    let head_before = repo.head().unwrap().target().unwrap();

    orch.begin(OperationRequest::merge("topic")).await.unwrap();
    assert_eq!(repo.state(), git2::RepositoryState::Merge);

    assert_eq!(orch.abort().await.unwrap(), OperationState::Aborted);
    assert_eq!(repo.state(), git2::RepositoryState::Clean);
    assert_eq!(repo.head().unwrap().target().unwrap(), head_before);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "a\nmain\nc\n"
    );
}

#[tokio::test]
async fn reopening_adopts_a_paused_merge() {
    let (dir, _repo) = diverged();
    let first = open(dir.path());
    first.begin(OperationRequest::merge("topic")).await.unwrap();
    drop(first);

    let reopened = open(dir.path());
    let status = reopened.status().unwrap();
    assert_eq!(status.kind, OperationKind::Merge);
    assert_eq!(status.state, OperationState::ConflictPaused);
    assert_eq!(reopened.snapshot().banner.as_deref(), Some("MERGING"));

    reopened
        .staging()
        .resolve_file("f.txt", ResolutionSide::Ours)
        .unwrap();
    assert_eq!(
        reopened.continue_operation().await.unwrap(),
        OperationState::Completed
    );
}

#[tokio::test]
async fn staging_one_hunk_of_a_real_file() {
    let dir = TempDir::new().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
    }
    let original: String = (1..=12).map(|n| format!("line {n}\n")).collect();
    commit_files(&repo, "numbers", &[("n.txt", original.as_str())]);

    let edited = original
        .replace("line 1\n", "LINE 1\n")
        .replace("line 12\n", "LINE 12\n");
    std::fs::write(dir.path().join("n.txt"), &edited).unwrap();

    let orch = open(dir.path());
    let hunks = orch.staging().file_hunks("n.txt", false).unwrap();
    assert_eq!(hunks.hunks.len(), 2);

    orch.staging()
        .stage(&StageTarget::Hunk {
            path: "n.txt".to_string(),
            index: 0,
        })
        .unwrap();

    let backend = orch.context().backend();
    let staged = String::from_utf8(backend.read_index("n.txt").unwrap().unwrap()).unwrap();
    assert!(staged.starts_with("LINE 1\n"));
    assert!(staged.ends_with("line 12\n"));
    assert_eq!(orch.staging().file_hunks("n.txt", true).unwrap().hunks.len(), 1);
    assert_eq!(orch.staging().file_hunks("n.txt", false).unwrap().hunks.len(), 1);
}

#[tokio::test]
async fn rebase_pauses_on_each_conflicting_step() {
    let dir = TempDir::new().unwrap();
    let repo = init_repo(dir.path());
    let base = commit_files(&repo, "base", &[("f.txt", "a\nb\nc\n")]);
    let main = branch_name(&repo);
    repo.branch("topic", &repo.find_commit(base).unwrap(), false)
        .unwrap();
    let main_tip = commit_files(&repo, "main edit", &[("f.txt", "a\nmain\nc\n")]);
    switch(&repo, "refs/heads/topic");
    commit_files(&repo, "topic one", &[("f.txt", "a\ntopic1\nc\n")]);
    commit_files(&repo, "topic two", &[("f.txt", "a\ntopic2\nc\n")]);

    let orch = open(dir.path());
    let state = orch
        .begin(OperationRequest::Rebase { onto: main.clone() })
        .await
        .unwrap();
    assert_eq!(state, OperationState::ConflictPaused);
    assert_eq!(orch.snapshot().banner.as_deref(), Some("REBASING 1/2"));
    assert_eq!(repo.state(), git2::RepositoryState::RebaseMerge);

    orch.staging()
        .resolve_hunk(
            "f.txt",
            0,
            ResolutionSide::Manual,
            Some("merged\n".to_string()),
        )
        .unwrap();
    let state = orch.continue_operation().await.unwrap();
    assert_eq!(state, OperationState::ConflictPaused);
    assert_eq!(orch.snapshot().banner.as_deref(), Some("REBASING 2/2"));
    assert_eq!(orch.status().unwrap().conflicts.len(), 1);

    orch.staging()
        .resolve_hunk("f.txt", 0, ResolutionSide::Theirs, None)
        .unwrap();
    let state = orch.continue_operation().await.unwrap();
    assert_eq!(state, OperationState::Completed);
    assert_eq!(repo.state(), git2::RepositoryState::Clean);

    let head = repo.head().unwrap();
    assert_eq!(head.shorthand(), Some("topic"));
    let second = head.peel_to_commit().unwrap();
    assert_eq!(second.summary(), Some("topic two"));
    assert_eq!(file_at(&repo, &second, "f.txt"), "a\ntopic2\nc\n");

    let first = second.parent(0).unwrap();
    assert_eq!(first.summary(), Some("topic one"));
    assert_eq!(file_at(&repo, &first, "f.txt"), "a\nmerged\nc\n");
    assert_eq!(first.parent_id(0).unwrap(), main_tip);
}

#[tokio::test]
async fn cherry_pick_conflict_continues_to_a_single_parent_commit() {
    let (dir, repo) = diverged();
    let main_tip = repo.head().unwrap().target().unwrap();
    let orch = open(dir.path());

    let state = orch
        .begin(OperationRequest::CherryPick {
            commit: "topic".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(state, OperationState::ConflictPaused);
    assert_eq!(orch.snapshot().banner.as_deref(), Some("CHERRY-PICKING"));
    assert_eq!(repo.state(), git2::RepositoryState::CherryPick);

    orch.staging()
        .resolve_file("f.txt", ResolutionSide::Theirs)
        .unwrap();
    assert_eq!(
        orch.continue_operation().await.unwrap(),
        OperationState::Completed
    );

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert_eq!(head.summary(), Some("topic edit"));
    assert_eq!(head.parent_count(), 1);
    assert_eq!(head.parent_id(0).unwrap(), main_tip);
    assert_eq!(file_at(&repo, &head, "f.txt"), "a\ntopic\nc\n");
    assert_eq!(repo.state(), git2::RepositoryState::Clean);
}

#[tokio::test]
async fn revert_conflict_continues_with_the_revert_message() {
    let (dir, repo) = diverged();
    let reverted = repo.head().unwrap().target().unwrap();
    let later = commit_files(&repo, "later edit", &[("f.txt", "a\nlater\nc\n")]);
    let orch = open(dir.path());

    let state = orch
        .begin(OperationRequest::Revert {
            commit: reverted.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(state, OperationState::ConflictPaused);
    assert_eq!(orch.status().unwrap().kind, OperationKind::Revert);

    orch.staging()
        .resolve_hunk("f.txt", 0, ResolutionSide::Theirs, None)
        .unwrap();
    assert_eq!(
        orch.continue_operation().await.unwrap(),
        OperationState::Completed
    );

    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert!(head
        .summary()
        .unwrap()
        .starts_with("Revert \"main edit\""));
    assert_eq!(head.parent_id(0).unwrap(), later);
    assert_eq!(file_at(&repo, &head, "f.txt"), "a\nb\nc\n");
    assert_eq!(repo.state(), git2::RepositoryState::Clean);
}

#[tokio::test]
async fn stash_pop_conflict_survives_reopen_and_drops_on_continue() {
    let dir = TempDir::new().unwrap();
    let mut repo = init_repo(dir.path());
    commit_files(&repo, "base", &[("f.txt", "a\nb\nc\n")]);
    std::fs::write(dir.path().join("f.txt"), "a\nstash\nc\n").unwrap();
    let signature = repo.signature().unwrap();
    repo.stash_save(&signature, "wip", None).unwrap();
    commit_files(&repo, "head edit", &[("f.txt", "a\nhead\nc\n")]);

    let first = open(dir.path());
    let state = first
        .begin(OperationRequest::Stash {
            index: 0,
            pop: true,
        })
        .await
        .unwrap();
    assert_eq!(state, OperationState::ConflictPaused);
    assert!(dir.path().join(".git").join("WORKCOPY_STASH").exists());
    drop(first);

    let reopened = open(dir.path());
    let status = reopened.status().unwrap();
    assert_eq!(status.kind, OperationKind::Stash);
    assert_eq!(status.state, OperationState::ConflictPaused);
    assert_eq!(reopened.snapshot().banner.as_deref(), Some("APPLYING STASH"));

    reopened
        .staging()
        .resolve_hunk("f.txt", 0, ResolutionSide::Theirs, None)
        .unwrap();
    assert_eq!(
        reopened.continue_operation().await.unwrap(),
        OperationState::Completed
    );

    assert!(!dir.path().join(".git").join("WORKCOPY_STASH").exists());
    let mut stashes = 0;
    repo.stash_foreach(|_, _, _| {
        stashes += 1;
        true
    })
    .unwrap();
    assert_eq!(stashes, 0);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "a\nstash\nc\n"
    );
}

#[tokio::test]
async fn staging_files_writes_nothing_when_one_path_fails() {
    let dir = TempDir::new().unwrap();
    let repo = init_repo(dir.path());
    commit_files(&repo, "base", &[("a.txt", "one\n")]);
    std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();

    let orch = open(dir.path());
    let result = orch.staging().stage(&StageTarget::Files {
        paths: vec!["a.txt".to_string(), "../evil".to_string()],
    });
    assert!(result.is_err());

    let backend = orch.context().backend();
    assert_eq!(backend.read_index("a.txt").unwrap().as_deref(), Some(&b"one\n"[..]));
    assert_eq!(
        orch.staging().file_hunks("a.txt", false).unwrap().hunks.len(),
        1
    );
}

#[tokio::test]
async fn submodule_init_and_update_over_a_local_remote() {
    let lib_dir = TempDir::new().unwrap();
    let lib = init_repo(lib_dir.path());
    let lib_tip = commit_files(&lib, "lib", &[("lib.rs", "pub fn lib() {}\n")]);
    let lib_url = format!("file://{}", lib_dir.path().display());

    let super_dir = TempDir::new().unwrap();
    let superproject = init_repo(super_dir.path());
    commit_files(&superproject, "base", &[("README.md", "super\n")]);
    {
        let mut submodule = superproject
            .submodule(&lib_url, Path::new("lib"), true)
            .unwrap();
        submodule.clone(None).unwrap();
        submodule.add_finalize().unwrap();
    }
    commit_files(&superproject, "add lib", &[]);

    let clone_dir = TempDir::new().unwrap();
    let super_url = format!("file://{}", super_dir.path().display());
    git2::Repository::clone(&super_url, clone_dir.path()).unwrap();

    let orch = open(clone_dir.path());
    let records = orch.submodules().list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, "lib");
    assert!(!records[0].initialized);
    assert_eq!(records[0].head_oid, Some(lib_tip.to_string()));

    let skipped = orch
        .submodules()
        .update(&[], SubmoduleUpdateOptions::default())
        .await;
    assert_eq!(skipped[0].status, SubmoduleUpdateStatus::InvalidRepository);

    let results = orch
        .submodules()
        .update(
            &[],
            SubmoduleUpdateOptions {
                init: true,
                recursive: false,
            },
        )
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, SubmoduleUpdateStatus::Updated);

    let checked_out = git2::Repository::open(clone_dir.path().join("lib")).unwrap();
    assert_eq!(checked_out.head().unwrap().target().unwrap(), lib_tip);
    assert!(checked_out.head_detached().unwrap());
    assert_eq!(
        std::fs::read_to_string(clone_dir.path().join("lib").join("lib.rs")).unwrap(),
        "pub fn lib() {}\n"
    );
    assert!(orch.submodules().list().unwrap()[0].initialized);
}
