//! Temporary git repositories for backend tests

#![cfg(test)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary git repository
pub struct TestRepo {
    pub dir: TempDir,
    pub path: PathBuf,
}

fn configure_user(repo: &git2::Repository) {
    let mut config = repo.config().expect("Failed to get config");
    config
        .set_str("user.name", "Test User")
        .expect("Failed to set user.name");
    config
        .set_str("user.email", "test@example.com")
        .expect("Failed to set user.email");
}

impl TestRepo {
    /// Create a new empty repository
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().to_path_buf();
        let repo = git2::Repository::init(&path).expect("Failed to init repo");
        configure_user(&repo);
        Self { dir, path }
    }

    /// Create a repository with an initial commit
    pub fn with_initial_commit() -> Self {
        let test_repo = Self::new();
        test_repo.create_commit("Initial commit", &[("README.md", "# Test Repo")]);
        test_repo
    }

    /// Bare repository standing in for a server
    pub fn bare() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().to_path_buf();
        git2::Repository::init_bare(&path).expect("Failed to init bare repo");
        Self { dir, path }
    }

    /// Clone `remote` over the local file transport
    pub fn clone_of(remote: &TestRepo) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("clone");
        let repo = git2::Repository::clone(&remote.url(), &path).expect("Failed to clone");
        configure_user(&repo);
        Self { dir, path }
    }

    /// `file://` URL of the repository
    pub fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }

    pub fn repo(&self) -> git2::Repository {
        git2::Repository::open(&self.path).expect("Failed to open repo")
    }

    fn write_file(&self, name: &str, content: &str) {
        let file_path = self.path.join(name);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        std::fs::write(&file_path, content).expect("Failed to write file");
    }

    /// Write `files`, stage them and commit on HEAD
    pub fn create_commit(&self, message: &str, files: &[(&str, &str)]) -> git2::Oid {
        let repo = self.repo();
        let mut index = repo.index().expect("Failed to get index");
        for (name, content) in files {
            self.write_file(name, content);
            index
                .add_path(Path::new(name))
                .expect("Failed to stage file");
        }
        index.write().expect("Failed to write index");

        let tree_oid = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_oid).expect("Failed to find tree");
        let sig = repo.signature().expect("Failed to get signature");

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.as_ref().into_iter().collect();

        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .expect("Failed to create commit")
    }

    /// Create a branch at the current HEAD
    pub fn create_branch(&self, name: &str) -> git2::Oid {
        let repo = self.repo();
        let commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .expect("Failed to get HEAD commit");
        repo.branch(name, &commit, false)
            .expect("Failed to create branch");
        commit.id()
    }

    pub fn checkout_branch(&self, name: &str) {
        let repo = self.repo();
        let branch = repo
            .find_branch(name, git2::BranchType::Local)
            .expect("Failed to find branch");
        let obj = branch
            .get()
            .peel(git2::ObjectType::Commit)
            .expect("Failed to peel");
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(&obj, Some(&mut checkout))
            .expect("Failed to checkout");
        repo.set_head(branch.get().name().expect("Branch name is not UTF-8"))
            .expect("Failed to set HEAD");
    }

    pub fn current_branch(&self) -> String {
        let repo = self.repo();
        let head = repo.head().expect("Failed to get HEAD");
        head.shorthand().unwrap_or("").to_string()
    }

    pub fn head_oid(&self) -> git2::Oid {
        let repo = self.repo();
        let head = repo.head().expect("Failed to get HEAD");
        head.target().expect("Failed to get target")
    }

    /// Target of any reference, `None` when it does not exist
    pub fn ref_oid(&self, name: &str) -> Option<git2::Oid> {
        self.repo()
            .find_reference(name)
            .ok()
            .and_then(|r| r.target())
    }

    /// Push a local branch to `origin`
    pub fn push_branch(&self, branch: &str) {
        let repo = self.repo();
        let mut remote = repo.find_remote("origin").expect("Failed to find origin");
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], None)
            .expect("Failed to push");
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_commit() {
        let repo = TestRepo::with_initial_commit();
        assert!(repo.repo().head().unwrap().target().is_some());
        let readme = std::fs::read_to_string(repo.path.join("README.md")).unwrap();
        assert_eq!(readme, "# Test Repo");
    }

    #[test]
    fn test_checkout_branch() {
        let repo = TestRepo::with_initial_commit();
        repo.create_branch("feature");
        repo.checkout_branch("feature");
        assert_eq!(repo.current_branch(), "feature");
    }

    #[test]
    fn test_clone_of_bare_server() {
        let server = TestRepo::bare();
        let seed = TestRepo::with_initial_commit();
        seed.repo().remote("origin", &server.url()).unwrap();
        let branch = seed.current_branch();
        seed.push_branch(&branch);

        let clone = TestRepo::clone_of(&server);
        assert_eq!(clone.head_oid(), seed.head_oid());
    }
}
