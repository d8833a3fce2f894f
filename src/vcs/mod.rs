//! Version-control collaborator.
//!
//! The workspace manager only needs the primitives below; `GitVcs` provides
//! them over a git repository with linked worktrees.

mod git;

pub use git::GitVcs;

use async_trait::async_trait;
use std::path::Path;

use crate::errors::FlowResult;

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Resolve a ref (branch, tag, sha) to a commit sha.
    async fn resolve(&self, reference: &str) -> FlowResult<String>;

    /// Create an isolated checkout at `path` on a new `branch` rooted at `base_ref`.
    async fn create_worktree(&self, path: &Path, branch: &str, base_ref: &str) -> FlowResult<()>;

    /// Whether the checkout has uncommitted changes, untracked files included.
    async fn is_dirty(&self, checkout: &Path) -> FlowResult<bool>;

    /// Commit everything in the checkout. Returns `None` when there was nothing to commit.
    async fn commit_all(&self, checkout: &Path, message: &str) -> FlowResult<Option<String>>;

    /// Merge `branch` into `trunk` with an explicit merge commit. On failure
    /// the merge is aborted and trunk is left as it was.
    async fn merge_no_ff(&self, trunk: &str, branch: &str, message: &str) -> FlowResult<String>;

    /// Point `trunk` back at `sha`, discarding anything after it.
    async fn reset_trunk(&self, trunk: &str, sha: &str) -> FlowResult<()>;

    /// Remove the isolated checkout. `force` discards uncommitted changes.
    async fn remove_worktree(&self, path: &Path, force: bool) -> FlowResult<()>;

    async fn delete_branch(&self, branch: &str) -> FlowResult<()>;

    /// Forget worktrees whose directories were deleted by hand.
    async fn prune_worktrees(&self) -> FlowResult<()>;
}

/// Helpers for building throwaway repositories in tests.
#[cfg(test)]
pub(crate) mod testing {
    use git2::{Repository, RepositoryInitOptions, Signature};
    use std::path::Path;

    /// Initialise a repo with `main` as trunk and one commit. `.forge/` is
    /// excluded the way `forgeflow init` excludes it.
    pub fn init_repo(dir: &Path) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir, &opts).unwrap();
        let info = repo.path().join("info");
        std::fs::create_dir_all(&info).unwrap();
        std::fs::write(info.join("exclude"), ".forge/\n").unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        std::fs::write(dir.join("README.md"), "# project\n").unwrap();
        commit_all(&repo, "initial commit");
        repo
    }

    pub fn commit_all(repo: &Repository, msg: &str) {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<_> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
            .unwrap();
    }
}
