use async_trait::async_trait;
use git2::{Repository, Signature, StatusOptions};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::Vcs;
use crate::errors::{FlowError, FlowResult};

/// Git-backed VCS: worktree and merge plumbing through the git CLI,
/// status and commits through libgit2.
pub struct GitVcs {
    repo_root: PathBuf,
}

impl GitVcs {
    pub fn new(repo_root: &Path) -> FlowResult<Self> {
        Repository::open(repo_root).map_err(|e| {
            FlowError::Vcs(format!(
                "Not a git repository: {} ({})",
                repo_root.display(),
                e.message()
            ))
        })?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
        })
    }

    /// Add `pattern` to `.git/info/exclude` unless it is already there, so
    /// forgeflow's own state never shows up as untracked.
    pub fn ensure_excluded(&self, pattern: &str) -> FlowResult<()> {
        let repo = Repository::open(&self.repo_root)?;
        let info = repo.path().join("info");
        std::fs::create_dir_all(&info)?;
        let exclude = info.join("exclude");
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == pattern) {
            return Ok(());
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(pattern);
        content.push('\n');
        std::fs::write(&exclude, content)?;
        Ok(())
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> FlowResult<String> {
        tracing::debug!(dir = %dir.display(), "git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| FlowError::Vcs(format!("Failed to run git {}: {}", args[0], e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::Vcs(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn current_branch(&self) -> FlowResult<String> {
        self.git(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
    }

    /// Check out `trunk` in the main checkout. Returns what was checked out
    /// before (a branch, or a sha when detached) if it had to switch.
    async fn checkout_trunk(&self, trunk: &str) -> FlowResult<Option<String>> {
        let current = self.current_branch().await?;
        if current == trunk {
            return Ok(None);
        }
        let previous = if current == "HEAD" {
            self.git(&self.repo_root, &["rev-parse", "HEAD"]).await?
        } else {
            current
        };
        tracing::warn!(from = %previous, to = %trunk, "switching main checkout to trunk for merge");
        self.git(&self.repo_root, &["checkout", trunk]).await?;
        Ok(Some(previous))
    }

    async fn restore_checkout(&self, previous: Option<String>) {
        let Some(previous) = previous else {
            return;
        };
        match self.git(&self.repo_root, &["checkout", &previous]).await {
            Ok(_) => tracing::info!(to = %previous, "restored main checkout"),
            Err(e) => tracing::warn!(to = %previous, "Failed to restore main checkout: {}", e),
        }
    }
}

/// Run libgit2 work off the async worker threads.
async fn blocking<F, R>(f: F) -> FlowResult<R>
where
    F: FnOnce() -> FlowResult<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FlowError::Vcs(format!("git task failed: {}", e)))?
}

fn dirty(checkout: &Path, include_untracked: bool) -> FlowResult<bool> {
    let repo = Repository::open(checkout)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(include_untracked)
        .recurse_untracked_dirs(include_untracked)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(!statuses.is_empty())
}

fn commit_everything(checkout: &Path, message: &str) -> FlowResult<Option<String>> {
    let repo = Repository::open(checkout)?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("forgeflow", "forgeflow@localhost"))?;
    let parents: Vec<_> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(Some(oid.to_string()))
}

#[async_trait]
impl Vcs for GitVcs {
    async fn resolve(&self, reference: &str) -> FlowResult<String> {
        self.git(
            &self.repo_root,
            &["rev-parse", "--verify", &format!("{}^{{commit}}", reference)],
        )
        .await
    }

    async fn create_worktree(&self, path: &Path, branch: &str, base_ref: &str) -> FlowResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| FlowError::Vcs("Worktree path contains invalid UTF-8".into()))?;
        self.git(
            &self.repo_root,
            &["worktree", "add", "-b", branch, path_str, base_ref],
        )
        .await?;
        Ok(())
    }

    async fn is_dirty(&self, checkout: &Path) -> FlowResult<bool> {
        let checkout = checkout.to_path_buf();
        blocking(move || dirty(&checkout, true)).await
    }

    async fn commit_all(&self, checkout: &Path, message: &str) -> FlowResult<Option<String>> {
        let checkout = checkout.to_path_buf();
        let message = message.to_string();
        blocking(move || commit_everything(&checkout, &message)).await
    }

    async fn merge_no_ff(&self, trunk: &str, branch: &str, message: &str) -> FlowResult<String> {
        let merge_failed = |message: String| FlowError::MergeFailed {
            branch: branch.to_string(),
            trunk: trunk.to_string(),
            message,
        };

        // Untracked files in the main checkout only matter if the merge would
        // overwrite them, and git refuses that on its own.
        let root = self.repo_root.clone();
        if blocking(move || dirty(&root, false)).await? {
            return Err(merge_failed(
                "trunk checkout has uncommitted changes".to_string(),
            ));
        }
        let previous = self
            .checkout_trunk(trunk)
            .await
            .map_err(|e| merge_failed(e.to_string()))?;

        let merged = match self
            .git(&self.repo_root, &["merge", "--no-ff", "-m", message, branch])
            .await
        {
            Ok(_) => self.git(&self.repo_root, &["rev-parse", "HEAD"]).await,
            Err(e) => {
                if let Err(abort_err) = self.git(&self.repo_root, &["merge", "--abort"]).await {
                    tracing::error!(%branch, %trunk, "merge --abort failed: {}", abort_err);
                }
                Err(merge_failed(e.to_string()))
            }
        };
        self.restore_checkout(previous).await;
        merged
    }

    async fn reset_trunk(&self, trunk: &str, sha: &str) -> FlowResult<()> {
        if self.current_branch().await? == trunk {
            self.git(&self.repo_root, &["reset", "--hard", sha]).await?;
        } else {
            // Trunk is not checked out; move the ref without touching the checkout.
            self.git(&self.repo_root, &["branch", "-f", trunk, sha]).await?;
        }
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path, force: bool) -> FlowResult<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| FlowError::Vcs("Worktree path contains invalid UTF-8".into()))?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str);
        self.git(&self.repo_root, &args).await?;
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> FlowResult<()> {
        self.git(&self.repo_root, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn prune_worktrees(&self) -> FlowResult<()> {
        self.git(&self.repo_root, &["worktree", "prune"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::testing::init_repo;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (GitVcs, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let vcs = GitVcs::new(dir.path()).unwrap();
        (vcs, dir)
    }

    #[test]
    fn test_new_rejects_non_repo() {
        let dir = tempdir().unwrap();
        assert!(matches!(GitVcs::new(dir.path()), Err(FlowError::Vcs(_))));
    }

    #[test]
    fn test_ensure_excluded_is_idempotent() {
        let (vcs, dir) = setup();
        vcs.ensure_excluded(".forge/").unwrap();
        vcs.ensure_excluded(".forge/").unwrap();
        let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.lines().filter(|l| *l == ".forge/").count(), 1);
    }

    #[tokio::test]
    async fn test_forge_dir_does_not_dirty_trunk() {
        let (vcs, dir) = setup();
        fs::create_dir_all(dir.path().join(".forge/artifacts")).unwrap();
        fs::write(dir.path().join(".forge/forgeflow.db"), "x").unwrap();
        assert!(!vcs.is_dirty(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_trunk() {
        let (vcs, _dir) = setup();
        let sha = vcs.resolve("main").await.unwrap();
        assert_eq!(sha.len(), 40);
        assert!(vcs.resolve("no-such-branch").await.is_err());
    }

    #[tokio::test]
    async fn test_worktree_commit_and_dirty() {
        let (vcs, dir) = setup();
        let wt = dir.path().join(".forge/worktrees/run-1-implement");
        vcs.create_worktree(&wt, "forgeflow/run-1", "main")
            .await
            .unwrap();
        assert!(wt.join("README.md").exists());
        assert!(!vcs.is_dirty(&wt).await.unwrap());

        fs::write(wt.join("lib.rs"), "pub fn f() {}\n").unwrap();
        assert!(vcs.is_dirty(&wt).await.unwrap());

        let sha = vcs.commit_all(&wt, "add lib").await.unwrap();
        assert!(sha.is_some());
        assert!(!vcs.is_dirty(&wt).await.unwrap());
        assert_eq!(vcs.commit_all(&wt, "noop").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worktrees_commit_concurrently() {
        let (vcs, dir) = setup();
        let a = dir.path().join(".forge/wt-a");
        let b = dir.path().join(".forge/wt-b");
        vcs.create_worktree(&a, "forgeflow/run-10", "main")
            .await
            .unwrap();
        vcs.create_worktree(&b, "forgeflow/run-11", "main")
            .await
            .unwrap();
        fs::write(a.join("a.txt"), "a\n").unwrap();
        fs::write(b.join("b.txt"), "b\n").unwrap();

        let (ca, cb) = tokio::join!(vcs.commit_all(&a, "a"), vcs.commit_all(&b, "b"));
        assert!(ca.unwrap().is_some());
        assert!(cb.unwrap().is_some());
        let (da, db, root) = tokio::join!(vcs.is_dirty(&a), vcs.is_dirty(&b), vcs.is_dirty(dir.path()));
        assert!(!da.unwrap() && !db.unwrap() && !root.unwrap());
    }

    #[tokio::test]
    async fn test_commit_all_records_deletions() {
        let (vcs, dir) = setup();
        let wt = dir.path().join(".forge/wt");
        vcs.create_worktree(&wt, "forgeflow/run-2", "main")
            .await
            .unwrap();
        fs::remove_file(wt.join("README.md")).unwrap();
        assert!(vcs.commit_all(&wt, "remove readme").await.unwrap().is_some());
        assert!(!vcs.is_dirty(&wt).await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_no_ff_creates_merge_commit() {
        let (vcs, dir) = setup();
        let wt = dir.path().join(".forge/wt");
        vcs.create_worktree(&wt, "forgeflow/run-3", "main")
            .await
            .unwrap();
        fs::write(wt.join("feature.txt"), "feature\n").unwrap();
        vcs.commit_all(&wt, "feature").await.unwrap();

        // A fast-forward would be possible here; --no-ff must still create a merge commit.
        let before = vcs.resolve("main").await.unwrap();
        let merge = vcs
            .merge_no_ff("main", "forgeflow/run-3", "Merge run-3")
            .await
            .unwrap();
        assert_ne!(merge, before);

        let repo = Repository::open(dir.path()).unwrap();
        let commit = repo
            .find_commit(git2::Oid::from_str(&merge).unwrap())
            .unwrap();
        assert_eq!(commit.parent_count(), 2);
        assert_eq!(commit.parent_id(0).unwrap().to_string(), before);
        assert!(dir.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn test_conflicting_merge_leaves_trunk_untouched() {
        let (vcs, dir) = setup();
        let wt = dir.path().join(".forge/wt");
        vcs.create_worktree(&wt, "forgeflow/run-4", "main")
            .await
            .unwrap();
        fs::write(wt.join("README.md"), "branch version\n").unwrap();
        vcs.commit_all(&wt, "branch edit").await.unwrap();

        fs::write(dir.path().join("README.md"), "trunk version\n").unwrap();
        vcs.commit_all(dir.path(), "trunk edit").await.unwrap();
        let before = vcs.resolve("main").await.unwrap();

        let err = vcs
            .merge_no_ff("main", "forgeflow/run-4", "Merge run-4")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::MergeFailed { .. }));
        assert_eq!(vcs.resolve("main").await.unwrap(), before);
        assert!(!vcs.is_dirty(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_restores_checked_out_branch() {
        let (vcs, dir) = setup();
        let wt = dir.path().join(".forge/wt");
        vcs.create_worktree(&wt, "forgeflow/run-6", "main")
            .await
            .unwrap();
        fs::write(wt.join("feature.txt"), "feature\n").unwrap();
        vcs.commit_all(&wt, "feature").await.unwrap();
        vcs.git(dir.path(), &["checkout", "-b", "topic"])
            .await
            .unwrap();

        let merge = vcs
            .merge_no_ff("main", "forgeflow/run-6", "Merge run-6")
            .await
            .unwrap();
        assert_eq!(vcs.resolve("main").await.unwrap(), merge);
        assert_eq!(vcs.current_branch().await.unwrap(), "topic");
        assert!(!dir.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn test_reset_trunk_leaves_other_checkout_alone() {
        let (vcs, dir) = setup();
        let before = vcs.resolve("main").await.unwrap();
        fs::write(dir.path().join("extra.txt"), "extra\n").unwrap();
        vcs.commit_all(dir.path(), "extra").await.unwrap();
        vcs.git(dir.path(), &["checkout", "-b", "topic"])
            .await
            .unwrap();

        vcs.reset_trunk("main", &before).await.unwrap();
        assert_eq!(vcs.resolve("main").await.unwrap(), before);
        assert_eq!(vcs.current_branch().await.unwrap(), "topic");
        assert!(dir.path().join("extra.txt").exists());
    }

    #[tokio::test]
    async fn test_remove_worktree_and_branch() {
        let (vcs, dir) = setup();
        let wt = dir.path().join(".forge/wt");
        vcs.create_worktree(&wt, "forgeflow/run-5", "main")
            .await
            .unwrap();
        fs::write(wt.join("scratch.txt"), "x").unwrap();

        assert!(vcs.remove_worktree(&wt, false).await.is_err());
        vcs.remove_worktree(&wt, true).await.unwrap();
        assert!(!wt.exists());
        vcs.delete_branch("forgeflow/run-5").await.unwrap();
        assert!(vcs.resolve("forgeflow/run-5").await.is_err());
    }
}
