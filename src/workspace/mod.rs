//! Isolated worktrees per run and their reconciliation into trunk.
//!
//! Workspaces move through `creating → active → merging → reclaimed`. Trunk
//! is only touched while a workspace is `merging`, and only under the
//! trunk lock.

mod lock;

pub use lock::{TrunkGuard, TrunkLock};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::DbHandle;
use crate::errors::{FlowError, FlowResult};
use crate::models::{MergeResult, RunId, Workspace, WorkspaceState};
use crate::vcs::Vcs;

pub struct WorkspaceManager {
    db: DbHandle,
    vcs: Arc<dyn Vcs>,
    root: PathBuf,
    trunk: String,
    lock: TrunkLock,
}

impl WorkspaceManager {
    pub fn new(
        db: DbHandle,
        vcs: Arc<dyn Vcs>,
        worktrees_dir: &Path,
        trunk: &str,
        lock: TrunkLock,
    ) -> Self {
        Self {
            db,
            vcs,
            root: worktrees_dir.to_path_buf(),
            trunk: trunk.to_string(),
            lock,
        }
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn find(&self, name: &str) -> FlowResult<Option<Workspace>> {
        let name = name.to_string();
        self.db
            .call(move |db| db.get_workspace(&name))
            .await
            .map_err(FlowError::Storage)
    }

    pub async fn get(&self, name: &str) -> FlowResult<Workspace> {
        self.find(name)
            .await?
            .ok_or_else(|| FlowError::not_found("workspace", name))
    }

    pub async fn list(&self) -> FlowResult<Vec<Workspace>> {
        self.db
            .call(|db| db.list_workspaces())
            .await
            .map_err(FlowError::Storage)
    }

    async fn save(&self, ws: &mut Workspace, state: WorkspaceState) -> FlowResult<()> {
        ws.state = state;
        ws.updated_at = Utc::now();
        let snapshot = ws.clone();
        self.db
            .call(move |db| db.upsert_workspace(&snapshot))
            .await
            .map_err(FlowError::Storage)
    }

    /// Create the workspace `name` for `run_id` on a new `branch` from `base_ref`.
    ///
    /// Idempotent: a workspace that is not yet reclaimed is returned as is.
    /// A reclaimed name cannot be reused.
    pub async fn create(
        &self,
        run_id: RunId,
        name: &str,
        branch: &str,
        base_ref: &str,
    ) -> FlowResult<Workspace> {
        let existing = self.find(name).await?;
        let mut ws = match existing {
            Some(ws) if ws.state == WorkspaceState::Reclaimed => {
                return Err(FlowError::already_exists("workspace", name));
            }
            Some(mut ws) if ws.state == WorkspaceState::Creating => {
                // Interrupted creation: finish it if the worktree made it to disk.
                if ws.path.exists() {
                    self.save(&mut ws, WorkspaceState::Active).await?;
                    return Ok(ws);
                }
                self.vcs.prune_worktrees().await?;
                ws
            }
            Some(ws) => return Ok(ws),
            None => {
                let base_sha = self.vcs.resolve(base_ref).await?;
                let now = Utc::now();
                let mut ws = Workspace {
                    name: name.to_string(),
                    run_id,
                    branch: branch.to_string(),
                    path: self.path_for(name),
                    base_ref: base_sha,
                    state: WorkspaceState::Creating,
                    merge: None,
                    created_at: now,
                    updated_at: now,
                };
                self.save(&mut ws, WorkspaceState::Creating).await?;
                ws
            }
        };

        self.vcs
            .create_worktree(&ws.path, &ws.branch, &ws.base_ref)
            .await?;
        self.save(&mut ws, WorkspaceState::Active).await?;
        tracing::info!(workspace = %ws.name, branch = %ws.branch, "workspace created");
        Ok(ws)
    }

    pub async fn is_dirty(&self, ws: &Workspace) -> FlowResult<bool> {
        self.vcs.is_dirty(&ws.path).await
    }

    pub async fn commit_all(&self, ws: &Workspace, message: &str) -> FlowResult<Option<String>> {
        let sha = self.vcs.commit_all(&ws.path, message).await?;
        if let Some(sha) = &sha {
            tracing::debug!(workspace = %ws.name, %sha, "committed workspace changes");
        }
        Ok(sha)
    }

    /// Merge the workspace branch into trunk with a merge commit, then
    /// remove the worktree and branch.
    ///
    /// Fails with `DirtyWorkspace` if there are uncommitted changes. Any
    /// failure before the worktree is gone restores trunk to its previous
    /// head and leaves the workspace active. Merging a workspace whose
    /// branch already landed returns the recorded result, finishing the
    /// teardown if it was interrupted.
    pub async fn merge(&self, name: &str) -> FlowResult<MergeResult> {
        let mut ws = self.get(name).await?;
        match (ws.state, ws.merge.clone()) {
            (WorkspaceState::Reclaimed, Some(done)) => {
                tracing::info!(workspace = %ws.name, merge_commit = %done.merge_commit, "workspace already merged");
                return Ok(done);
            }
            (WorkspaceState::Reclaimed, None) => {
                return Err(FlowError::not_found("active workspace", name));
            }
            (WorkspaceState::Merging, Some(done)) => {
                tracing::info!(workspace = %ws.name, "finishing interrupted merge");
                if ws.path.exists() {
                    self.vcs
                        .remove_worktree(&ws.path, false)
                        .await
                        .map_err(|e| FlowError::MergeFailed {
                            branch: ws.branch.clone(),
                            trunk: self.trunk.clone(),
                            message: e.to_string(),
                        })?;
                } else {
                    self.vcs.prune_worktrees().await?;
                }
                return self.finish_merge(ws, done).await;
            }
            _ => {}
        }
        if self.is_dirty(&ws).await? {
            return Err(FlowError::DirtyWorkspace {
                name: name.to_string(),
            });
        }

        let _guard = self.lock.acquire().await?;
        let trunk_before = self.vcs.resolve(&self.trunk).await?;
        let message = format!("Merge {} ({})", ws.branch, ws.run_id);

        let merge_commit = match self
            .vcs
            .merge_no_ff(&self.trunk, &ws.branch, &message)
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                self.restore_trunk(&trunk_before).await;
                if ws.state != WorkspaceState::Active {
                    ws.merge = None;
                    self.save(&mut ws, WorkspaceState::Active).await?;
                }
                return Err(e);
            }
        };
        let result = MergeResult {
            workspace: ws.name.clone(),
            branch: ws.branch.clone(),
            trunk: self.trunk.clone(),
            trunk_before: trunk_before.clone(),
            merge_commit,
        };
        ws.merge = Some(result.clone());
        self.save(&mut ws, WorkspaceState::Merging).await?;

        if let Err(e) = self.vcs.remove_worktree(&ws.path, false).await {
            tracing::warn!(workspace = %ws.name, "worktree removal failed, rolling back merge");
            self.restore_trunk(&trunk_before).await;
            ws.merge = None;
            self.save(&mut ws, WorkspaceState::Active).await?;
            return Err(FlowError::MergeFailed {
                branch: ws.branch.clone(),
                trunk: self.trunk.clone(),
                message: e.to_string(),
            });
        }
        self.finish_merge(ws, result).await
    }

    async fn finish_merge(&self, mut ws: Workspace, result: MergeResult) -> FlowResult<MergeResult> {
        if let Err(e) = self.vcs.delete_branch(&ws.branch).await {
            tracing::warn!(branch = %ws.branch, "Failed to delete merged branch: {}", e);
        }
        self.save(&mut ws, WorkspaceState::Reclaimed).await?;
        tracing::info!(
            workspace = %ws.name,
            trunk = %result.trunk,
            merge_commit = %result.merge_commit,
            "workspace merged and reclaimed"
        );
        Ok(result)
    }

    async fn restore_trunk(&self, trunk_before: &str) {
        match self.vcs.resolve(&self.trunk).await {
            Ok(head) if head == trunk_before => {}
            _ => {
                if let Err(e) = self.vcs.reset_trunk(&self.trunk, trunk_before).await {
                    tracing::error!(trunk = %self.trunk, "Failed to restore trunk to {}: {}", trunk_before, e);
                }
            }
        }
    }

    /// Abandon a workspace without merging. Without `force`, uncommitted
    /// changes fail with `DirtyWorkspace`; with it they are discarded.
    pub async fn reclaim(&self, name: &str, force: bool) -> FlowResult<Workspace> {
        let mut ws = self.get(name).await?;
        if ws.state == WorkspaceState::Reclaimed {
            return Ok(ws);
        }

        if ws.path.exists() {
            if !force && self.is_dirty(&ws).await? {
                return Err(FlowError::DirtyWorkspace {
                    name: name.to_string(),
                });
            }
            self.vcs.remove_worktree(&ws.path, force).await?;
        } else {
            self.vcs.prune_worktrees().await?;
        }
        if let Err(e) = self.vcs.delete_branch(&ws.branch).await {
            tracing::warn!(branch = %ws.branch, "Failed to delete branch: {}", e);
        }
        self.save(&mut ws, WorkspaceState::Reclaimed).await?;
        tracing::info!(workspace = %ws.name, force, "workspace reclaimed");
        Ok(ws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::GitVcs;
    use crate::vcs::testing::init_repo;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        manager: WorkspaceManager,
        vcs: Arc<GitVcs>,
        run_id: RunId,
        dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let db = DbHandle::in_memory().unwrap();
        let run = db.call(|db| db.insert_run("test task")).await.unwrap();
        let vcs = Arc::new(GitVcs::new(dir.path()).unwrap());
        let manager = WorkspaceManager::new(
            db,
            vcs.clone(),
            &dir.path().join(".forge/worktrees"),
            "main",
            TrunkLock::new(&dir.path().join(".forge/trunk.lock")),
        );
        Fixture {
            manager,
            vcs,
            run_id: run.id,
            dir,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let f = fixture().await;
        let a = f
            .manager
            .create(f.run_id, "run-1-implement", "forgeflow/run-1", "main")
            .await
            .unwrap();
        assert_eq!(a.state, WorkspaceState::Active);
        assert!(a.path.join("README.md").exists());

        let b = f
            .manager
            .create(f.run_id, "run-1-implement", "forgeflow/run-1", "main")
            .await
            .unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(f.manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_after_reclaim_fails() {
        let f = fixture().await;
        f.manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        f.manager.reclaim("ws", false).await.unwrap();
        let err = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_merge_creates_merge_commit_and_reclaims() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::write(ws.path.join("validate.rs"), "fn validate() {}\n").unwrap();
        f.manager.commit_all(&ws, "implement").await.unwrap();

        let result = f.manager.merge("ws").await.unwrap();
        assert_ne!(result.merge_commit, result.trunk_before);
        assert_eq!(f.vcs.resolve("main").await.unwrap(), result.merge_commit);
        assert!(f.dir.path().join("validate.rs").exists());
        assert!(!ws.path.exists());
        assert!(f.vcs.resolve("forgeflow/ws").await.is_err());

        let ws = f.manager.get("ws").await.unwrap();
        assert_eq!(ws.state, WorkspaceState::Reclaimed);
    }

    #[tokio::test]
    async fn test_merge_again_returns_recorded_result() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::write(ws.path.join("validate.rs"), "fn validate() {}\n").unwrap();
        f.manager.commit_all(&ws, "implement").await.unwrap();

        let first = f.manager.merge("ws").await.unwrap();
        let second = f.manager.merge("ws").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.vcs.resolve("main").await.unwrap(), first.merge_commit);
        assert_eq!(
            f.manager.get("ws").await.unwrap().merge,
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_merge_finishes_interrupted_teardown() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::write(ws.path.join("validate.rs"), "fn validate() {}\n").unwrap();
        f.manager.commit_all(&ws, "implement").await.unwrap();

        // Trunk got the merge commit but the process stopped before teardown.
        let trunk_before = f.vcs.resolve("main").await.unwrap();
        let merge_commit = f
            .vcs
            .merge_no_ff("main", "forgeflow/ws", "Merge forgeflow/ws")
            .await
            .unwrap();
        let mut stalled = f.manager.get("ws").await.unwrap();
        stalled.merge = Some(MergeResult {
            workspace: "ws".into(),
            branch: "forgeflow/ws".into(),
            trunk: "main".into(),
            trunk_before,
            merge_commit: merge_commit.clone(),
        });
        f.manager
            .save(&mut stalled, WorkspaceState::Merging)
            .await
            .unwrap();

        let result = f.manager.merge("ws").await.unwrap();
        assert_eq!(result.merge_commit, merge_commit);
        assert_eq!(f.vcs.resolve("main").await.unwrap(), merge_commit);
        assert!(!ws.path.exists());
        assert_eq!(
            f.manager.get("ws").await.unwrap().state,
            WorkspaceState::Reclaimed
        );
    }

    #[tokio::test]
    async fn test_merge_abandoned_workspace_fails() {
        let f = fixture().await;
        f.manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        f.manager.reclaim("ws", false).await.unwrap();
        let err = f.manager.merge("ws").await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_merge_dirty_workspace_leaves_trunk_unchanged() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::write(ws.path.join("wip.txt"), "uncommitted").unwrap();
        let before = f.vcs.resolve("main").await.unwrap();

        let err = f.manager.merge("ws").await.unwrap_err();
        assert!(matches!(err, FlowError::DirtyWorkspace { .. }));
        assert_eq!(f.vcs.resolve("main").await.unwrap(), before);
        assert_eq!(
            f.manager.get("ws").await.unwrap().state,
            WorkspaceState::Active
        );
        assert!(ws.path.join("wip.txt").exists());
    }

    #[tokio::test]
    async fn test_conflicting_merge_keeps_workspace_active() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::write(ws.path.join("README.md"), "branch\n").unwrap();
        f.manager.commit_all(&ws, "branch edit").await.unwrap();
        fs::write(f.dir.path().join("README.md"), "trunk\n").unwrap();
        f.vcs.commit_all(f.dir.path(), "trunk edit").await.unwrap();
        let before = f.vcs.resolve("main").await.unwrap();

        let err = f.manager.merge("ws").await.unwrap_err();
        assert!(matches!(err, FlowError::MergeFailed { .. }));
        assert_eq!(f.vcs.resolve("main").await.unwrap(), before);
        assert_eq!(
            f.manager.get("ws").await.unwrap().state,
            WorkspaceState::Active
        );
        assert!(ws.path.exists());
    }

    #[tokio::test]
    async fn test_reclaim_respects_force() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::write(ws.path.join("scratch.txt"), "x").unwrap();

        let err = f.manager.reclaim("ws", false).await.unwrap_err();
        assert!(matches!(err, FlowError::DirtyWorkspace { .. }));
        assert!(ws.path.exists());

        let reclaimed = f.manager.reclaim("ws", true).await.unwrap();
        assert_eq!(reclaimed.state, WorkspaceState::Reclaimed);
        assert!(!ws.path.exists());
    }

    #[tokio::test]
    async fn test_reclaim_after_manual_delete() {
        let f = fixture().await;
        let ws = f
            .manager
            .create(f.run_id, "ws", "forgeflow/ws", "main")
            .await
            .unwrap();
        fs::remove_dir_all(&ws.path).unwrap();
        let reclaimed = f.manager.reclaim("ws", false).await.unwrap();
        assert_eq!(reclaimed.state, WorkspaceState::Reclaimed);
    }

    #[tokio::test]
    async fn test_get_unknown_workspace() {
        let f = fixture().await;
        let err = f.manager.get("nope").await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound { .. }));
    }
}
