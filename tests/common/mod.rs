//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use async_trait::async_trait;
use git2::{Repository, RepositoryInitOptions, Signature};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use forgeflow::artifact::{ArtifactStore, SummaryPolicy};
use forgeflow::db::DbHandle;
use forgeflow::errors::{FlowError, FlowResult};
use forgeflow::flow_config::RetryPolicy;
use forgeflow::gates::{ApprovalGate, DecisionRequest};
use forgeflow::models::Decision;
use forgeflow::orchestrator::PhaseController;
use forgeflow::phase::PhaseKind;
use forgeflow::registry::RunRegistry;
use forgeflow::vcs::GitVcs;
use forgeflow::worker::{Worker, WorkerError};
use forgeflow::workspace::{TrunkLock, WorkspaceManager};

/// A repository on `main` with one commit and `.forge/` excluded.
pub fn init_repo(dir: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir, &opts).unwrap();
    std::fs::create_dir_all(repo.path().join("info")).unwrap();
    std::fs::write(repo.path().join("info/exclude"), ".forge/\n").unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }
    std::fs::write(dir.join("README.md"), "# project\n").unwrap();

    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[])
        .unwrap();
    drop(tree);
    repo
}

/// Returns a findings list for every phase. Inside a workspace it also
/// writes `<workspace>-<phase>.txt`, so parallel runs never touch the same file.
#[derive(Default)]
pub struct EchoWorker {
    pub inputs: Mutex<Vec<(PhaseKind, String)>>,
}

impl EchoWorker {
    pub fn inputs_for(&self, phase: PhaseKind) -> Vec<String> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == phase)
            .map(|(_, input)| input.clone())
            .collect()
    }
}

#[async_trait]
impl Worker for EchoWorker {
    async fn execute(
        &self,
        phase: PhaseKind,
        input: &str,
        workdir: &Path,
    ) -> Result<String, WorkerError> {
        self.inputs
            .lock()
            .unwrap()
            .push((phase, input.to_string()));
        if phase.uses_workspace() {
            let name = workdir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            std::fs::write(workdir.join(format!("{}-{}.txt", name, phase)), input)
                .map_err(|e| WorkerError::Refused(e.to_string()))?;
        }
        Ok(format!(
            "- {phase} finding one.\n- {phase} finding two.\n\n{}",
            "Supporting detail that the summary should leave out. ".repeat(40)
        ))
    }
}

/// Per-phase queues of decisions; phases without a script are approved.
#[derive(Default)]
pub struct ScriptedGate {
    script: Mutex<HashMap<PhaseKind, VecDeque<Decision>>>,
    pub requests: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedGate {
    pub fn with(script: Vec<(PhaseKind, Decision)>) -> Arc<Self> {
        let gate = Self::default();
        {
            let mut map = gate.script.lock().unwrap();
            for (phase, decision) in script {
                map.entry(phase).or_default().push_back(decision);
            }
        }
        Arc::new(gate)
    }

    pub fn approve_all() -> Arc<Self> {
        Self::with(Vec::new())
    }
}

#[async_trait]
impl ApprovalGate for ScriptedGate {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision> {
        let phase = request.phase;
        self.requests.lock().unwrap().push(request);
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&phase)
            .and_then(|q| q.pop_front());
        Ok(next.unwrap_or_else(Decision::approve))
    }
}

/// Dirties the workspace the first time INTEGRATE is put up for approval,
/// then approves.
#[derive(Default)]
pub struct MeddlingGate {
    meddled: Mutex<bool>,
}

#[async_trait]
impl ApprovalGate for MeddlingGate {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision> {
        if request.phase == PhaseKind::Integrate {
            let mut meddled = self.meddled.lock().unwrap();
            if !*meddled {
                let path = request.metadata.get("workspace").ok_or_else(|| {
                    FlowError::Other(anyhow::anyhow!("integrate request without workspace"))
                })?;
                std::fs::write(Path::new(path).join("stray.txt"), "uncommitted\n").unwrap();
                *meddled = true;
            }
        }
        Ok(Decision::approve())
    }
}

/// Walks away from the first INTEGRATE request without a verdict, as a
/// process killed at the prompt would; approves everything else.
#[derive(Default)]
pub struct WalkAwayGate {
    walked_away: Mutex<bool>,
}

#[async_trait]
impl ApprovalGate for WalkAwayGate {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision> {
        if request.phase == PhaseKind::Integrate {
            let mut walked_away = self.walked_away.lock().unwrap();
            if !*walked_away {
                *walked_away = true;
                return Err(FlowError::Other(anyhow::anyhow!("operator went away")));
            }
        }
        Ok(Decision::approve())
    }
}

pub fn controller(
    dir: &Path,
    db: DbHandle,
    gate: Arc<dyn ApprovalGate>,
    worker: Arc<dyn Worker>,
) -> PhaseController {
    let vcs = Arc::new(GitVcs::new(dir).unwrap());
    let workspaces = WorkspaceManager::new(
        db.clone(),
        vcs,
        &dir.join(".forge/worktrees"),
        "main",
        TrunkLock::new(&dir.join(".forge/trunk.lock")),
    );
    let artifacts =
        ArtifactStore::new(&dir.join(".forge/artifacts"), SummaryPolicy::default()).unwrap();
    PhaseController::new(
        RunRegistry::new(db),
        Arc::new(artifacts),
        Arc::new(workspaces),
        gate,
        worker,
        dir,
    )
    .with_retry(RetryPolicy::immediate(2))
}

/// Parents of the commit `main` points at.
pub fn trunk_parents(dir: &Path) -> usize {
    let repo = Repository::open(dir).unwrap();
    let head = repo
        .find_branch("main", git2::BranchType::Local)
        .unwrap()
        .get()
        .peel_to_commit()
        .unwrap();
    head.parent_count()
}

pub fn trunk_sha(dir: &Path) -> String {
    let repo = Repository::open(dir).unwrap();
    repo.find_branch("main", git2::BranchType::Local)
        .unwrap()
        .get()
        .peel_to_commit()
        .unwrap()
        .id()
        .to_string()
}
