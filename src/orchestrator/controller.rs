use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::input::build_worker_input;
use crate::artifact::{ArtifactKey, ArtifactStore};
use crate::errors::{FlowError, FlowResult};
use crate::flow_config::RetryPolicy;
use crate::gates::{ApprovalGate, DecisionRequest};
use crate::models::{
    AbortReason, Decision, DecisionKind, PhaseRecord, RecordStatus, RunId, RunStatus,
    WorkflowRun, Workspace, WorkspaceState, workspace_branch, workspace_name,
};
use crate::phase::PhaseKind;
use crate::registry::RunRegistry;
use crate::tracker::{NoopTracker, TaskTracker, TrackerStatus};
use crate::worker::{Worker, invoke_with_retry};
use crate::workspace::WorkspaceManager;

/// Outcome of one pass through the current phase.
enum Step {
    /// The phase must run again (a revision was requested).
    Again,
    /// The phase was approved or the run left ACTIVE.
    Settled,
}

/// Drives runs through RESEARCH → PLAN → IMPLEMENT → VALIDATE → INTEGRATE.
///
/// The controller is the only writer of run state. Every step reloads the
/// run from the registry and persists before returning, so a new process
/// can pick up any run where the last one stopped.
pub struct PhaseController {
    registry: RunRegistry,
    artifacts: Arc<ArtifactStore>,
    workspaces: Arc<WorkspaceManager>,
    gate: Arc<dyn ApprovalGate>,
    worker: Arc<dyn Worker>,
    tracker: Arc<dyn TaskTracker>,
    retry: RetryPolicy,
    max_revisions: u32,
    project_dir: PathBuf,
    in_flight: Mutex<HashSet<RunId>>,
}

/// Marks a run as being advanced; released on drop.
struct RunLease<'a> {
    in_flight: &'a Mutex<HashSet<RunId>>,
    run_id: RunId,
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}

impl PhaseController {
    pub fn new(
        registry: RunRegistry,
        artifacts: Arc<ArtifactStore>,
        workspaces: Arc<WorkspaceManager>,
        gate: Arc<dyn ApprovalGate>,
        worker: Arc<dyn Worker>,
        project_dir: &Path,
    ) -> Self {
        Self {
            registry,
            artifacts,
            workspaces,
            gate,
            worker,
            tracker: Arc::new(NoopTracker),
            retry: RetryPolicy::default(),
            max_revisions: 3,
            project_dir: project_dir.to_path_buf(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn TaskTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_revisions(mut self, max_revisions: u32) -> Self {
        self.max_revisions = max_revisions;
        self
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Register a new run, ACTIVE at RESEARCH.
    pub async fn start(&self, task: &str) -> FlowResult<WorkflowRun> {
        self.registry.create_run(task).await
    }

    /// Run the current phase until it is approved or the run ends.
    ///
    /// REVISE decisions re-execute the same phase inside this call. Returns
    /// the run as persisted afterwards; a rejected run comes back ABORTED.
    pub async fn advance(
        &self,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> FlowResult<WorkflowRun> {
        let _lease = self.lease(run_id)?;
        let mut run = self.registry.get(run_id).await?;
        if !run.is_active() {
            return Err(match run.abort_reason {
                Some(AbortReason::Rejected { phase }) | Some(AbortReason::RevisionLimit { phase, .. }) => {
                    FlowError::Rejected {
                        run: run_id.to_string(),
                        phase,
                    }
                }
                _ => FlowError::RunNotActive {
                    run: run_id.to_string(),
                },
            });
        }

        while let Step::Again = self.step(&mut run, cancel).await? {}
        Ok(run)
    }

    /// Advance until the run is COMPLETED or ABORTED.
    pub async fn run_to_completion(
        &self,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> FlowResult<WorkflowRun> {
        loop {
            let run = self.advance(run_id, cancel).await?;
            if !run.is_active() {
                return Ok(run);
            }
        }
    }

    fn lease(&self, run_id: RunId) -> FlowResult<RunLease<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(run_id) {
            return Err(FlowError::RunBusy {
                run: run_id.to_string(),
            });
        }
        Ok(RunLease {
            in_flight: &self.in_flight,
            run_id,
        })
    }

    /// Pick up the current phase from its last record.
    async fn step(&self, run: &mut WorkflowRun, cancel: &CancellationToken) -> FlowResult<Step> {
        let phase = run.current_phase;
        let last = run.records_for(phase).last().map(|r| r.status);
        match last {
            None | Some(RecordStatus::ReviseRequested) => {
                self.open_attempt(run).await?;
                self.execute(run, cancel).await?;
                self.decide(run, cancel).await
            }
            Some(RecordStatus::Pending) => {
                tracing::info!(run = %run.id, %phase, "resuming interrupted phase");
                self.execute(run, cancel).await?;
                self.decide(run, cancel).await
            }
            Some(RecordStatus::AwaitingApproval) => self.decide(run, cancel).await,
            Some(RecordStatus::Approved) => {
                self.move_past(run, phase);
                self.registry.save(run).await?;
                Ok(Step::Settled)
            }
            Some(RecordStatus::Rejected) | Some(RecordStatus::Failed) => {
                // The record concluded but the run did not; finish the abort.
                let reason = match run.records_for(phase).last() {
                    Some(r) if r.status == RecordStatus::Failed => AbortReason::WorkerFailure {
                        phase,
                        message: r.failure.clone().unwrap_or_default(),
                    },
                    _ => AbortReason::Rejected { phase },
                };
                self.abort(run, reason).await?;
                Ok(Step::Settled)
            }
        }
    }

    async fn open_attempt(&self, run: &mut WorkflowRun) -> FlowResult<()> {
        let phase = run.current_phase;
        let attempt = run.next_attempt();
        run.records.push(PhaseRecord::begin(phase, attempt));
        run.touch();
        self.registry.save(run).await?;
        tracing::info!(run = %run.id, %phase, attempt, "phase started");

        if attempt == 1 {
            let title = format!("{} {}: {}", run.id, phase, run.task);
            self.notify(
                "create",
                self.tracker
                    .create(run.id, phase, &title, TrackerStatus::InProgress),
            )
            .await;
        }
        Ok(())
    }

    /// Produce (or recover) the artifact for the open attempt and move the
    /// record to AWAITING_APPROVAL.
    async fn execute(&self, run: &mut WorkflowRun, cancel: &CancellationToken) -> FlowResult<()> {
        let phase = run.current_phase;
        let attempt = current_record(run)?.attempt;

        let workspace = if phase.uses_workspace() {
            Some(self.workspace_for(run).await?)
        } else {
            None
        };
        let workdir = workspace
            .as_ref()
            .map(|ws| ws.path.clone())
            .unwrap_or_else(|| self.project_dir.clone());

        let key = ArtifactKey::new(run.id, phase, attempt);
        let artifact = match self.with_artifacts(move |a| a.find(key)).await? {
            Some(artifact) => {
                tracing::info!(run = %run.id, %phase, attempt, "reusing stored artifact");
                artifact
            }
            None => {
                let snapshot = run.clone();
                let input = self
                    .with_artifacts(move |a| build_worker_input(&snapshot, phase, attempt, a))
                    .await?;
                let output = match invoke_with_retry(
                    self.worker.as_ref(),
                    phase,
                    &input,
                    &workdir,
                    &self.retry,
                    cancel,
                )
                .await
                {
                    Ok(output) => output,
                    Err(e @ FlowError::WorkerFailure { .. }) => {
                        self.fail(run, &e).await?;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
                self.with_artifacts(move |a| a.store(key, &output)).await?
            }
        };

        if let Some(ws) = &workspace {
            let message = format!("forgeflow: {} attempt {}", phase, attempt);
            self.workspaces.commit_all(ws, &message).await?;
        }

        let record = current_record(run)?;
        record.artifact_id = Some(artifact.id.clone());
        record.status = RecordStatus::AwaitingApproval;
        run.touch();
        self.registry.save(run).await?;
        tracing::info!(
            run = %run.id,
            %phase,
            attempt,
            artifact = %artifact.id,
            summary_bytes = artifact.summary_bytes,
            "awaiting approval"
        );
        Ok(())
    }

    async fn workspace_for(&self, run: &WorkflowRun) -> FlowResult<Workspace> {
        let name = workspace_name(run.id);
        if run.current_phase == PhaseKind::Implement {
            let branch = workspace_branch(run.id, &run.task);
            return self
                .workspaces
                .create(run.id, &name, &branch, self.workspaces.trunk())
                .await;
        }
        let ws = self.workspaces.get(&name).await?;
        if ws.state == WorkspaceState::Reclaimed {
            return Err(FlowError::not_found("active workspace", name));
        }
        Ok(ws)
    }

    async fn decide(&self, run: &mut WorkflowRun, cancel: &CancellationToken) -> FlowResult<Step> {
        let phase = run.current_phase;
        let run_id = run.id;
        let record = current_record(run)?;
        let attempt = record.attempt;
        let artifact_id = record.artifact_id.clone().ok_or_else(|| {
            FlowError::Other(anyhow::anyhow!(
                "{} {} attempt {} has no artifact",
                run_id,
                phase,
                attempt
            ))
        })?;

        let summary = {
            let id = artifact_id.clone();
            self.with_artifacts(move |a| a.summary_of(&id)).await?
        };
        let request = DecisionRequest {
            run_id: run.id,
            task: run.task.clone(),
            phase,
            attempt,
            summary,
            artifact_id,
            metadata: self.request_metadata(run).await?,
        };
        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FlowError::Other(anyhow::anyhow!(
                    "{} cancelled while awaiting a decision on {}",
                    run.id,
                    phase
                )));
            }
            decision = self.gate.request_decision(request) => decision?,
        };

        let comment = if decision.notes.is_empty() {
            decision.kind.to_string()
        } else {
            format!("{}: {}", decision.kind, decision.notes)
        };
        self.notify("comment", self.tracker.comment(run.id, phase, &comment))
            .await;

        match decision.kind {
            DecisionKind::Approve => {
                if phase == PhaseKind::Integrate {
                    // A failed merge leaves the record awaiting approval so a
                    // resume asks again and retries the merge.
                    let merged = self.workspaces.merge(&workspace_name(run.id)).await?;
                    tracing::info!(
                        run = %run.id,
                        merge_commit = %merged.merge_commit,
                        trunk = %merged.trunk,
                        "integrated into trunk"
                    );
                }
                conclude(run, decision, RecordStatus::Approved)?;
                self.move_past(run, phase);
                self.registry.save(run).await?;
                self.notify("close", self.tracker.close(run.id, phase)).await;
                Ok(Step::Settled)
            }
            DecisionKind::Revise => {
                let revisions = run.revision_count(phase);
                if revisions >= self.max_revisions {
                    tracing::warn!(run = %run.id, %phase, revisions, "revision limit reached");
                    conclude(run, decision, RecordStatus::Rejected)?;
                    self.abort(
                        run,
                        AbortReason::RevisionLimit {
                            phase,
                            revisions: self.max_revisions,
                        },
                    )
                    .await?;
                    return Ok(Step::Settled);
                }
                conclude(run, decision, RecordStatus::ReviseRequested)?;
                run.touch();
                self.registry.save(run).await?;
                tracing::info!(run = %run.id, %phase, revision = revisions + 1, "revision requested");
                Ok(Step::Again)
            }
            DecisionKind::Reject => {
                conclude(run, decision, RecordStatus::Rejected)?;
                self.abort(run, AbortReason::Rejected { phase }).await?;
                Ok(Step::Settled)
            }
        }
    }

    async fn request_metadata(&self, run: &WorkflowRun) -> FlowResult<BTreeMap<String, String>> {
        let mut metadata = BTreeMap::new();
        let revisions = run.revision_count(run.current_phase);
        if revisions > 0 {
            metadata.insert("revisions".to_string(), revisions.to_string());
        }
        if run.current_phase.uses_workspace()
            && let Some(ws) = self.workspaces.find(&workspace_name(run.id)).await?
        {
            metadata.insert("workspace".to_string(), ws.path.display().to_string());
            metadata.insert("branch".to_string(), ws.branch);
        }
        if run.current_phase == PhaseKind::Integrate {
            metadata.insert(
                "merge_into".to_string(),
                self.workspaces.trunk().to_string(),
            );
        }
        Ok(metadata)
    }

    fn move_past(&self, run: &mut WorkflowRun, phase: PhaseKind) {
        match phase.next() {
            Some(next) => {
                run.current_phase = next;
                tracing::info!(run = %run.id, from = %phase, to = %next, "phase approved");
            }
            None => {
                run.status = RunStatus::Completed;
                tracing::info!(run = %run.id, "run completed");
            }
        }
        run.touch();
    }

    async fn abort(&self, run: &mut WorkflowRun, reason: AbortReason) -> FlowResult<()> {
        tracing::warn!(run = %run.id, %reason, "run aborted");
        run.status = RunStatus::Aborted;
        run.abort_reason = Some(reason);
        run.touch();
        self.registry.save(run).await
    }

    async fn fail(&self, run: &mut WorkflowRun, err: &FlowError) -> FlowResult<()> {
        let phase = run.current_phase;
        let message = match err {
            FlowError::WorkerFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let record = current_record(run)?;
        record.failure = Some(message.clone());
        record.conclude(RecordStatus::Failed);
        self.notify(
            "comment",
            self.tracker
                .comment(run.id, phase, &format!("FAILED: {}", message)),
        )
        .await;
        self.abort(run, AbortReason::WorkerFailure { phase, message })
            .await
    }

    /// Artifact store access does file I/O, so it runs on the blocking pool.
    async fn with_artifacts<F, R>(&self, f: F) -> FlowResult<R>
    where
        F: FnOnce(&ArtifactStore) -> FlowResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let artifacts = Arc::clone(&self.artifacts);
        tokio::task::spawn_blocking(move || f(&artifacts))
            .await
            .map_err(|e| FlowError::Other(anyhow::anyhow!("artifact task failed: {}", e)))?
    }

    /// Tracker calls are best effort.
    async fn notify(&self, action: &str, call: impl Future<Output = FlowResult<()>>) {
        if let Err(e) = call.await {
            tracing::warn!(action, "tracker call failed: {}", e);
        }
    }
}

fn current_record(run: &mut WorkflowRun) -> FlowResult<&mut PhaseRecord> {
    let id = run.id;
    let phase = run.current_phase;
    run.last_record_mut()
        .filter(|r| r.phase == phase)
        .ok_or_else(|| FlowError::Other(anyhow::anyhow!("{} has no open {} record", id, phase)))
}

fn conclude(run: &mut WorkflowRun, decision: Decision, status: RecordStatus) -> FlowResult<()> {
    let record = current_record(run)?;
    record.decision = Some(decision);
    record.conclude(status);
    Ok(())
}
