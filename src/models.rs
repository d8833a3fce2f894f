//! Domain types shared by the registry, workspace manager and controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::phase::PhaseKind;

/// Identity of a workflow run, displayed as `run-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("run-").unwrap_or(s);
        let id: i64 = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid run id '{}'. Expected run-<n> or <n>", s))?;
        Ok(RunId(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Active)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RunStatus::Active),
            "completed" => Ok(RunStatus::Completed),
            "aborted" => Ok(RunStatus::Aborted),
            _ => anyhow::bail!(
                "Invalid run status '{}'. Valid values: active, completed, aborted",
                s
            ),
        }
    }
}

/// Why a run left ACTIVE without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Rejected { phase: PhaseKind },
    RevisionLimit { phase: PhaseKind, revisions: u32 },
    WorkerFailure { phase: PhaseKind, message: String },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Rejected { phase } => write!(f, "rejected at {}", phase),
            AbortReason::RevisionLimit { phase, revisions } => {
                write!(f, "revision limit ({}) reached at {}", revisions, phase)
            }
            AbortReason::WorkerFailure { phase, message } => {
                write!(f, "worker failure at {}: {}", phase, message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Revise,
    Reject,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::Approve => write!(f, "APPROVE"),
            DecisionKind::Revise => write!(f, "REVISE"),
            DecisionKind::Reject => write!(f, "REJECT"),
        }
    }
}

/// Human verdict on a phase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    #[serde(default)]
    pub notes: String,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            kind: DecisionKind::Approve,
            notes: String::new(),
        }
    }

    pub fn revise(notes: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Revise,
            notes: notes.into(),
        }
    }

    pub fn reject(notes: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Reject,
            notes: notes.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    AwaitingApproval,
    Approved,
    ReviseRequested,
    Rejected,
    /// Worker retries exhausted or the invocation was cancelled.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::AwaitingApproval => "awaiting_approval",
            RecordStatus::Approved => "approved",
            RecordStatus::ReviseRequested => "revise_requested",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Failed => "failed",
        }
    }

    /// A concluded record is never written again.
    pub fn is_concluded(&self) -> bool {
        !matches!(self, RecordStatus::Pending | RecordStatus::AwaitingApproval)
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "awaiting_approval" => Ok(RecordStatus::AwaitingApproval),
            "approved" => Ok(RecordStatus::Approved),
            "revise_requested" => Ok(RecordStatus::ReviseRequested),
            "rejected" => Ok(RecordStatus::Rejected),
            "failed" => Ok(RecordStatus::Failed),
            _ => anyhow::bail!("Invalid phase record status '{}'", s),
        }
    }
}

/// One attempt at one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseKind,
    /// 1-based; a REVISE opens attempt n+1.
    pub attempt: u32,
    pub status: RecordStatus,
    pub artifact_id: Option<String>,
    pub decision: Option<Decision>,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    pub fn begin(phase: PhaseKind, attempt: u32) -> Self {
        Self {
            phase,
            attempt,
            status: RecordStatus::Pending,
            artifact_id: None,
            decision: None,
            failure: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn conclude(&mut self, status: RecordStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub task: String,
    pub records: Vec<PhaseRecord>,
    pub current_phase: PhaseKind,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn last_record(&self) -> Option<&PhaseRecord> {
        self.records.last()
    }

    pub fn last_record_mut(&mut self) -> Option<&mut PhaseRecord> {
        self.records.last_mut()
    }

    pub fn records_for(&self, phase: PhaseKind) -> impl Iterator<Item = &PhaseRecord> {
        self.records.iter().filter(move |r| r.phase == phase)
    }

    /// The approved attempt of a phase, if any.
    pub fn approved_record(&self, phase: PhaseKind) -> Option<&PhaseRecord> {
        self.records_for(phase)
            .find(|r| r.status == RecordStatus::Approved)
    }

    /// Notes of every REVISE decision taken on this phase, in order.
    pub fn revision_notes(&self, phase: PhaseKind) -> Vec<String> {
        self.records_for(phase)
            .filter(|r| r.status == RecordStatus::ReviseRequested)
            .filter_map(|r| r.decision.as_ref().map(|d| d.notes.clone()))
            .collect()
    }

    pub fn revision_count(&self, phase: PhaseKind) -> u32 {
        self.records_for(phase)
            .filter(|r| r.status == RecordStatus::ReviseRequested)
            .count() as u32
    }

    /// Attempt number for the next execution of the current phase.
    pub fn next_attempt(&self) -> u32 {
        self.records_for(self.current_phase)
            .map(|r| r.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Creating,
    Active,
    Merging,
    Reclaimed,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Creating => "creating",
            WorkspaceState::Active => "active",
            WorkspaceState::Merging => "merging",
            WorkspaceState::Reclaimed => "reclaimed",
        }
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkspaceState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(WorkspaceState::Creating),
            "active" => Ok(WorkspaceState::Active),
            "merging" => Ok(WorkspaceState::Merging),
            "reclaimed" => Ok(WorkspaceState::Reclaimed),
            _ => anyhow::bail!("Invalid workspace state '{}'", s),
        }
    }
}

/// An isolated worktree owned by exactly one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub run_id: RunId,
    pub branch: String,
    pub path: PathBuf,
    pub base_ref: String,
    pub state: WorkspaceState,
    /// Set once the branch has landed on trunk.
    #[serde(default)]
    pub merge: Option<MergeResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of reconciling a workspace into trunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub workspace: String,
    pub branch: String,
    pub trunk: String,
    pub trunk_before: String,
    pub merge_commit: String,
}

/// Workspace name for a run; stable across restarts.
pub fn workspace_name(run_id: RunId) -> String {
    format!("{}-implement", run_id)
}

/// Branch name for a run's workspace, e.g. `forgeflow/run-7-add-input-validation`.
pub fn workspace_branch(run_id: RunId, task: &str) -> String {
    let slug = slugify(task, 40);
    if slug.is_empty() {
        format!("forgeflow/{}", run_id)
    } else {
        format!("forgeflow/{}-{}", run_id, slug)
    }
}

/// Lowercase, dash-separated, at most `max_len` bytes.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}
