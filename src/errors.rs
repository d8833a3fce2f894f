//! Typed error hierarchy for the forgeflow core.
//!
//! `FlowError` is the single taxonomy shared by the registry, artifact store,
//! workspace manager and phase controller. Structural variants
//! (`DirtyWorkspace`, `AlreadyExists`) are surfaced to the caller as-is and
//! never retried; only worker errors go through the retry policy.

use thiserror::Error;

use crate::phase::PhaseKind;

pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Worker failed in {phase} after {attempts} attempt(s): {message}")]
    WorkerFailure {
        phase: PhaseKind,
        attempts: u32,
        message: String,
    },

    #[error("Workspace {name} has uncommitted changes")]
    DirtyWorkspace { name: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Run {run} was rejected at {phase}")]
    Rejected { run: String, phase: PhaseKind },

    #[error("Run {run} is already being advanced")]
    RunBusy { run: String },

    #[error("Run {run} is not active")]
    RunNotActive { run: String },

    #[error("Merge of {branch} into {trunk} failed: {message}")]
    MergeFailed {
        branch: String,
        trunk: String,
        message: String,
    },

    #[error("Artifact {id} failed digest verification")]
    Corrupt { id: String },

    #[error("Git error: {0}")]
    Vcs(String),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        FlowError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        FlowError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    /// Structural errors block progress until a human intervenes.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FlowError::DirtyWorkspace { .. } | FlowError::AlreadyExists { .. }
        )
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(e: rusqlite::Error) -> Self {
        FlowError::Storage(e.into())
    }
}

impl From<std::io::Error> for FlowError {
    fn from(e: std::io::Error) -> Self {
        FlowError::Storage(e.into())
    }
}

impl From<git2::Error> for FlowError {
    fn from(e: git2::Error) -> Self {
        FlowError::Vcs(e.message().to_string())
    }
}
