//! Task tracker integration.
//!
//! Each (run, phase) pair maps to one tracked task, labelled `phase:<kind>`
//! and `status:todo|in-progress|done`. Tracker failures never fail a run;
//! callers log them and move on.

mod jsonl;

pub use jsonl::{JsonlTracker, TrackerEntry, TrackerEvent};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::FlowResult;
use crate::models::RunId;
use crate::phase::PhaseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerStatus {
    Todo,
    InProgress,
    Done,
}

impl TrackerStatus {
    pub fn label(self) -> &'static str {
        match self {
            TrackerStatus::Todo => "status:todo",
            TrackerStatus::InProgress => "status:in-progress",
            TrackerStatus::Done => "status:done",
        }
    }
}

/// Labels for the task tracking `phase` in the given status.
pub fn labels(phase: PhaseKind, status: TrackerStatus) -> Vec<String> {
    vec![phase.label(), status.label().to_string()]
}

#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn create(
        &self,
        run_id: RunId,
        phase: PhaseKind,
        title: &str,
        status: TrackerStatus,
    ) -> FlowResult<()>;

    async fn comment(&self, run_id: RunId, phase: PhaseKind, body: &str) -> FlowResult<()>;

    async fn close(&self, run_id: RunId, phase: PhaseKind) -> FlowResult<()>;
}

/// Tracker that records nothing.
pub struct NoopTracker;

#[async_trait]
impl TaskTracker for NoopTracker {
    async fn create(&self, _: RunId, _: PhaseKind, _: &str, _: TrackerStatus) -> FlowResult<()> {
        Ok(())
    }

    async fn comment(&self, _: RunId, _: PhaseKind, _: &str) -> FlowResult<()> {
        Ok(())
    }

    async fn close(&self, _: RunId, _: PhaseKind) -> FlowResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(
            labels(PhaseKind::Validate, TrackerStatus::InProgress),
            vec!["phase:validate", "status:in-progress"]
        );
        assert_eq!(TrackerStatus::Done.label(), "status:done");
    }
}
