//! Human approval between phases.
//!
//! A gate blocks until a human decides; there is no timeout and no
//! auto-approval. Gates keep no state across runs apart from the decision
//! log written by [`AuditedGate`].

mod audit;
mod channel;
mod terminal;

pub use audit::{AuditedGate, DecisionLogEntry, read_decision_log};
pub use channel::{ChannelGate, GateHandle, PendingDecision};
pub use terminal::TerminalGate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::FlowResult;
use crate::models::{Decision, RunId};
use crate::phase::PhaseKind;

/// What the human is asked to decide on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub run_id: RunId,
    pub task: String,
    pub phase: PhaseKind,
    pub attempt: u32,
    pub artifact_id: String,
    pub summary: String,
    /// Extra context such as the workspace branch or merge target.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision>;
}

#[cfg(test)]
pub(crate) fn sample_request(phase: PhaseKind) -> DecisionRequest {
    DecisionRequest {
        run_id: RunId(1),
        task: "add input validation".to_string(),
        phase,
        attempt: 1,
        artifact_id: format!("run-1-{}-1", phase),
        summary: "- Parser accepts empty input.\n".to_string(),
        metadata: BTreeMap::new(),
    }
}
