use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{ApprovalGate, DecisionRequest};
use crate::errors::{FlowError, FlowResult};
use crate::models::{Decision, RunId};
use crate::phase::PhaseKind;

/// One line of `.forge/audit/decisions.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub run_id: RunId,
    pub phase: PhaseKind,
    pub attempt: u32,
    pub artifact_id: String,
    pub decision: Decision,
    pub decided_at: DateTime<Utc>,
}

/// Read every entry of a decision log, oldest first.
pub fn read_decision_log(path: &Path) -> anyhow::Result<Vec<DecisionLogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).context("Failed to read decision log")?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Malformed decision log entry"))
        .collect()
}

/// Wraps a gate and appends every decision it returns to a JSONL log.
pub struct AuditedGate<G> {
    inner: G,
    log_file: PathBuf,
}

impl<G: ApprovalGate> AuditedGate<G> {
    pub fn new(inner: G, log_file: &Path) -> Self {
        Self {
            inner,
            log_file: log_file.to_path_buf(),
        }
    }

    async fn append(&self, entry: &DecisionLogEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let log_file = self.log_file.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if let Some(parent) = log_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .context("Failed to open decision log")?
                .write_all(line.as_bytes())
                .context("Failed to write decision log entry")?;
            Ok(())
        })
        .await
        .context("Decision log task failed")?
    }
}

#[async_trait]
impl<G: ApprovalGate> ApprovalGate for AuditedGate<G> {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision> {
        let run_id = request.run_id;
        let phase = request.phase;
        let attempt = request.attempt;
        let artifact_id = request.artifact_id.clone();

        let decision = self.inner.request_decision(request).await?;
        let entry = DecisionLogEntry {
            run_id,
            phase,
            attempt,
            artifact_id,
            decision: decision.clone(),
            decided_at: Utc::now(),
        };
        self.append(&entry).await.map_err(FlowError::Storage)?;
        tracing::info!(run = %run_id, %phase, attempt, decision = %decision.kind, "decision recorded");
        Ok(decision)
    }
}
