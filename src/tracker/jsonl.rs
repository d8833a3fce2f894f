use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{TaskTracker, TrackerStatus, labels};
use crate::errors::{FlowError, FlowResult};
use crate::models::RunId;
use crate::phase::PhaseKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    Create { title: String, labels: Vec<String> },
    Comment { body: String },
    Close { labels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub run_id: RunId,
    pub phase: PhaseKind,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TrackerEvent,
}

/// Local tracker backed by an append-only JSONL file.
pub struct JsonlTracker {
    path: PathBuf,
}

impl JsonlTracker {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn entries(&self) -> anyhow::Result<Vec<TrackerEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).context("Failed to read tracker log")?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Malformed tracker entry"))
            .collect()
    }

    async fn append(&self, run_id: RunId, phase: PhaseKind, event: TrackerEvent) -> FlowResult<()> {
        let entry = TrackerEntry {
            run_id,
            phase,
            at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| FlowError::Storage(e.into()))?;
        line.push('\n');
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> FlowResult<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?
                .write_all(line.as_bytes())?;
            Ok(())
        })
        .await
        .map_err(|e| FlowError::Storage(e.into()))?
    }
}

#[async_trait]
impl TaskTracker for JsonlTracker {
    async fn create(
        &self,
        run_id: RunId,
        phase: PhaseKind,
        title: &str,
        status: TrackerStatus,
    ) -> FlowResult<()> {
        self.append(
            run_id,
            phase,
            TrackerEvent::Create {
                title: title.to_string(),
                labels: labels(phase, status),
            },
        )
        .await
    }

    async fn comment(&self, run_id: RunId, phase: PhaseKind, body: &str) -> FlowResult<()> {
        self.append(
            run_id,
            phase,
            TrackerEvent::Comment {
                body: body.to_string(),
            },
        )
        .await
    }

    async fn close(&self, run_id: RunId, phase: PhaseKind) -> FlowResult<()> {
        self.append(
            run_id,
            phase,
            TrackerEvent::Close {
                labels: labels(phase, TrackerStatus::Done),
            },
        )
        .await
    }
}
