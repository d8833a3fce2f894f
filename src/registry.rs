//! Durable record of every workflow run.
//!
//! The registry is the only place run state lives between processes; the
//! phase controller reloads a run from here before every step.

use crate::db::DbHandle;
use crate::errors::{FlowError, FlowResult};
use crate::models::{RunId, RunStatus, WorkflowRun};

#[derive(Clone)]
pub struct RunRegistry {
    db: DbHandle,
}

impl RunRegistry {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Register a new run, ACTIVE at RESEARCH with no records.
    pub async fn create_run(&self, task: &str) -> FlowResult<WorkflowRun> {
        let task = task.trim().to_string();
        if task.is_empty() {
            return Err(FlowError::Other(anyhow::anyhow!(
                "Task description must not be empty"
            )));
        }
        let run = self
            .db
            .call(move |db| db.insert_run(&task))
            .await
            .map_err(FlowError::Storage)?;
        tracing::info!(run = %run.id, task = %run.task, "run created");
        Ok(run)
    }

    pub async fn get(&self, id: RunId) -> FlowResult<WorkflowRun> {
        self.db
            .call(move |db| db.get_run(id))
            .await
            .map_err(FlowError::Storage)?
            .ok_or_else(|| FlowError::not_found("run", id))
    }

    pub async fn list(&self, status: Option<RunStatus>) -> FlowResult<Vec<WorkflowRun>> {
        self.db
            .call(move |db| db.list_runs(status))
            .await
            .map_err(FlowError::Storage)
    }

    /// Persist the run and its records. Concluded records are never rewritten.
    pub async fn save(&self, run: &WorkflowRun) -> FlowResult<()> {
        let snapshot = run.clone();
        self.db
            .call(move |db| db.save_run(&snapshot))
            .await
            .map_err(FlowError::Storage)
    }
}
