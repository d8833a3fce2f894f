use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::flow_config::FlowToml;

/// Runtime configuration for forgeflow.
///
/// Resolves the on-disk layout under `.forge/` and carries the parsed
/// `forgeflow.toml` with CLI overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub forge_dir: PathBuf,
    pub db_file: PathBuf,
    pub artifacts_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub log_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub trunk_lock_file: PathBuf,
    pub tracker_file: PathBuf,
    pub verbose: bool,
    pub flow: FlowToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let forge_dir = project_dir.join(".forge");
        let flow = FlowToml::load_or_default(&forge_dir)?;
        Ok(Self::with_flow(project_dir, verbose, flow))
    }

    /// Build from an already-loaded configuration; paths are not canonicalized.
    pub fn with_flow(project_dir: PathBuf, verbose: bool, flow: FlowToml) -> Self {
        let forge_dir = project_dir.join(".forge");
        let worktrees_dir = project_dir.join(&flow.vcs.worktrees_dir);
        Self {
            db_file: forge_dir.join("forgeflow.db"),
            artifacts_dir: forge_dir.join("artifacts"),
            audit_dir: forge_dir.join("audit"),
            log_dir: forge_dir.join("logs"),
            trunk_lock_file: forge_dir.join("trunk.lock"),
            tracker_file: forge_dir.join("tracker.jsonl"),
            worktrees_dir,
            forge_dir,
            project_dir,
            verbose,
            flow,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.artifacts_dir)
            .context("Failed to create artifacts directory")?;
        std::fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.worktrees_dir)
            .context("Failed to create worktrees directory")?;
        Ok(())
    }

    pub fn is_initialized(project_dir: &Path) -> bool {
        project_dir.join(".forge").join("forgeflow.db").exists()
    }

    pub fn decision_log_file(&self) -> PathBuf {
        self.audit_dir.join("decisions.jsonl")
    }
}
