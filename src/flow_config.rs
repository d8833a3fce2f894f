//! Unified configuration for forgeflow.
//!
//! Reads `.forge/forgeflow.toml`. Every key has a default, so an absent file
//! or an empty table yields a working configuration. Layering is
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [summary]
//! fraction = 0.15
//! max_findings = 12
//!
//! [phases]
//! max_revisions = 3
//!
//! [worker]
//! command = "claude"
//! args = ["--print"]
//! max_attempts = 3
//! initial_delay_ms = 500
//! max_delay_ms = 8000
//! backoff_factor = 2.0
//!
//! [vcs]
//! trunk = "main"
//! worktrees_dir = ".forge/worktrees"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "forgeflow.toml";

/// Summarization bounds for context artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySection {
    /// Summary size cap as a fraction of the full output size.
    #[serde(default = "default_fraction")]
    pub fraction: f64,
    /// Maximum number of top-level findings carried into a summary.
    #[serde(default = "default_max_findings")]
    pub max_findings: usize,
}

fn default_fraction() -> f64 {
    0.15
}

fn default_max_findings() -> usize {
    12
}

impl Default for SummarySection {
    fn default() -> Self {
        Self {
            fraction: default_fraction(),
            max_findings: default_max_findings(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesSection {
    /// REVISE decisions allowed per phase before the run is aborted.
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
}

fn default_max_revisions() -> u32 {
    3
}

impl Default for PhasesSection {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
        }
    }
}

/// Worker command and its retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_worker_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_worker_args(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsSection {
    /// Branch that workspaces are merged into.
    #[serde(default)]
    pub trunk: Option<String>,
    /// Parent directory for worktrees, relative to the project root.
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,
}

fn default_worktrees_dir() -> String {
    ".forge/worktrees".to_string()
}

impl Default for VcsSection {
    fn default() -> Self {
        Self {
            trunk: None,
            worktrees_dir: default_worktrees_dir(),
        }
    }
}

/// The complete forgeflow.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowToml {
    #[serde(default)]
    pub summary: SummarySection,
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub vcs: VcsSection,
}

impl FlowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse forgeflow.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `.forge/forgeflow.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(forge_dir: &Path) -> Result<Self> {
        let path = forge_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize forgeflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.summary.fraction > 0.0 && self.summary.fraction <= 1.0) {
            anyhow::bail!(
                "summary.fraction must be in (0, 1], got {}",
                self.summary.fraction
            );
        }
        if self.worker.max_attempts == 0 {
            anyhow::bail!("worker.max_attempts must be at least 1");
        }
        if self.worker.backoff_factor < 1.0 {
            anyhow::bail!(
                "worker.backoff_factor must be >= 1.0, got {}",
                self.worker.backoff_factor
            );
        }
        Ok(())
    }

    /// Worker command, with fallback to `FORGEFLOW_WORKER_CMD`.
    pub fn worker_cmd(&self) -> String {
        self.worker
            .command
            .clone()
            .or_else(|| std::env::var("FORGEFLOW_WORKER_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Trunk branch, with fallback to `FORGEFLOW_TRUNK`.
    pub fn trunk(&self) -> String {
        self.vcs
            .trunk
            .clone()
            .or_else(|| std::env::var("FORGEFLOW_TRUNK").ok())
            .unwrap_or_else(|| "main".to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.worker.max_attempts,
            initial_delay: Duration::from_millis(self.worker.initial_delay_ms),
            max_delay: Duration::from_millis(self.worker.max_delay_ms),
            backoff_factor: self.worker.backoff_factor,
        }
    }
}

/// Exponential backoff for worker invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// No delays; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        FlowToml::default().retry_policy()
    }
}
