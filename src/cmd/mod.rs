//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                |
//! |-------------|---------------------------------|
//! | `project`   | `Init`                          |
//! | `run`       | `Start`, `Resume`               |
//! | `runs`      | `Runs`, `Show`, `Artifact`      |
//! | `workspace` | `Workspace`                     |

pub mod project;
pub mod run;
pub mod runs;
pub mod workspace;

pub use project::cmd_init;
pub use run::{cmd_resume, cmd_start};
pub use runs::{cmd_artifact, cmd_runs, cmd_show};
pub use workspace::cmd_workspace;

use anyhow::Result;
use std::path::Path;

use super::Cli;
use forgeflow::config::Config;

/// Load configuration for an initialized project, applying CLI overrides.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    if !Config::is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'forgeflow init' first.");
    }
    let mut config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    if let Some(cmd) = &cli.worker_cmd {
        config.flow.worker.command = Some(cmd.clone());
    }
    if let Some(trunk) = &cli.trunk {
        config.flow.vcs.trunk = Some(trunk.clone());
    }
    Ok(config)
}
