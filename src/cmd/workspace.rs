//! `forgeflow workspace list|reclaim`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::{Cli, WorkspaceCommands};
use super::load_config;
use forgeflow::config::Config;
use forgeflow::models::WorkspaceState;
use forgeflow::workspace::WorkspaceManager;

fn workspace_manager(config: &Config) -> Result<WorkspaceManager> {
    use forgeflow::db::DbHandle;
    use forgeflow::vcs::GitVcs;
    use forgeflow::workspace::TrunkLock;

    let db = DbHandle::open(&config.db_file)?;
    let vcs = Arc::new(GitVcs::new(&config.project_dir)?);
    Ok(WorkspaceManager::new(
        db,
        vcs,
        &config.worktrees_dir,
        &config.flow.trunk(),
        TrunkLock::new(&config.trunk_lock_file),
    ))
}

pub async fn cmd_workspace(cli: &Cli, project_dir: &Path, command: WorkspaceCommands) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let manager = workspace_manager(&config)?;

    match command {
        WorkspaceCommands::List => {
            let workspaces = manager.list().await?;
            if workspaces.is_empty() {
                println!("No workspaces.");
                return Ok(());
            }
            println!("{:<20} {:<10} {:<10} BRANCH", "NAME", "RUN", "STATE");
            for ws in workspaces {
                let state = match ws.state {
                    WorkspaceState::Active => style(ws.state.as_str()).cyan(),
                    WorkspaceState::Reclaimed => style(ws.state.as_str()).dim(),
                    WorkspaceState::Creating | WorkspaceState::Merging => {
                        style(ws.state.as_str()).yellow()
                    }
                };
                println!(
                    "{:<20} {:<10} {:<10} {}",
                    ws.name,
                    ws.run_id.to_string(),
                    state,
                    ws.branch
                );
            }
        }
        WorkspaceCommands::Reclaim { name, force } => {
            let ws = manager.reclaim(&name, force).await?;
            println!(
                "{} {} ({} deleted)",
                style("Reclaimed").green().bold(),
                ws.name,
                ws.branch
            );
        }
    }
    Ok(())
}
