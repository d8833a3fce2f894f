//! `forgeflow init`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::Cli;

pub fn cmd_init(project_dir: &Path, cli: &Cli) -> Result<()> {
    use forgeflow::config::Config;
    use forgeflow::db::FlowDb;
    use forgeflow::flow_config::{CONFIG_FILE_NAME, FlowToml};
    use forgeflow::vcs::GitVcs;

    let vcs = GitVcs::new(project_dir).context("forgeflow needs a git repository")?;
    let was_initialized = Config::is_initialized(project_dir);

    let mut flow = FlowToml::default();
    if let Some(trunk) = &cli.trunk {
        flow.vcs.trunk = Some(trunk.clone());
    }
    if let Some(cmd) = &cli.worker_cmd {
        flow.worker.command = Some(cmd.clone());
    }
    let config = Config::with_flow(project_dir.to_path_buf(), cli.verbose, flow);
    config.ensure_directories()?;

    let config_file = config.forge_dir.join(CONFIG_FILE_NAME);
    if !config_file.exists() {
        config.flow.save(&config_file)?;
    }
    FlowDb::new(&config.db_file)?;
    vcs.ensure_excluded(".forge/")?;

    if was_initialized {
        println!(
            "forgeflow already initialized at {}",
            config.forge_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!(
        "{} forgeflow at {}",
        style("Initialized").green().bold(),
        config.forge_dir.display()
    );
    println!();
    println!("  .forge/");
    println!("  ├── forgeflow.toml  # Worker, summary and trunk settings");
    println!("  ├── forgeflow.db    # Runs, phase records, workspaces");
    println!("  ├── artifacts/      # Phase outputs and summaries");
    println!("  ├── audit/          # Decision log");
    println!("  ├── logs/");
    println!("  └── worktrees/      # One isolated checkout per run");
    println!();
    println!("Next: forgeflow start \"<task description>\"");
    Ok(())
}
