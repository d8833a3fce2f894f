//! Read-only inspection: `forgeflow runs`, `forgeflow show`, `forgeflow artifact`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::Cli;
use super::load_config;
use forgeflow::models::{RecordStatus, RunId, RunStatus, WorkflowRun};

pub async fn cmd_runs(cli: &Cli, project_dir: &Path, status: Option<&str>) -> Result<()> {
    use forgeflow::db::DbHandle;
    use forgeflow::registry::RunRegistry;

    let config = load_config(cli, project_dir)?;
    let status = status.map(str::parse::<RunStatus>).transpose()?;
    let registry = RunRegistry::new(DbHandle::open(&config.db_file)?);
    let runs = registry.list(status).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<10} {:<10} {:<10} {:<10} TASK",
        "RUN", "STATUS", "PHASE", "RECORDS"
    );
    for run in &runs {
        println!(
            "{:<10} {:<10} {:<10} {:<10} {}",
            run.id.to_string(),
            run.status.as_str(),
            run.current_phase.as_str(),
            run.records.len(),
            truncate(&run.task, 60)
        );
    }
    Ok(())
}

pub async fn cmd_show(cli: &Cli, project_dir: &Path, run: &str) -> Result<()> {
    use forgeflow::artifact::ArtifactStore;
    use forgeflow::db::DbHandle;
    use forgeflow::registry::RunRegistry;

    let run_id: RunId = run.parse()?;
    let config = load_config(cli, project_dir)?;
    let registry = RunRegistry::new(DbHandle::open(&config.db_file)?);
    let run = registry.get(run_id).await?;
    print_run(&run);

    let store = ArtifactStore::new(&config.artifacts_dir, config.flow.summary.clone().into())?;
    let artifacts = store.list_for_run(run.id)?;
    if !artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in artifacts {
            println!(
                "  {:<28} {:>8} bytes  summary {:>6} bytes ({:.0}%)",
                artifact.id,
                artifact.full_bytes,
                artifact.summary_bytes,
                artifact.ratio() * 100.0
            );
        }
    }
    Ok(())
}

pub fn cmd_artifact(cli: &Cli, project_dir: &Path, id: &str, full: bool) -> Result<()> {
    use forgeflow::artifact::ArtifactStore;

    let config = load_config(cli, project_dir)?;
    let store = ArtifactStore::new(&config.artifacts_dir, config.flow.summary.clone().into())?;
    let text = if full {
        store.full_of(id)
    } else {
        store.summary_of(id)
    }
    .with_context(|| format!("Cannot read artifact {}", id))?;
    println!("{}", text);
    Ok(())
}

/// Print a run header followed by one line per phase record.
pub fn print_run(run: &WorkflowRun) {
    let status = match run.status {
        RunStatus::Active => style(run.status.as_str()).cyan(),
        RunStatus::Completed => style(run.status.as_str()).green(),
        RunStatus::Aborted => style(run.status.as_str()).red(),
    };
    println!("{} {}  [{}]", style(run.id).bold(), run.task, status);
    println!("  Current phase: {}", run.current_phase);
    if let Some(reason) = &run.abort_reason {
        println!("  Abort reason:  {}", reason);
    }
    if run.records.is_empty() {
        println!("  (no phase records)");
        return;
    }
    println!();
    for record in &run.records {
        let marker = match record.status {
            RecordStatus::Approved => style("✓").green(),
            RecordStatus::ReviseRequested => style("↻").yellow(),
            RecordStatus::Rejected | RecordStatus::Failed => style("✗").red(),
            RecordStatus::Pending | RecordStatus::AwaitingApproval => style("…").dim(),
        };
        print!(
            "  {} {:<10} #{} {:<18}",
            marker,
            record.phase.as_str(),
            record.attempt,
            record.status.as_str()
        );
        if let Some(id) = &record.artifact_id {
            print!(" {}", style(id).dim());
        }
        println!();
        if let Some(decision) = &record.decision
            && !decision.notes.is_empty()
        {
            println!("      {}: {}", decision.kind, decision.notes);
        }
        if let Some(failure) = &record.failure {
            println!("      {}", style(failure).red());
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
