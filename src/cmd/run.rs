//! Driving runs: `forgeflow start` and `forgeflow resume`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use super::load_config;
use super::runs::print_run;
use forgeflow::config::Config;
use forgeflow::models::{RunId, WorkflowRun};
use forgeflow::orchestrator::PhaseController;

pub fn build_controller(config: &Config) -> Result<PhaseController> {
    use forgeflow::artifact::ArtifactStore;
    use forgeflow::db::DbHandle;
    use forgeflow::gates::{AuditedGate, TerminalGate};
    use forgeflow::registry::RunRegistry;
    use forgeflow::tracker::JsonlTracker;
    use forgeflow::vcs::GitVcs;
    use forgeflow::worker::CommandWorker;
    use forgeflow::workspace::{TrunkLock, WorkspaceManager};

    config.ensure_directories()?;
    let db = DbHandle::open(&config.db_file)?;
    let vcs = Arc::new(GitVcs::new(&config.project_dir)?);
    let workspaces = WorkspaceManager::new(
        db.clone(),
        vcs,
        &config.worktrees_dir,
        &config.flow.trunk(),
        TrunkLock::new(&config.trunk_lock_file),
    );
    let artifacts = ArtifactStore::new(&config.artifacts_dir, config.flow.summary.clone().into())?;
    let gate = AuditedGate::new(TerminalGate::new(), &config.decision_log_file());
    let worker = CommandWorker::new(config.flow.worker_cmd(), config.flow.worker.args.clone());

    Ok(PhaseController::new(
        RunRegistry::new(db),
        Arc::new(artifacts),
        Arc::new(workspaces),
        Arc::new(gate),
        Arc::new(worker),
        &config.project_dir,
    )
    .with_tracker(Arc::new(JsonlTracker::new(&config.tracker_file)))
    .with_retry(config.flow.retry_policy())
    .with_max_revisions(config.flow.phases.max_revisions))
}

/// Cancel in-flight work on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style("Interrupted, stopping current phase...").yellow());
            trigger.cancel();
        }
    });
    cancel
}

pub async fn cmd_start(cli: &Cli, project_dir: &Path, task: &str, step: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let controller = build_controller(&config)?;
    let run = controller.start(task).await?;
    println!(
        "{} {} {}",
        style("Started").green().bold(),
        style(run.id).bold(),
        run.task
    );
    drive(&controller, run.id, step).await
}

pub async fn cmd_resume(cli: &Cli, project_dir: &Path, run: &str, step: bool) -> Result<()> {
    let run_id: RunId = run.parse()?;
    let config = load_config(cli, project_dir)?;
    let controller = build_controller(&config)?;
    let run = controller
        .registry()
        .get(run_id)
        .await
        .with_context(|| format!("Cannot resume {}", run_id))?;
    println!(
        "{} {} at {}",
        style("Resuming").cyan().bold(),
        style(run.id).bold(),
        run.current_phase
    );
    drive(&controller, run.id, step).await
}

async fn drive(controller: &PhaseController, run_id: RunId, step: bool) -> Result<()> {
    let cancel = cancel_on_interrupt();
    let result = if step {
        controller.advance(run_id, &cancel).await
    } else {
        controller.run_to_completion(run_id, &cancel).await
    };

    match result {
        Ok(run) => {
            report(&run);
            Ok(())
        }
        Err(e) => {
            if let Ok(run) = controller.registry().get(run_id).await {
                print_run(&run);
            }
            Err(e).with_context(|| format!("{} stopped", run_id))
        }
    }
}

fn report(run: &WorkflowRun) {
    print_run(run);
    println!();
    match (&run.status, &run.abort_reason) {
        (forgeflow::models::RunStatus::Completed, _) => {
            println!("{} {} completed", style("✓").green().bold(), run.id);
        }
        (forgeflow::models::RunStatus::Aborted, Some(reason)) => {
            println!("{} {} aborted: {}", style("✗").red().bold(), run.id, reason);
        }
        _ => {
            println!(
                "Next: forgeflow resume {}  ({} pending)",
                run.id, run.current_phase
            );
        }
    }
}
