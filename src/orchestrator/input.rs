use crate::artifact::ArtifactStore;
use crate::errors::FlowResult;
use crate::models::WorkflowRun;
use crate::phase::{ALL_PHASES, PhaseKind};

/// Worker input for `phase`: the task, the summary of every earlier phase's
/// approved artifact in pipeline order, then all revision notes for `phase`.
///
/// Only summaries travel forward; full outputs stay in the store.
pub fn build_worker_input(
    run: &WorkflowRun,
    phase: PhaseKind,
    attempt: u32,
    artifacts: &ArtifactStore,
) -> FlowResult<String> {
    let mut input = String::new();
    input.push_str("# Task\n\n");
    input.push_str(run.task.trim());
    input.push_str("\n\n");
    input.push_str(&format!(
        "# Phase\n\n{} (attempt {})\n",
        phase.as_str().to_uppercase(),
        attempt
    ));

    for prior in ALL_PHASES.iter().take_while(|p| **p != phase) {
        let Some(artifact_id) = run
            .approved_record(*prior)
            .and_then(|r| r.artifact_id.as_deref())
        else {
            continue;
        };
        let summary = artifacts.summary_of(artifact_id)?;
        input.push_str(&format!(
            "\n## {} summary\n\n",
            capitalize(prior.as_str())
        ));
        if summary.trim().is_empty() {
            input.push_str("(no findings)\n");
        } else {
            input.push_str(&summary);
        }
    }

    let notes = run.revision_notes(phase);
    if !notes.is_empty() {
        input.push_str("\n## Revision notes\n\n");
        for (i, note) in notes.iter().enumerate() {
            input.push_str(&format!("{}. {}\n", i + 1, note.trim()));
        }
    }
    Ok(input)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
