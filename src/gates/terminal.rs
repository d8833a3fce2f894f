use async_trait::async_trait;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};

use super::{ApprovalGate, DecisionRequest};
use crate::errors::{FlowError, FlowResult};
use crate::models::Decision;

/// Interactive gate on the controlling terminal.
pub struct TerminalGate {
    width: usize,
}

impl TerminalGate {
    pub fn new() -> Self {
        let width = console::Term::stdout().size().1 as usize;
        Self {
            width: width.clamp(40, 100),
        }
    }

    fn print_request(&self, request: &DecisionRequest) {
        println!();
        println!(
            "{} {} {} {}",
            style("▶").cyan().bold(),
            style(request.run_id).bold(),
            style(request.phase.as_str().to_uppercase()).cyan().bold(),
            style(format!("attempt {}", request.attempt)).dim()
        );
        println!("  {} {}", style("Task:").dim(), request.task);
        println!("  {} {}", style("Artifact:").dim(), request.artifact_id);
        for (key, value) in &request.metadata {
            println!("  {} {}", style(format!("{}:", key)).dim(), value);
        }
        println!();
        if request.summary.trim().is_empty() {
            println!("  {}", style("(empty summary)").dim());
        }
        for line in request.summary.lines() {
            for wrapped in textwrap::wrap(line, self.width.saturating_sub(4)) {
                println!("  {}", wrapped);
            }
        }
        println!();
    }

    fn prompt(request: &DecisionRequest) -> dialoguer::Result<Decision> {
        let options = &[
            "Approve and continue",
            "Revise with notes",
            "Reject and abort the run",
        ];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Decision for {}", request.phase))
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(Decision::approve()),
            1 => {
                let notes: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Revision notes")
                    .interact_text()?;
                Ok(Decision::revise(notes))
            }
            _ => {
                let notes: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Reason (optional)")
                    .allow_empty(true)
                    .interact_text()?;
                Ok(Decision::reject(notes))
            }
        }
    }
}

impl Default for TerminalGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalGate for TerminalGate {
    async fn request_decision(&self, request: DecisionRequest) -> FlowResult<Decision> {
        self.print_request(&request);
        tokio::task::spawn_blocking(move || Self::prompt(&request))
            .await
            .map_err(|e| FlowError::Other(anyhow::anyhow!("gate prompt panicked: {}", e)))?
            .map_err(|e| FlowError::Other(anyhow::anyhow!("Failed to read decision: {}", e)))
    }
}
