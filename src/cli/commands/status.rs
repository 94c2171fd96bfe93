//! Status command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::pipeline::StepId;
use anyhow::Result;

/// Run the status command.
pub async fn run_status(run_id: Option<&str>, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;

    let Some(run_id) = run_id else {
        let runs = orchestrator.list_runs().await?;
        if runs.is_empty() {
            Output::info("No runs yet.");
            Output::info("Start one with: scenecast start <run-id> <captions>");
            return Ok(());
        }
        Output::header(&format!("Runs ({})", runs.len()));
        for record in &runs {
            Output::run_info(record);
        }
        return Ok(());
    };

    let summary = orchestrator.status(run_id).await?;
    let record = &summary.record;

    Output::header(&format!("Run {}", record.run_id));
    Output::kv("Status", &record.status.to_string());
    Output::kv("Created", &record.created_at.format("%Y-%m-%d %H:%M:%S").to_string());
    Output::kv("Updated", &record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string());
    if let Some(error) = &record.last_error {
        Output::kv("Last error", error);
        Output::kv("Consecutive failures", &record.failures.to_string());
    }

    Output::header("Steps");
    for step in StepId::ALL {
        let mark = if summary.completed_steps.contains(&step) { "done" } else { "-" };
        Output::list_item(&format!("{:>4} {:<14} {}", step.number(), step.name(), mark));
    }

    if summary.scenes > 0 {
        Output::header("Scenes");
        Output::kv("Total", &summary.scenes.to_string());
        Output::kv("Generated", &summary.generated.to_string());
        Output::kv("Failed", &summary.failed.to_string());
        Output::kv(
            "Pending",
            &(summary.scenes - summary.generated - summary.failed).to_string(),
        );
    }

    Ok(())
}
