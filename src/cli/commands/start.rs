//! Start command implementation.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{RunRecord, RunStatus, StepId};
use crate::story::StoryModel;
use crate::transcription::load_captions;
use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Run the start command.
pub async fn run_start(
    run_id: &str,
    captions: &Path,
    settings: Settings,
    cancel: &CancellationToken,
) -> Result<()> {
    preflight::check(Operation::Pipeline, &settings)?;

    let transcript = load_captions(captions)?;
    Output::info(&format!(
        "Loaded {} captions from {}",
        transcript.segments.len(),
        captions.display()
    ));

    let orchestrator = Orchestrator::new(settings)?;
    let spinner = Output::spinner(&format!("Running story pipeline for '{}'...", run_id));
    let result = orchestrator.start(run_id, transcript, cancel).await;
    spinner.finish_and_clear();

    let (model, record) = result?;
    report_run(&model, &record);
    Ok(())
}

/// Print where a pipeline run ended up.
pub(super) fn report_run(model: &StoryModel, record: &RunRecord) {
    match record.status {
        RunStatus::Completed => {
            Output::success(&format!(
                "Run '{}' completed: {} segments, {} characters, {} locations, {} scenes",
                record.run_id,
                model.segments.len(),
                model.characters.len(),
                model.locations.len(),
                model.scenes.len()
            ));
            Output::info(&format!("Generate assets with: scenecast generate {}", record.run_id));
        }
        _ => {
            let completed = model.completed_steps();
            Output::warning(&format!(
                "Run '{}' stopped ({}) after {} of {} steps",
                record.run_id,
                record.status,
                completed.len(),
                StepId::ALL.len()
            ));
            Output::info(&format!("Continue with: scenecast resume {}", record.run_id));
        }
    }
}
