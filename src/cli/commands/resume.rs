//! Resume command implementation.

use super::start::report_run;
use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::error::ScenecastError;
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Run the resume command.
pub async fn run_resume(run_id: &str, settings: Settings, cancel: &CancellationToken) -> Result<()> {
    preflight::check(Operation::Pipeline, &settings)?;

    let orchestrator = Orchestrator::new(settings)?;
    let spinner = Output::spinner(&format!("Resuming '{}'...", run_id));
    let result = orchestrator.resume(run_id, cancel).await;
    spinner.finish_and_clear();

    match result {
        Ok((model, record)) => {
            report_run(&model, &record);
            Ok(())
        }
        Err(e @ ScenecastError::RunAbandoned { .. }) => {
            Output::error(&e.to_string());
            Output::info("Start a new run with adjusted prompts or captions.");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
