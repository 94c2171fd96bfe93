//! Generate command implementation.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::{GenerateOptions, Orchestrator};
use crate::worker::PoolOutcome;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Run the generate command.
pub async fn run_generate(
    run_id: &str,
    video: bool,
    reference_images: bool,
    workers: Option<usize>,
    settings: Settings,
    cancel: &CancellationToken,
) -> Result<()> {
    preflight::check(Operation::Generate, &settings)?;

    let options = GenerateOptions {
        video: video || settings.generation.video,
        reference_images: reference_images || settings.generation.reference_images,
        workers,
    };
    let orchestrator = Orchestrator::new(settings)?;

    let queue = orchestrator.plan_generation(run_id, &options).await?;
    if queue.is_empty() {
        Output::success(&format!("Every asset of '{}' is already generated.", run_id));
        return Ok(());
    }
    Output::info(&format!(
        "Generating {} assets for '{}'{}",
        queue.len(),
        run_id,
        if options.video { " (with video)" } else { "" }
    ));

    // Progress follows queue changes until the pool returns
    let pb = Output::progress_bar(queue.len() as u64, "generating");
    let watcher = {
        let queue = queue.clone();
        let pb = pb.clone();
        let mut changes = queue.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                if let Ok(summary) = queue.summary() {
                    pb.set_position((summary.succeeded + summary.failed) as u64);
                    pb.set_message(format!("{} in flight, {} failed", summary.in_flight, summary.failed));
                }
            }
        })
    };

    let result = orchestrator.run_generation(run_id, queue, &options, cancel).await;
    watcher.abort();
    pb.finish_and_clear();
    let result = result?;
    let report = &result.report;

    match report.outcome {
        PoolOutcome::Success => {
            Output::success(&format!("Generated {} assets.", report.succeeded));
        }
        PoolOutcome::PartialSuccess => {
            Output::warning(&format!(
                "Generated {} assets; {} failed, {} not attempted.",
                report.succeeded,
                report.failures.len(),
                report.unattempted
            ));
        }
        PoolOutcome::Cancelled => {
            Output::warning(&format!(
                "Cancelled after {} assets; {} not attempted.",
                report.succeeded, report.unattempted
            ));
        }
    }

    if !report.failures.is_empty() {
        Output::header("Failed");
        for failure in &report.failures {
            Output::scene_failure(&failure.task_id, failure.attempts, &failure.error);
        }
    }

    if !report.unsaved.is_empty() {
        Output::header("Not saved");
        for unsaved in &report.unsaved {
            Output::error(&format!("{}: {}", unsaved.task_id, unsaved.error));
        }
    }

    Output::header("Sessions");
    for session in &report.sessions {
        Output::list_item(&format!(
            "{} ({}): {} done, {} failed, {}",
            session.id, session.account_id, session.completed, session.failed, session.health
        ));
    }

    if report.outcome != PoolOutcome::Success {
        Output::info(&format!("Retry the remaining assets with: scenecast generate {}", run_id));
    } else {
        Output::info(&format!("Hand off with: scenecast export {}", run_id));
    }

    Ok(())
}
