//! Export command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use std::path::PathBuf;

/// Run the export command.
pub async fn run_export(run_id: &str, output: Option<PathBuf>, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    let result = orchestrator.export(run_id, output).await?;

    Output::success(&format!(
        "Exported '{}' to {} ({} files, {} scenes)",
        run_id,
        result.dir.display(),
        result.copied,
        result.scenes
    ));
    Output::kv("Manifest", &result.manifest_path.display().to_string());

    if !result.missing.is_empty() {
        Output::warning(&format!(
            "{} scenes have no image: {}",
            result.missing.len(),
            result.missing.join(", ")
        ));
        Output::info(&format!("Generate them with: scenecast generate {}", run_id));
    }

    Ok(())
}
