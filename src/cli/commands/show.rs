//! Show command implementation.

use crate::cli::output::format_duration;
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use anyhow::Result;

/// Run the show command.
pub async fn run_show(run_id: &str, json: bool, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    let model = orchestrator.show(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&model)?);
        return Ok(());
    }

    let dim = Output::dim_style();
    Output::header(&format!("Run {}", model.run_id));
    Output::kv("Captions", &model.captions.segments.len().to_string());
    Output::kv("Duration", &format_duration(model.captions.duration_seconds));

    if let Some(analysis) = &model.analysis {
        Output::header("Story");
        Output::kv("Theme", &analysis.theme);
        Output::kv("Tone", &analysis.tone);
        Output::kv("Arc", &analysis.arc);
        if !analysis.visual_style.is_empty() {
            Output::kv("Visual style", &analysis.visual_style);
        }
    }

    if !model.characters.is_empty() {
        Output::header("Characters");
        for c in &model.characters {
            Output::list_item(&format!(
                "{} {} {}",
                c.id,
                Output::title_style().apply_to(&c.name),
                dim.apply_to(&c.description)
            ));
        }
    }

    if !model.locations.is_empty() {
        Output::header("Locations");
        for l in &model.locations {
            Output::list_item(&format!(
                "{} {} {}",
                l.id,
                Output::title_style().apply_to(&l.name),
                dim.apply_to(&l.description)
            ));
        }
    }

    if !model.scenes.is_empty() {
        Output::header("Scenes");
        for scene in &model.scenes {
            Output::list_item(&format!(
                "{} [{}] {}",
                Output::title_style().apply_to(scene.id()),
                scene.status,
                scene.image_prompt
            ));
            if let Some(error) = scene.last_error() {
                println!("      {}", dim.apply_to(error));
            }
        }
    } else if !model.segments.is_empty() {
        Output::kv("Segments", &model.segments.len().to_string());
    }

    Ok(())
}
