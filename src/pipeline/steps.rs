//! Prompt building and response parsing for individual steps.

use super::StepId;
use crate::config::Prompts;
use crate::error::{Result, ScenecastError};
use crate::llm::CompletionRequest;
use crate::story::{StepOutput, StoryModel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

/// Build the completion request for `step` from the model slices it reads.
pub(crate) fn build_prompt(prompts: &Prompts, step: StepId, model: &StoryModel) -> CompletionRequest {
    let mut vars = HashMap::new();
    vars.insert("captions".to_string(), model.captions.format_with_timestamps());
    vars.insert("segment_count".to_string(), model.segments.len().to_string());

    if let Some(analysis) = &model.analysis {
        vars.insert("analysis".to_string(), to_prompt_json(analysis));
        vars.insert("visual_style".to_string(), analysis.visual_style.clone());
    }
    let tables = [
        ("segments", to_prompt_json(&model.segments)),
        ("characters", to_prompt_json(&model.characters)),
        ("locations", to_prompt_json(&model.locations)),
        ("director_plan", to_prompt_json(&model.director_plan)),
        ("scene_plan", to_prompt_json(&model.scene_plan)),
    ];
    for (name, json) in tables {
        vars.insert(name.to_string(), json);
    }

    let template = prompts.story.for_step(step);
    CompletionRequest {
        label: step.name().to_string(),
        system: prompts.render_with_custom(&template.system, &vars),
        user: prompts.render_with_custom(&template.user, &vars),
    }
}

/// Text appended to a prompt after an unusable answer.
pub(crate) fn correction_hint(prompts: &Prompts, error: &str) -> String {
    let mut vars = HashMap::new();
    vars.insert("error".to_string(), error.to_string());
    prompts.render_with_custom(&prompts.story.correction, &vars)
}

fn to_prompt_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Extract the JSON document from a model response.
///
/// Accepts a bare document, a fenced code block, or a document surrounded
/// by prose.
pub fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            // The language tag may sit on its own line or directly before the document
            if let Some(inner) = json_span(&after_fence[..end]) {
                return Some(inner);
            }
        }
    }

    json_span(trimmed)
}

/// The span from the first `{` or `[` to the last matching close.
fn json_span(text: &str) -> Option<&str> {
    let open = text.find(|c: char| c == '{' || c == '[')?;
    let close_char = if text[open..].starts_with('{') { '}' } else { ']' };
    let close = text.rfind(close_char)?;
    (close > open).then(|| &text[open..=close])
}

/// Parse a raw model response into the rows of `step`.
///
/// The rows are expected under the step's key (`{"characters": [...]}`); a
/// bare array or bare analysis object is accepted too.
pub fn parse_step_output(step: StepId, response: &str) -> Result<StepOutput> {
    let json = extract_json(response)
        .ok_or_else(|| ScenecastError::Validation("response contains no JSON document".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ScenecastError::Validation(format!("response is not valid JSON: {}", e)))?;

    let rows = match value {
        serde_json::Value::Object(mut map) if map.contains_key(step.output_key()) => {
            map.remove(step.output_key()).unwrap_or_default()
        }
        other => other,
    };

    let output = match step {
        StepId::Analysis => StepOutput::Analysis(rows_as(step, rows)?),
        StepId::Segmentation => StepOutput::Segmentation(rows_as(step, rows)?),
        StepId::Characters => StepOutput::Characters(rows_as(step, rows)?),
        StepId::Locations => StepOutput::Locations(rows_as(step, rows)?),
        StepId::DirectorPlan => StepOutput::DirectorPlan(rows_as(step, rows)?),
        StepId::ScenePlan => StepOutput::ScenePlan(rows_as(step, rows)?),
        StepId::ScenePrompts => StepOutput::ScenePrompts(rows_as(step, rows)?),
    };
    Ok(output)
}

fn rows_as<T: DeserializeOwned>(step: StepId, rows: serde_json::Value) -> Result<T> {
    serde_json::from_value(rows).map_err(|e| {
        ScenecastError::Validation(format!("\"{}\" rows do not match the schema: {}", step.output_key(), e))
    })
}
