//! Row validation for step outputs.
//!
//! Checks required fields, ordinal ordering and referential integrity of a
//! step's rows against the model they are about to be merged into. All
//! problems are collected so a regeneration request can name every one.

use super::{StepOutput, StoryModel};
use crate::error::{Result, ScenecastError};
use std::collections::HashSet;

/// Validate `output` against `model`. Returns every problem found.
pub fn validate_output(model: &StoryModel, output: &StepOutput) -> Result<()> {
    let mut problems = Vec::new();

    match output {
        StepOutput::Analysis(analysis) => {
            require(&mut problems, "analysis.theme", &analysis.theme);
            require(&mut problems, "analysis.tone", &analysis.tone);
            require(&mut problems, "analysis.arc", &analysis.arc);
        }

        StepOutput::Segmentation(segments) => {
            non_empty(&mut problems, "segments", segments.len());
            increasing(&mut problems, "segment index", segments.iter().map(|s| s.index));
            for seg in segments {
                let label = format!("segment {}", seg.index);
                require(&mut problems, &format!("{}.text", label), &seg.text);
                if seg.start_seconds < 0.0 || seg.end_seconds < seg.start_seconds {
                    problems.push(format!(
                        "{} has an invalid time range {}..{}",
                        label, seg.start_seconds, seg.end_seconds
                    ));
                }
            }
        }

        StepOutput::Characters(characters) => {
            non_empty(&mut problems, "characters", characters.len());
            let taken: HashSet<&str> = model.locations.iter().map(|l| l.id.as_str()).collect();
            unique_ids(&mut problems, "character", characters.iter().map(|c| c.id.as_str()), &taken);
            for c in characters {
                require(&mut problems, &format!("character {}.name", c.id), &c.name);
                require(&mut problems, &format!("character {}.description", c.id), &c.description);
            }
        }

        StepOutput::Locations(locations) => {
            non_empty(&mut problems, "locations", locations.len());
            let taken: HashSet<&str> = model.characters.iter().map(|c| c.id.as_str()).collect();
            unique_ids(&mut problems, "location", locations.iter().map(|l| l.id.as_str()), &taken);
            for l in locations {
                require(&mut problems, &format!("location {}.name", l.id), &l.name);
                require(&mut problems, &format!("location {}.description", l.id), &l.description);
            }
        }

        StepOutput::DirectorPlan(entries) => {
            non_empty(&mut problems, "director plan", entries.len());
            increasing(&mut problems, "director plan index", entries.iter().map(|e| e.index));
            let segments: HashSet<u32> = model.segments.iter().map(|s| s.index).collect();
            for entry in entries {
                if !segments.contains(&entry.segment_index) {
                    problems.push(format!(
                        "director plan entry {} references unknown segment {}",
                        entry.index, entry.segment_index
                    ));
                }
                require(&mut problems, &format!("director plan entry {}.camera", entry.index), &entry.camera);
                require(&mut problems, &format!("director plan entry {}.pacing", entry.index), &entry.pacing);
            }
        }

        StepOutput::ScenePlan(entries) => {
            non_empty(&mut problems, "scene plan", entries.len());
            increasing(&mut problems, "scene ordinal", entries.iter().map(|e| e.ordinal));
            let plan: HashSet<u32> = model.director_plan.iter().map(|e| e.index).collect();
            for entry in entries {
                let label = format!("scene plan entry {}", entry.ordinal);
                if !plan.contains(&entry.plan_index) {
                    problems.push(format!(
                        "{} references unknown director plan entry {}",
                        label, entry.plan_index
                    ));
                }
                if entry.duration_seconds <= 0.0 {
                    problems.push(format!("{} must have a positive duration", label));
                }
                references(&mut problems, model, &label, &entry.characters, &entry.locations);
            }
        }

        StepOutput::ScenePrompts(scenes) => {
            non_empty(&mut problems, "scenes", scenes.len());
            increasing(&mut problems, "scene ordinal", scenes.iter().map(|s| s.ordinal));
            let planned: HashSet<u32> = model.scene_plan.iter().map(|e| e.ordinal).collect();
            let written: HashSet<u32> = scenes.iter().map(|s| s.ordinal).collect();
            for scene in scenes {
                let label = format!("scene {}", scene.id());
                if !planned.contains(&scene.ordinal) {
                    problems.push(format!("{} has no scene plan entry", label));
                }
                require(&mut problems, &format!("{}.image_prompt", label), &scene.image_prompt);
                references(&mut problems, model, &label, &scene.characters, &scene.locations);
            }
            let mut missing: Vec<u32> = planned.difference(&written).copied().collect();
            missing.sort_unstable();
            if !missing.is_empty() {
                problems.push(format!("no scene prompt written for scene ordinals {:?}", missing));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ScenecastError::Validation(problems.join("; ")))
    }
}

fn require(problems: &mut Vec<String>, field: &str, value: &str) {
    if value.trim().is_empty() {
        problems.push(format!("{} is required", field));
    }
}

fn non_empty(problems: &mut Vec<String>, table: &str, len: usize) {
    if len == 0 {
        problems.push(format!("{} must contain at least one row", table));
    }
}

fn increasing(problems: &mut Vec<String>, what: &str, values: impl Iterator<Item = u32>) {
    let mut previous: Option<u32> = None;
    for value in values {
        if let Some(prev) = previous {
            if value <= prev {
                problems.push(format!(
                    "{} values must be unique and strictly increasing ({} follows {})",
                    what, value, prev
                ));
            }
        }
        previous = Some(value);
    }
}

fn unique_ids<'a>(
    problems: &mut Vec<String>,
    what: &str,
    ids: impl Iterator<Item = &'a str>,
    taken: &HashSet<&str>,
) {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            problems.push(format!("{} id is required", what));
        } else if !seen.insert(id) {
            problems.push(format!("duplicate {} id {}", what, id));
        } else if taken.contains(id) {
            problems.push(format!("{} id {} is already used by another table", what, id));
        }
    }
}

fn references(
    problems: &mut Vec<String>,
    model: &StoryModel,
    label: &str,
    characters: &[String],
    locations: &[String],
) {
    for id in characters {
        if model.character(id).is_none() {
            problems.push(format!("{} references unknown character {}", label, id));
        }
    }
    for id in locations {
        if model.location(id).is_none() {
            problems.push(format!("{} references unknown location {}", label, id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{Character, DirectorPlanEntry, Location, Scene, ScenePlanEntry, SceneStatus};
    use crate::testing::complete_model;

    fn scene(ordinal: u32, characters: &[&str]) -> Scene {
        Scene {
            ordinal,
            image_prompt: format!("Prompt for scene {}", ordinal),
            video_prompt: None,
            characters: characters.iter().map(|c| c.to_string()).collect(),
            locations: vec!["loc1".to_string()],
            status: SceneStatus::Pending,
            image_result: None,
            video_result: None,
            image_error: None,
            video_error: None,
        }
    }

    #[test]
    fn test_unknown_character_reference_rejected() {
        let mut model = complete_model("run", 2);
        model.scenes.clear();

        let err = validate_output(&model, &StepOutput::ScenePrompts(vec![scene(1, &["nv1"]), scene(2, &["nv9"])]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown character nv9"), "{}", err);
    }

    #[test]
    fn test_scene_prompts_must_cover_plan() {
        let mut model = complete_model("run", 3);
        model.scenes.clear();

        let err = validate_output(&model, &StepOutput::ScenePrompts(vec![scene(1, &[]), scene(3, &[])]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("[2]"), "{}", err);
    }

    #[test]
    fn test_ordinals_strictly_increasing() {
        let mut model = complete_model("run", 3);
        model.scene_plan.clear();
        let entry = |ordinal| ScenePlanEntry {
            ordinal,
            plan_index: 1,
            duration_seconds: 4.0,
            characters: vec![],
            locations: vec![],
            description: String::new(),
        };

        let result = validate_output(&model, &StepOutput::ScenePlan(vec![entry(1), entry(3), entry(3)]));
        assert!(result.is_err());

        let result = validate_output(&model, &StepOutput::ScenePlan(vec![entry(1), entry(3), entry(7)]));
        assert!(result.is_ok());
    }

    #[test]
    fn test_director_plan_segment_reference() {
        let model = complete_model("run", 1);
        let entries = vec![DirectorPlanEntry {
            index: 1,
            segment_index: 42,
            camera: "wide".to_string(),
            pacing: "slow".to_string(),
            intent: String::new(),
        }];
        let err = validate_output(&model, &StepOutput::DirectorPlan(entries)).unwrap_err();
        assert!(err.to_string().contains("unknown segment 42"));
    }

    #[test]
    fn test_id_collision_between_tables() {
        let mut model = complete_model("run", 1);
        model.locations.clear();
        let locations = vec![Location {
            id: "nv1".to_string(),
            name: "Tower".to_string(),
            description: "stone tower".to_string(),
            reference_image: None,
        }];
        let err = validate_output(&model, &StepOutput::Locations(locations)).unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[test]
    fn test_all_problems_reported() {
        let model = complete_model("run", 1);
        let characters = vec![
            Character {
                id: "nv1".to_string(),
                name: String::new(),
                description: "tall".to_string(),
                reference_image: None,
            },
            Character {
                id: "nv1".to_string(),
                name: "Twin".to_string(),
                description: String::new(),
                reference_image: None,
            },
        ];
        let err = validate_output(&model, &StepOutput::Characters(characters))
            .unwrap_err()
            .to_string();
        assert!(err.contains("name is required"));
        assert!(err.contains("duplicate character id nv1"));
        assert!(err.contains("description is required"));
    }
}
