//! Prompt templates for Scenecast.
//!
//! Prompts can be customized by placing a `story.toml` file in the custom
//! prompts directory. Every table of the file is optional.

use crate::pipeline::StepId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Prompts {
    pub story: StoryPrompts,
    /// Custom variables from config, available in all prompts.
    #[serde(skip)]
    pub variables: HashMap<String, String>,
}

/// System and user template for one pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPrompt {
    pub system: String,
    pub user: String,
}

impl StepPrompt {
    fn new(system: &str, user: &str) -> Self {
        Self {
            system: system.to_string(),
            user: user.to_string(),
        }
    }
}

/// Prompts for the progressive story pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryPrompts {
    pub analysis: StepPrompt,
    pub segmentation: StepPrompt,
    pub characters: StepPrompt,
    pub locations: StepPrompt,
    pub director_plan: StepPrompt,
    pub scene_plan: StepPrompt,
    pub scene_prompts: StepPrompt,
    /// Appended to the user prompt when a previous answer was unusable.
    pub correction: String,
}

const STORY_SYSTEM: &str = r#"You are a film director's assistant turning a narrated story into a shot-by-shot visual production plan.

Rules:
- Work only from the narration and the production notes you are given
- Never invent events that contradict the narration
- Keep every identifier exactly as given (nv1, loc2, ...)
- Respond with a single JSON object and nothing else"#;

impl Default for StoryPrompts {
    fn default() -> Self {
        Self {
            analysis: StepPrompt::new(
                STORY_SYSTEM,
                r#"Read the narration and describe the story as a whole.

Narration:
{{captions}}

Respond with:
{"analysis": {"theme": "...", "tone": "...", "arc": "...", "summary": "...", "visual_style": "..."}}

"visual_style" is one line describing the look every image should share."#,
            ),

            segmentation: StepPrompt::new(
                STORY_SYSTEM,
                r#"Split the narration into contiguous story segments.

Story analysis:
{{analysis}}

Narration:
{{captions}}

Each segment covers a continuous time range of the narration. Segments must not overlap
and must be numbered 1, 2, 3, ... in narration order.

Respond with:
{"segments": [{"index": 1, "start_seconds": 0.0, "end_seconds": 12.5, "text": "...", "beat": "setup"}]}"#,
            ),

            characters: StepPrompt::new(
                STORY_SYSTEM,
                r#"List the recurring characters of the story.

Story analysis:
{{analysis}}

Segments:
{{segments}}

Give each character a stable id nv1, nv2, ... and a visual description detailed enough
to draw them the same way in every scene (age, build, face, hair, clothing).
If the narrator is the only person, describe the narrator.

Respond with:
{"characters": [{"id": "nv1", "name": "...", "description": "..."}]}"#,
            ),

            locations: StepPrompt::new(
                STORY_SYSTEM,
                r#"List the recurring locations of the story.

Story analysis:
{{analysis}}

Segments:
{{segments}}

Characters:
{{characters}}

Give each location a stable id loc1, loc2, ... and a visual description (architecture,
light, weather, era). Location ids must not reuse character ids.

Respond with:
{"locations": [{"id": "loc1", "name": "...", "description": "..."}]}"#,
            ),

            director_plan: StepPrompt::new(
                STORY_SYSTEM,
                r#"Write the director's plan: one or more shots for every segment.

Story analysis:
{{analysis}}

Segments:
{{segments}}

Characters:
{{characters}}

Locations:
{{locations}}

Number entries 1, 2, 3, ... and reference the segment each entry covers by its index.

Respond with:
{"director_plan": [{"index": 1, "segment_index": 1, "camera": "slow push-in, wide", "pacing": "lingering", "intent": "..."}]}"#,
            ),

            scene_plan: StepPrompt::new(
                STORY_SYSTEM,
                r#"Break the director's plan into scenes.

Segments:
{{segments}}

Director plan:
{{director_plan}}

Characters:
{{characters}}

Locations:
{{locations}}

Every scene belongs to one director plan entry. Scene ordinals start at 1 and strictly increase.
Only reference character and location ids listed above.

Respond with:
{"scene_plan": [{"ordinal": 1, "plan_index": 1, "duration_seconds": 6.0, "characters": ["nv1"], "locations": ["loc1"], "description": "..."}]}"#,
            ),

            scene_prompts: StepPrompt::new(
                STORY_SYSTEM,
                r#"Write the generation prompt for every scene of the scene plan.

Visual style: {{visual_style}}

Characters:
{{characters}}

Locations:
{{locations}}

Scene plan:
{{scene_plan}}

Write exactly one scene per scene plan entry, with the same ordinal. The image prompt must
describe every character and location on screen from their descriptions, since the image
model sees no other context. The video prompt describes camera and subject motion.

Respond with:
{"scenes": [{"ordinal": 1, "image_prompt": "...", "video_prompt": "...", "characters": ["nv1"], "locations": ["loc1"]}]}"#,
            ),

            correction: r#"

Your previous answer could not be used: {{error}}
Answer again with the corrected JSON object only."#
                .to_string(),
        }
    }
}

impl StoryPrompts {
    /// Template pair for `step`.
    pub fn for_step(&self, step: StepId) -> &StepPrompt {
        match step {
            StepId::Analysis => &self.analysis,
            StepId::Segmentation => &self.segmentation,
            StepId::Characters => &self.characters,
            StepId::Locations => &self.locations,
            StepId::DirectorPlan => &self.director_plan,
            StepId::ScenePlan => &self.scene_plan,
            StepId::ScenePrompts => &self.scene_prompts,
        }
    }
}

impl Prompts {
    /// Load prompts from the default location, with optional custom directory and variables.
    pub fn load(
        custom_dir: Option<&str>,
        custom_variables: Option<&HashMap<String, String>>,
    ) -> crate::error::Result<Self> {
        let mut prompts = Prompts::default();

        if let Some(vars) = custom_variables {
            prompts.variables = vars.clone();
        }

        if let Some(dir) = custom_dir {
            let custom_path = PathBuf::from(shellexpand::tilde(dir).to_string());

            let story_path = custom_path.join("story.toml");
            if story_path.exists() {
                let content = std::fs::read_to_string(&story_path)?;
                prompts.story = toml::from_str(&content)?;
            }
        }

        Ok(prompts)
    }

    /// Render a prompt template with the given variables.
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        let mut result = template.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }
        result
    }

    /// Render a prompt template with both provided variables and custom config variables.
    /// Provided variables take precedence over custom config variables.
    pub fn render_with_custom(&self, template: &str, vars: &HashMap<String, String>) -> String {
        let mut merged = self.variables.clone();
        for (key, value) in vars {
            merged.insert(key.clone(), value.clone());
        }
        Self::render(template, &merged)
    }
}
