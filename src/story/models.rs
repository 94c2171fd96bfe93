//! Row types for the story model tables.

use serde::{Deserialize, Serialize};

/// Whole-narrative summary (step 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryAnalysis {
    /// Central theme of the narration.
    pub theme: String,
    /// Emotional tone (e.g. "melancholic", "tense").
    pub tone: String,
    /// Overall narrative arc.
    pub arc: String,
    /// Short plot summary.
    #[serde(default)]
    pub summary: String,
    /// Visual style to apply to every generated image.
    #[serde(default)]
    pub visual_style: String,
}

/// A contiguous span of narration (step 1.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySegment {
    /// 1-based ordinal of the segment.
    pub index: u32,
    /// Start time in seconds.
    pub start_seconds: f64,
    /// End time in seconds.
    pub end_seconds: f64,
    /// Narration text covered by the segment.
    pub text: String,
    /// Role of this segment in the overall arc (setup, climax, ...).
    #[serde(default)]
    pub beat: String,
}

impl StorySegment {
    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// A recurring actor in the story (step 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Stable identifier, conventionally `nv1`, `nv2`, ...
    pub id: String,
    pub name: String,
    /// Visual description used to keep the character consistent across scenes.
    pub description: String,
    /// Reference portrait, filled in by the generation phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,
}

/// A recurring setting (step 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Stable identifier, conventionally `loc1`, `loc2`, ...
    pub id: String,
    pub name: String,
    pub description: String,
    /// Reference establishing shot, filled in by the generation phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,
}

/// A shot/beat decision (step 4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorPlanEntry {
    /// 1-based ordinal of the plan entry.
    pub index: u32,
    /// Story segment this entry covers.
    pub segment_index: u32,
    /// Camera intent (framing, movement).
    pub camera: String,
    /// Pacing intent (slow, lingering, rapid cuts, ...).
    pub pacing: String,
    /// What the shot has to convey.
    #[serde(default)]
    pub intent: String,
}

/// Scene-level breakdown of a director-plan entry (step 4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePlanEntry {
    /// Scene ordinal, unique and strictly increasing within a run.
    pub ordinal: u32,
    /// Director-plan entry this scene belongs to.
    pub plan_index: u32,
    /// Scene length in seconds.
    pub duration_seconds: f64,
    /// Characters on screen.
    #[serde(default)]
    pub characters: Vec<String>,
    /// Locations used.
    #[serde(default)]
    pub locations: Vec<String>,
    /// What happens in the scene.
    #[serde(default)]
    pub description: String,
}

/// Generation status of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    #[default]
    Pending,
    Generated,
    Failed,
}

impl std::fmt::Display for SceneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneStatus::Pending => write!(f, "pending"),
            SceneStatus::Generated => write!(f, "generated"),
            SceneStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The final generation unit (step 5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// Scene ordinal, matching a [`ScenePlanEntry`].
    pub ordinal: u32,
    /// Composed image prompt.
    pub image_prompt: String,
    /// Motion prompt for video generation, when the model wrote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_prompt: Option<String>,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub status: SceneStatus,
    /// Reference to the generated image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_result: Option<String>,
    /// Reference to the generated video clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_result: Option<String>,
    /// Terminal error of the last image attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_error: Option<String>,
    /// Terminal error of the last video attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_error: Option<String>,
}

impl Scene {
    /// Scene identifier used for task ids and asset names (`s001`).
    pub fn id(&self) -> String {
        scene_id(self.ordinal)
    }

    /// Terminal error to report for the scene, image before video.
    pub fn last_error(&self) -> Option<&str> {
        self.image_error.as_deref().or(self.video_error.as_deref())
    }

    /// Recompute [`SceneStatus`] from results and errors.
    pub(crate) fn refresh_status(&mut self) {
        self.status = if self.image_error.is_some() || self.video_error.is_some() {
            SceneStatus::Failed
        } else if self.image_result.is_some() {
            SceneStatus::Generated
        } else {
            SceneStatus::Pending
        };
    }
}

/// Format a scene ordinal as a scene identifier.
pub fn scene_id(ordinal: u32) -> String {
    format!("s{:03}", ordinal)
}
