//! The story model: structured output of the progressive pipeline.
//!
//! A [`StoryModel`] is a set of correlated tables (analysis, segments,
//! characters, locations, director plan, scene plan, scenes) seeded with the
//! caption transcript of one run. Tables are append-only: each pipeline step
//! fills exactly one table and [`StoryModel::merge`] refuses to overwrite a
//! populated one. Merges are pure, so a model can always be rebuilt from a
//! checkpoint plus the outputs of later steps.

mod models;
mod validate;

pub use models::{
    scene_id, Character, DirectorPlanEntry, Location, Scene, ScenePlanEntry, SceneStatus,
    StoryAnalysis, StorySegment,
};
pub use validate::validate_output;

use crate::error::{Result, ScenecastError};
use crate::generation::GenerationKind;
use crate::pipeline::StepId;
use crate::transcription::Transcript;
use serde::{Deserialize, Serialize};

/// Rows produced by one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "rows", rename_all = "snake_case")]
pub enum StepOutput {
    Analysis(StoryAnalysis),
    Segmentation(Vec<StorySegment>),
    Characters(Vec<Character>),
    Locations(Vec<Location>),
    DirectorPlan(Vec<DirectorPlanEntry>),
    ScenePlan(Vec<ScenePlanEntry>),
    ScenePrompts(Vec<Scene>),
}

impl StepOutput {
    /// The step that produces this kind of output.
    pub fn step(&self) -> StepId {
        match self {
            StepOutput::Analysis(_) => StepId::Analysis,
            StepOutput::Segmentation(_) => StepId::Segmentation,
            StepOutput::Characters(_) => StepId::Characters,
            StepOutput::Locations(_) => StepId::Locations,
            StepOutput::DirectorPlan(_) => StepId::DirectorPlan,
            StepOutput::ScenePlan(_) => StepId::ScenePlan,
            StepOutput::ScenePrompts(_) => StepId::ScenePrompts,
        }
    }

    /// Number of rows carried.
    pub fn row_count(&self) -> usize {
        match self {
            StepOutput::Analysis(_) => 1,
            StepOutput::Segmentation(rows) => rows.len(),
            StepOutput::Characters(rows) => rows.len(),
            StepOutput::Locations(rows) => rows.len(),
            StepOutput::DirectorPlan(rows) => rows.len(),
            StepOutput::ScenePlan(rows) => rows.len(),
            StepOutput::ScenePrompts(rows) => rows.len(),
        }
    }
}

/// Record that a generated asset belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AssetTarget {
    Scene(u32),
    Character(String),
    Location(String),
}

impl AssetTarget {
    /// Identifier used for task ids and asset file names.
    pub fn label(&self) -> String {
        match self {
            AssetTarget::Scene(ordinal) => scene_id(*ordinal),
            AssetTarget::Character(id) | AssetTarget::Location(id) => id.clone(),
        }
    }
}

impl std::fmt::Display for AssetTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetTarget::Scene(ordinal) => write!(f, "scene {}", scene_id(*ordinal)),
            AssetTarget::Character(id) => write!(f, "character {}", id),
            AssetTarget::Location(id) => write!(f, "location {}", id),
        }
    }
}

/// Terminal result of one generation task, written back to its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetOutcome {
    pub target: AssetTarget,
    pub kind: GenerationKind,
    /// Result reference on success, error text on terminal failure.
    pub result: std::result::Result<String, String>,
}

/// Structured aggregate of all pipeline-step outputs for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryModel {
    pub run_id: String,
    /// Caption seed of the run.
    pub captions: Transcript,
    pub analysis: Option<StoryAnalysis>,
    pub segments: Vec<StorySegment>,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub director_plan: Vec<DirectorPlanEntry>,
    pub scene_plan: Vec<ScenePlanEntry>,
    pub scenes: Vec<Scene>,
}

impl StoryModel {
    /// Create an empty model seeded with captions.
    pub fn new(run_id: impl Into<String>, captions: Transcript) -> Self {
        Self {
            run_id: run_id.into(),
            captions,
            analysis: None,
            segments: Vec::new(),
            characters: Vec::new(),
            locations: Vec::new(),
            director_plan: Vec::new(),
            scene_plan: Vec::new(),
            scenes: Vec::new(),
        }
    }

    /// Whether the output of `step` is present.
    ///
    /// Every step must produce at least one row, so an empty table means the
    /// step has not completed.
    pub fn has_output(&self, step: StepId) -> bool {
        match step {
            StepId::Analysis => self.analysis.is_some(),
            StepId::Segmentation => !self.segments.is_empty(),
            StepId::Characters => !self.characters.is_empty(),
            StepId::Locations => !self.locations.is_empty(),
            StepId::DirectorPlan => !self.director_plan.is_empty(),
            StepId::ScenePlan => !self.scene_plan.is_empty(),
            StepId::ScenePrompts => !self.scenes.is_empty(),
        }
    }

    /// First step, in order, whose output is absent.
    pub fn first_missing_step(&self) -> Option<StepId> {
        StepId::ALL.iter().copied().find(|step| !self.has_output(*step))
    }

    /// Steps whose output is present, in order.
    pub fn completed_steps(&self) -> Vec<StepId> {
        StepId::ALL.iter().copied().filter(|step| self.has_output(*step)).collect()
    }

    /// Check that the predecessor of `step` has produced its output.
    pub fn check_prerequisite(&self, step: StepId) -> Result<()> {
        match step.predecessor() {
            Some(missing) if !self.has_output(missing) => {
                Err(ScenecastError::PrerequisiteMissing { step, missing })
            }
            _ => Ok(()),
        }
    }

    /// A model is terminal once every scene-plan entry has a scene prompt.
    pub fn is_terminal(&self) -> bool {
        !self.scene_plan.is_empty()
            && self
                .scene_plan
                .iter()
                .all(|plan| self.scenes.iter().any(|s| s.ordinal == plan.ordinal))
    }

    /// Merge the output of one step into a copy of this model.
    ///
    /// Rejects output for a step that already has rows, output whose
    /// predecessor is missing, and rows that fail validation.
    pub fn merge(&self, output: StepOutput) -> Result<StoryModel> {
        let step = output.step();
        self.check_prerequisite(step)?;

        if self.has_output(step) {
            return Err(ScenecastError::Validation(format!(
                "Output of step {} is already present and cannot be rewritten",
                step
            )));
        }

        validate_output(self, &output)?;

        let mut merged = self.clone();
        match output {
            StepOutput::Analysis(analysis) => merged.analysis = Some(analysis),
            StepOutput::Segmentation(rows) => merged.segments = rows,
            StepOutput::Characters(rows) => merged.characters = rows,
            StepOutput::Locations(rows) => merged.locations = rows,
            StepOutput::DirectorPlan(rows) => merged.director_plan = rows,
            StepOutput::ScenePlan(rows) => merged.scene_plan = rows,
            StepOutput::ScenePrompts(rows) => {
                merged.scenes = rows
                    .into_iter()
                    .map(|mut scene| {
                        scene.refresh_status();
                        scene
                    })
                    .collect();
            }
        }
        Ok(merged)
    }

    pub fn scene(&self, ordinal: u32) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.ordinal == ordinal)
    }

    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }

    pub fn location(&self, id: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.id == id)
    }

    /// Record a generation outcome against the record it belongs to.
    ///
    /// Touches exactly one row. Failures of reference images are not stored
    /// on the character/location row.
    pub fn apply_outcome(&mut self, outcome: &AssetOutcome) -> Result<()> {
        match &outcome.target {
            AssetTarget::Scene(ordinal) => {
                let scene = self
                    .scenes
                    .iter_mut()
                    .find(|s| s.ordinal == *ordinal)
                    .ok_or_else(|| {
                        ScenecastError::Validation(format!("Unknown scene {}", scene_id(*ordinal)))
                    })?;
                apply_to_scene(scene, outcome.kind, &outcome.result);
            }
            AssetTarget::Character(id) => {
                let character = self
                    .characters
                    .iter_mut()
                    .find(|c| &c.id == id)
                    .ok_or_else(|| ScenecastError::Validation(format!("Unknown character {}", id)))?;
                if let Ok(reference) = &outcome.result {
                    character.reference_image = Some(reference.clone());
                }
            }
            AssetTarget::Location(id) => {
                let location = self
                    .locations
                    .iter_mut()
                    .find(|l| &l.id == id)
                    .ok_or_else(|| ScenecastError::Validation(format!("Unknown location {}", id)))?;
                if let Ok(reference) = &outcome.result {
                    location.reference_image = Some(reference.clone());
                }
            }
        }
        Ok(())
    }

    /// Scenes whose last generation attempt failed terminally.
    pub fn failed_scenes(&self) -> Vec<&Scene> {
        self.scenes
            .iter()
            .filter(|s| s.status == SceneStatus::Failed)
            .collect()
    }
}

/// Apply a result to a single scene row.
pub(crate) fn apply_to_scene(
    scene: &mut Scene,
    kind: GenerationKind,
    result: &std::result::Result<String, String>,
) {
    match (kind, result) {
        (GenerationKind::Image, Ok(reference)) => {
            scene.image_result = Some(reference.clone());
            scene.image_error = None;
        }
        (GenerationKind::Image, Err(error)) => scene.image_error = Some(error.clone()),
        (GenerationKind::Video, Ok(reference)) => {
            scene.video_result = Some(reference.clone());
            scene.video_error = None;
        }
        (GenerationKind::Video, Err(error)) => scene.video_error = Some(error.clone()),
    }
    scene.refresh_status();
}
