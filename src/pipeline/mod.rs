//! Progressive generation pipeline.
//!
//! Turns the caption seed of a [`StoryModel`](crate::story::StoryModel) into
//! per-scene generation prompts through a fixed sequence of AI-assisted steps:
//!
//! | Step | Produces |
//! |------|----------|
//! | 1    | story analysis |
//! | 1.5  | story segments |
//! | 2    | characters |
//! | 3    | locations |
//! | 4    | director plan |
//! | 4.5  | scene plan |
//! | 5    | scene prompts |
//!
//! Each step reads only validated output of earlier steps, so the sequence is
//! strictly ordered and a run can be resumed at the first step whose output
//! is missing.

mod coordinator;
mod executor;
mod steps;

pub use coordinator::{PipelineCoordinator, RunRecord};
pub use executor::{ExecutorConfig, StepExecutor};
pub use steps::{extract_json, parse_step_output};

use serde::{Deserialize, Serialize};

/// Identifier of a pipeline step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    /// Step 1: whole-narrative analysis.
    Analysis,
    /// Step 1.5: narration split into story segments.
    Segmentation,
    /// Step 2: recurring characters.
    Characters,
    /// Step 3: recurring locations.
    Locations,
    /// Step 4: shot-level director plan.
    DirectorPlan,
    /// Step 4.5: scene-level breakdown of the director plan.
    ScenePlan,
    /// Step 5: final per-scene prompts.
    ScenePrompts,
}

impl StepId {
    /// All steps in execution order.
    pub const ALL: [StepId; 7] = [
        StepId::Analysis,
        StepId::Segmentation,
        StepId::Characters,
        StepId::Locations,
        StepId::DirectorPlan,
        StepId::ScenePlan,
        StepId::ScenePrompts,
    ];

    /// Position of this step in [`StepId::ALL`].
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// Step number as used in documentation and logs ("1", "1.5", ...).
    pub fn number(self) -> &'static str {
        match self {
            StepId::Analysis => "1",
            StepId::Segmentation => "1.5",
            StepId::Characters => "2",
            StepId::Locations => "3",
            StepId::DirectorPlan => "4",
            StepId::ScenePlan => "4.5",
            StepId::ScenePrompts => "5",
        }
    }

    /// Stable snake_case name.
    pub fn name(self) -> &'static str {
        match self {
            StepId::Analysis => "analysis",
            StepId::Segmentation => "segmentation",
            StepId::Characters => "characters",
            StepId::Locations => "locations",
            StepId::DirectorPlan => "director_plan",
            StepId::ScenePlan => "scene_plan",
            StepId::ScenePrompts => "scene_prompts",
        }
    }

    /// Key of the JSON object wrapping the step's rows in a model response.
    pub fn output_key(self) -> &'static str {
        match self {
            StepId::Analysis => "analysis",
            StepId::Segmentation => "segments",
            StepId::Characters => "characters",
            StepId::Locations => "locations",
            StepId::DirectorPlan => "director_plan",
            StepId::ScenePlan => "scene_plan",
            StepId::ScenePrompts => "scenes",
        }
    }

    /// The step whose output must be present before this one can run.
    pub fn predecessor(self) -> Option<StepId> {
        match self.index() {
            0 => None,
            i => Some(Self::ALL[i - 1]),
        }
    }

    /// The step that follows this one, if any.
    pub fn next(self) -> Option<StepId> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

impl std::str::FromStr for StepId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StepId::ALL
            .iter()
            .copied()
            .find(|step| step.name() == s || step.number() == s)
            .ok_or_else(|| format!("Unknown pipeline step: {}", s))
    }
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    RunningStep(StepId),
    StepFailed(StepId),
    Completed,
    Abandoned(StepId),
}

impl RunStatus {
    /// Whether `resume` can make further progress from this state.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            RunStatus::NotStarted | RunStatus::RunningStep(_) | RunStatus::StepFailed(_)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotStarted => write!(f, "not started"),
            RunStatus::RunningStep(step) => write!(f, "running step {}", step),
            RunStatus::StepFailed(step) => write!(f, "failed at step {}", step),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Abandoned(step) => write!(f, "abandoned at step {}", step),
        }
    }
}
