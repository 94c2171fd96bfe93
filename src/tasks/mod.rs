//! Generation tasks derived from a terminal story model.

mod queue;

pub use queue::{NextTask, QueueSummary, TaskQueue};

use crate::error::{Result, ScenecastError};
use crate::generation::GenerationKind;
use crate::story::{AssetTarget, Scene, StoryModel};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Assigned,
    InProgress,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::FailedTerminal)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::InProgress => "in progress",
            TaskState::Succeeded => "succeeded",
            TaskState::FailedRetryable => "failed (retryable)",
            TaskState::FailedTerminal => "failed",
        };
        write!(f, "{}", label)
    }
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Unique id: `s003-image`, `nv1-image`.
    pub id: String,
    pub target: AssetTarget,
    pub kind: GenerationKind,
    pub prompt: String,
    /// Reference images to condition on.
    pub references: Vec<PathBuf>,
    /// Tasks that must succeed before this one is dispatched; they produce
    /// the references.
    pub depends_on: Vec<String>,
    pub output_path: PathBuf,
    /// Attempts started so far.
    pub attempts: u32,
    pub state: TaskState,
    /// Session currently holding the task.
    pub worker: Option<String>,
    pub last_error: Option<String>,
    /// Result reference once succeeded.
    pub result: Option<String>,
    /// Not dispatched before this instant (backoff).
    pub eligible_at: Option<Instant>,
}

impl Task {
    fn new(
        target: AssetTarget,
        kind: GenerationKind,
        prompt: String,
        references: Vec<PathBuf>,
        output_path: PathBuf,
    ) -> Self {
        Self {
            id: format!("{}-{}", target.label(), kind),
            target,
            kind,
            prompt,
            references,
            depends_on: Vec::new(),
            output_path,
            attempts: 0,
            state: TaskState::Pending,
            worker: None,
            last_error: None,
            result: None,
            eligible_at: None,
        }
    }

    fn after(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// Options controlling which tasks are derived.
#[derive(Debug, Clone, Default)]
pub struct DeriveOptions {
    /// Queue a video task after every image task.
    pub video: bool,
    /// Queue reference portraits for characters and locations ahead of scenes.
    pub reference_images: bool,
    /// Only queue work whose result is missing.
    pub skip_succeeded: bool,
    /// Directory assets are written to.
    pub output_dir: PathBuf,
}

/// Output path of an asset inside a run directory.
pub fn asset_path(output_dir: &Path, target: &AssetTarget, kind: GenerationKind) -> PathBuf {
    let folder = match (target, kind) {
        (AssetTarget::Scene(_), GenerationKind::Image) => "img",
        (AssetTarget::Scene(_), GenerationKind::Video) => "video",
        (AssetTarget::Character(_), _) => "nv",
        (AssetTarget::Location(_), _) => "loc",
    };
    output_dir
        .join(folder)
        .join(format!("{}.{}", target.label(), kind.extension()))
}

/// Derive the generation tasks of a terminal model, in dispatch order.
///
/// Reference portraits (when enabled) come first, then for every scene in
/// ordinal order its image task followed by its video task (when enabled).
/// A scene image depends on the queued portraits of its characters and
/// locations, and a video depends on its queued start frame.
pub fn derive_tasks(model: &StoryModel, options: &DeriveOptions) -> Result<TaskQueue> {
    if !model.is_terminal() {
        let next = model
            .first_missing_step()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "scene prompts".to_string());
        return Err(ScenecastError::ModelIncomplete(format!(
            "run '{}' has not finished the pipeline (next step: {})",
            model.run_id, next
        )));
    }

    let dir = options.output_dir.as_path();
    let style = model
        .analysis
        .as_ref()
        .map(|a| a.visual_style.trim())
        .filter(|s| !s.is_empty());
    let with_style = |prompt: String| match style {
        Some(style) => format!("{} Style: {}.", prompt, style),
        None => prompt,
    };

    let mut tasks: Vec<Task> = Vec::new();

    if options.reference_images {
        for character in &model.characters {
            if options.skip_succeeded && character.reference_image.is_some() {
                continue;
            }
            let target = AssetTarget::Character(character.id.clone());
            let prompt = with_style(format!(
                "Character reference portrait of {}: {}. Neutral background, full figure.",
                character.name, character.description
            ));
            let path = asset_path(dir, &target, GenerationKind::Image);
            tasks.push(Task::new(target, GenerationKind::Image, prompt, vec![], path));
        }
        for location in &model.locations {
            if options.skip_succeeded && location.reference_image.is_some() {
                continue;
            }
            let target = AssetTarget::Location(location.id.clone());
            let prompt = with_style(format!(
                "Establishing shot of {}: {}. No people.",
                location.name, location.description
            ));
            let path = asset_path(dir, &target, GenerationKind::Image);
            tasks.push(Task::new(target, GenerationKind::Image, prompt, vec![], path));
        }
    }

    // Portraits produced by this queue, by target
    let queued: HashMap<AssetTarget, (String, PathBuf)> = tasks
        .iter()
        .map(|t| (t.target.clone(), (t.id.clone(), t.output_path.clone())))
        .collect();

    for scene in &model.scenes {
        let target = AssetTarget::Scene(scene.ordinal);
        let image_path = asset_path(dir, &target, GenerationKind::Image);
        let mut image_task = None;

        if !(options.skip_succeeded && scene.image_result.is_some()) {
            let (references, depends_on) = scene_references(model, scene, &queued);
            let task = Task::new(
                target.clone(),
                GenerationKind::Image,
                scene.image_prompt.clone(),
                references,
                image_path.clone(),
            )
            .after(depends_on);
            image_task = Some(task.id.clone());
            tasks.push(task);
        }

        if options.video && !(options.skip_succeeded && scene.video_result.is_some()) {
            let prompt = scene
                .video_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| scene.image_prompt.clone());
            let start_frame = match (&image_task, &scene.image_result) {
                (None, Some(stored)) => PathBuf::from(stored),
                _ => image_path,
            };
            let path = asset_path(dir, &target, GenerationKind::Video);
            tasks.push(
                Task::new(target, GenerationKind::Video, prompt, vec![start_frame], path)
                    .after(image_task.into_iter().collect()),
            );
        }
    }

    Ok(TaskQueue::new(tasks))
}

/// Reference images of the characters and locations on screen, with the
/// ids of the queued tasks that produce them.
///
/// A portrait queued in this run wins over a stored one. Characters and
/// locations with neither contribute nothing.
fn scene_references(
    model: &StoryModel,
    scene: &Scene,
    queued: &HashMap<AssetTarget, (String, PathBuf)>,
) -> (Vec<PathBuf>, Vec<String>) {
    let characters = scene.characters.iter().filter_map(|id| {
        let character = model.character(id)?;
        Some((AssetTarget::Character(character.id.clone()), character.reference_image.as_ref()))
    });
    let locations = scene.locations.iter().filter_map(|id| {
        let location = model.location(id)?;
        Some((AssetTarget::Location(location.id.clone()), location.reference_image.as_ref()))
    });

    let mut references = Vec::new();
    let mut depends_on = Vec::new();
    for (target, stored) in characters.chain(locations) {
        if let Some((task_id, path)) = queued.get(&target) {
            references.push(path.clone());
            depends_on.push(task_id.clone());
        } else if let Some(image) = stored {
            references.push(PathBuf::from(image));
        }
    }
    (references, depends_on)
}
