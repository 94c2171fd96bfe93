//! Run control surface for Scenecast.
//!
//! Wires the pipeline coordinator, the story store and the worker pool
//! together behind start/resume/status/generate/export.

use crate::config::{Prompts, Settings};
use crate::error::{Result, ScenecastError};
use crate::generation::GenerationKind;
use crate::llm::{OpenAITextGenerator, TextGenerator};
use crate::pipeline::{ExecutorConfig, PipelineCoordinator, RunRecord, StepExecutor, StepId};
use crate::store::{SqliteStoryStore, StoryStore};
use crate::story::{SceneStatus, StoryModel};
use crate::tasks::{derive_tasks, DeriveOptions, TaskQueue};
use crate::transcription::Transcript;
use crate::worker::{PoolConfig, PoolReport, WorkerPool, WorkerSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// The main orchestrator for Scenecast runs.
pub struct Orchestrator {
    settings: Settings,
    store: Arc<dyn StoryStore>,
    coordinator: PipelineCoordinator,
    sessions: Option<Vec<Arc<WorkerSession>>>,
}

impl Orchestrator {
    /// Create an orchestrator backed by OpenAI and the SQLite store.
    pub fn new(settings: Settings) -> Result<Self> {
        let prompts = Prompts::load(
            settings.prompts.custom_dir.as_deref(),
            Some(&settings.prompts.variables),
        )?;
        let generator: Arc<dyn TextGenerator> = Arc::new(OpenAITextGenerator::new(&settings.pipeline)?);
        let store: Arc<dyn StoryStore> = Arc::new(SqliteStoryStore::new(&settings.sqlite_path())?);

        Ok(Self::with_components(settings, prompts, generator, store))
    }

    /// Create an orchestrator with custom components.
    pub fn with_components(
        settings: Settings,
        prompts: Prompts,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn StoryStore>,
    ) -> Self {
        let executor = StepExecutor::new(
            generator,
            prompts,
            ExecutorConfig::from_settings(&settings.pipeline),
        );
        let coordinator =
            PipelineCoordinator::new(executor, store.clone(), settings.pipeline.max_step_failures);

        Self {
            settings,
            store,
            coordinator,
            sessions: None,
        }
    }

    /// Use these sessions for generation instead of building them from the accounts.
    pub fn with_sessions(mut self, sessions: Vec<Arc<WorkerSession>>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn StoryStore> {
        self.store.clone()
    }

    /// Create a run from captions and drive it through the pipeline.
    pub async fn start(
        &self,
        run_id: &str,
        captions: Transcript,
        cancel: &CancellationToken,
    ) -> Result<(StoryModel, RunRecord)> {
        validate_run_id(run_id)?;
        self.coordinator.start(run_id, captions, cancel).await
    }

    /// Continue a run from its first missing step.
    pub async fn resume(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(StoryModel, RunRecord)> {
        self.coordinator.resume(run_id, cancel).await
    }

    /// Where a run stands.
    pub async fn status(&self, run_id: &str) -> Result<RunSummary> {
        let record = self.coordinator.status(run_id).await?;
        let model = self.show(run_id).await?;
        Ok(RunSummary::new(record, &model))
    }

    /// Every known run, most recently updated first.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        self.store.list_records().await
    }

    /// The stored story model of a run.
    pub async fn show(&self, run_id: &str) -> Result<StoryModel> {
        self.store
            .load(run_id)
            .await?
            .ok_or_else(|| ScenecastError::RunNotFound(run_id.to_string()))
    }

    /// Derive the tasks still missing for a completed run.
    ///
    /// Work that already succeeded is skipped, so calling this again after a
    /// partial generation only queues the failed and unattempted assets.
    #[instrument(skip(self, options))]
    pub async fn plan_generation(&self, run_id: &str, options: &GenerateOptions) -> Result<Arc<TaskQueue>> {
        let model = self.show(run_id).await?;
        let output_dir = self.settings.run_output_dir(run_id);
        let queue = derive_tasks(
            &model,
            &DeriveOptions {
                video: options.video,
                reference_images: options.reference_images,
                skip_succeeded: true,
                output_dir: output_dir.clone(),
            },
        )?;

        for task in queue.snapshot() {
            if let Some(parent) = task.output_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!(tasks = queue.len(), dir = %output_dir.display(), "Planned generation");
        Ok(Arc::new(queue))
    }

    /// Drain a planned queue with the worker pool.
    pub async fn run_generation(
        &self,
        run_id: &str,
        queue: Arc<TaskQueue>,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerateResult> {
        let mut generation = self.settings.generation.clone();
        if let Some(workers) = options.workers {
            generation.workers = workers.max(1);
        }

        let pool = match &self.sessions {
            Some(sessions) => WorkerPool::new(
                sessions.clone(),
                self.store.clone(),
                PoolConfig::from_settings(&generation),
            ),
            None => WorkerPool::from_settings(&generation, &self.settings.accounts, self.store.clone())?,
        };

        let report = pool.run(run_id, queue, cancel).await?;
        let model = self.show(run_id).await?;
        Ok(GenerateResult { report, model })
    }

    /// Plan and run generation for a completed run.
    pub async fn generate(
        &self,
        run_id: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerateResult> {
        let queue = self.plan_generation(run_id, options).await?;
        self.run_generation(run_id, queue, options, cancel).await
    }

    /// Copy generated scene assets into a visual directory with a manifest.
    ///
    /// Defaults to `<visual_dir>/<run_id>`. Scenes without assets are listed
    /// in the manifest with no files and reported as missing.
    #[instrument(skip(self))]
    pub async fn export(&self, run_id: &str, output: Option<PathBuf>) -> Result<ExportResult> {
        let model = self.show(run_id).await?;
        if !model.is_terminal() {
            return Err(ScenecastError::ModelIncomplete(format!(
                "run '{}' has no scenes to export yet",
                run_id
            )));
        }

        let dir = output.unwrap_or_else(|| self.settings.visual_dir().join(run_id));
        std::fs::create_dir_all(&dir)?;

        let mut scenes = Vec::new();
        let mut missing = Vec::new();
        let mut copied = 0;

        for scene in &model.scenes {
            let id = scene.id();
            let image = copy_asset(scene.image_result.as_deref(), &dir, "img", &id, GenerationKind::Image)?;
            let video = copy_asset(scene.video_result.as_deref(), &dir, "video", &id, GenerationKind::Video)?;
            copied += usize::from(image.is_some()) + usize::from(video.is_some());
            if image.is_none() {
                missing.push(id.clone());
            }

            let duration_seconds = model
                .scene_plan
                .iter()
                .find(|p| p.ordinal == scene.ordinal)
                .map(|p| p.duration_seconds);

            scenes.push(ManifestScene {
                id,
                ordinal: scene.ordinal,
                status: scene.status,
                duration_seconds,
                image_prompt: scene.image_prompt.clone(),
                video_prompt: scene.video_prompt.clone(),
                image,
                video,
                error: scene.last_error().map(str::to_string),
            });
        }

        let manifest = Manifest {
            run_id: run_id.to_string(),
            exported_at: Utc::now(),
            visual_style: model.analysis.as_ref().map(|a| a.visual_style.clone()),
            scenes,
        };
        let manifest_path = dir.join("manifest.json");
        write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;

        if !missing.is_empty() {
            warn!(missing = missing.len(), "Exported run with scenes lacking images");
        }
        info!(copied, dir = %dir.display(), "Exported run");

        Ok(ExportResult {
            dir,
            manifest_path,
            scenes: model.scenes.len(),
            copied,
            missing,
        })
    }
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !run_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ScenecastError::InvalidInput(format!(
            "Invalid run id '{}': use letters, digits, '-', '_' or '.'",
            run_id
        )))
    }
}

/// Copy one asset into `dir/folder`, returning its path relative to `dir`.
fn copy_asset(
    source: Option<&str>,
    dir: &Path,
    folder: &str,
    id: &str,
    kind: GenerationKind,
) -> Result<Option<String>> {
    let Some(source) = source.map(Path::new).filter(|p| p.is_file()) else {
        return Ok(None);
    };
    let relative = format!("{}/{}.{}", folder, id, kind.extension());
    let target = dir.join(&relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, &target)?;
    Ok(Some(relative))
}

/// Write `bytes` to `path` through a temporary file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| ScenecastError::Io(e.error))?;
    Ok(())
}

/// Options for a generation pass.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub video: bool,
    pub reference_images: bool,
    /// Overrides the configured number of sessions.
    pub workers: Option<usize>,
}

/// Result of a generation pass.
#[derive(Debug)]
pub struct GenerateResult {
    pub report: PoolReport,
    /// The model as stored after the pass.
    pub model: StoryModel,
}

/// Status of a run with counts taken from its model.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub record: RunRecord,
    pub completed_steps: Vec<StepId>,
    pub scenes: usize,
    pub generated: usize,
    pub failed: usize,
}

impl RunSummary {
    fn new(record: RunRecord, model: &StoryModel) -> Self {
        let count = |status: SceneStatus| model.scenes.iter().filter(|s| s.status == status).count();
        Self {
            completed_steps: model.completed_steps(),
            scenes: model.scenes.len(),
            generated: count(SceneStatus::Generated),
            failed: count(SceneStatus::Failed),
            record,
        }
    }
}

/// Result of an export.
#[derive(Debug)]
pub struct ExportResult {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub scenes: usize,
    /// Files copied.
    pub copied: usize,
    /// Scenes without an image.
    pub missing: Vec<String>,
}

/// Manifest written next to exported assets.
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub exported_at: DateTime<Utc>,
    pub visual_style: Option<String>,
    pub scenes: Vec<ManifestScene>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestScene {
    pub id: String,
    pub ordinal: u32,
    pub status: SceneStatus,
    pub duration_seconds: Option<f64>,
    pub image_prompt: String,
    pub video_prompt: Option<String>,
    /// Paths relative to the export directory.
    pub image: Option<String>,
    pub video: Option<String>,
    pub error: Option<String>,
}
