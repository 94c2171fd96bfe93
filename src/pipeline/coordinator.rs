//! Run-level control of the step sequence.

use super::{RunStatus, StepExecutor, StepId};
use crate::error::{Result, ScenecastError};
use crate::store::StoryStore;
use crate::story::StoryModel;
use crate::transcription::Transcript;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Persistent state of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    /// Consecutive failures of `failed_step`.
    pub failures: u32,
    pub failed_step: Option<StepId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::NotStarted,
            failures: 0,
            failed_step: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn record_success(&mut self, next: Option<StepId>) {
        self.failures = 0;
        self.failed_step = None;
        self.last_error = None;
        self.set_status(next.map(RunStatus::RunningStep).unwrap_or(RunStatus::Completed));
    }

    /// Count a failure of `step`; returns the consecutive failure count.
    fn record_failure(&mut self, step: StepId, error: &str) -> u32 {
        if self.failed_step == Some(step) {
            self.failures += 1;
        } else {
            self.failed_step = Some(step);
            self.failures = 1;
        }
        self.last_error = Some(error.to_string());
        self.set_status(RunStatus::StepFailed(step));
        self.failures
    }
}

/// Drives a run through the ordered steps, checkpointing after each one.
///
/// The model is written to the store before the record moves past a step,
/// so a crash between the two writes re-enters at the right step: resume
/// always starts from the first step whose output is missing.
pub struct PipelineCoordinator {
    executor: StepExecutor,
    store: Arc<dyn StoryStore>,
    max_step_failures: u32,
}

impl PipelineCoordinator {
    pub fn new(executor: StepExecutor, store: Arc<dyn StoryStore>, max_step_failures: u32) -> Self {
        Self {
            executor,
            store,
            max_step_failures: max_step_failures.max(1),
        }
    }

    /// Start a new run seeded with `captions`.
    #[instrument(skip(self, captions, cancel))]
    pub async fn start(
        &self,
        run_id: &str,
        captions: Transcript,
        cancel: &CancellationToken,
    ) -> Result<(StoryModel, RunRecord)> {
        if self.store.load_record(run_id).await?.is_some() {
            return Err(ScenecastError::RunExists(run_id.to_string()));
        }

        let model = StoryModel::new(run_id, captions);
        let record = RunRecord::new(run_id);
        self.store.save(&model).await?;
        self.store.save_record(&record).await?;
        info!(captions = model.captions.segments.len(), "Run created");

        self.run(model, record, cancel).await
    }

    /// Continue a run from the first step whose output is missing.
    #[instrument(skip(self, cancel))]
    pub async fn resume(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(StoryModel, RunRecord)> {
        let record = self
            .store
            .load_record(run_id)
            .await?
            .ok_or_else(|| ScenecastError::RunNotFound(run_id.to_string()))?;
        let model = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ScenecastError::RunNotFound(run_id.to_string()))?;

        if let RunStatus::Abandoned(step) = record.status {
            return Err(ScenecastError::RunAbandoned {
                run_id: run_id.to_string(),
                step,
            });
        }

        info!(
            completed = model.completed_steps().len(),
            status = %record.status,
            "Resuming run"
        );
        self.run(model, record, cancel).await
    }

    /// Current record of a run.
    pub async fn status(&self, run_id: &str) -> Result<RunRecord> {
        self.store
            .load_record(run_id)
            .await?
            .ok_or_else(|| ScenecastError::RunNotFound(run_id.to_string()))
    }

    async fn run(
        &self,
        mut model: StoryModel,
        mut record: RunRecord,
        cancel: &CancellationToken,
    ) -> Result<(StoryModel, RunRecord)> {
        loop {
            let Some(step) = model.first_missing_step() else {
                if record.status != RunStatus::Completed {
                    record.record_success(None);
                    self.store.save_record(&record).await?;
                }
                info!("Run completed with {} scenes", model.scenes.len());
                return Ok((model, record));
            };

            if cancel.is_cancelled() {
                info!(next = %step, "Run stopped before step");
                return Ok((model, record));
            }

            record.set_status(RunStatus::RunningStep(step));
            self.store.save_record(&record).await?;

            let result = match self.executor.run_step(step, &model).await {
                Ok(output) => model.merge(output),
                Err(e) => Err(e),
            };

            match result {
                Ok(merged) => {
                    self.store.save(&merged).await?;
                    model = merged;
                    record.record_success(step.next());
                    self.store.save_record(&record).await?;
                    info!(step = %step, "Step committed");
                }
                Err(e @ ScenecastError::PrerequisiteMissing { .. }) => return Err(e),
                Err(e) => {
                    let failures = record.record_failure(step, &e.to_string());
                    if failures >= self.max_step_failures {
                        warn!(step = %step, failures, "Abandoning run");
                        record.set_status(RunStatus::Abandoned(step));
                    } else {
                        warn!(step = %step, failures, "Step failed: {}", e);
                    }
                    self.store.save_record(&record).await?;
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Prompts;
    use crate::error::ServiceError;
    use crate::pipeline::ExecutorConfig;
    use crate::store::{MemoryStoryStore, SqliteStoryStore};
    use crate::tasks::{derive_tasks, DeriveOptions, TaskState};
    use crate::testing::{captions, complete_model, ScriptedTextGenerator};
    use std::time::Duration;

    fn coordinator(
        generator: Arc<ScriptedTextGenerator>,
        store: Arc<dyn StoryStore>,
        max_step_failures: u32,
    ) -> PipelineCoordinator {
        let executor = StepExecutor::new(
            generator,
            Prompts::default(),
            ExecutorConfig {
                max_attempts: 1,
                retry_delay: Duration::ZERO,
            },
        );
        PipelineCoordinator::new(executor, store, max_step_failures)
    }

    #[tokio::test]
    async fn test_end_to_end_three_captions() {
        let expected = complete_model("run-e2e", 3);
        let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
        let store = Arc::new(MemoryStoryStore::new());
        let coordinator = coordinator(generator.clone(), store.clone(), 3);

        let (model, record) = coordinator
            .start("run-e2e", captions(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(model.segments.len(), 3);
        assert!(!model.characters.is_empty());
        assert!(!model.locations.is_empty());
        assert_eq!(model.scenes.len(), model.scene_plan.len());
        assert_eq!(generator.total_calls(), StepId::ALL.len());

        let queue = derive_tasks(&model, &DeriveOptions::default()).unwrap();
        let tasks = queue.snapshot();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.state == TaskState::Pending));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let generator = Arc::new(ScriptedTextGenerator::for_model(&complete_model("dup", 1)));
        let store = Arc::new(MemoryStoryStore::new());
        let coordinator = coordinator(generator, store, 3);
        let cancel = CancellationToken::new();

        coordinator.start("dup", captions(), &cancel).await.unwrap();
        let again = coordinator.start("dup", captions(), &cancel).await;
        assert!(matches!(again, Err(ScenecastError::RunExists(_))));
    }

    #[tokio::test]
    async fn test_failed_step_then_resume_skips_completed_steps() {
        let expected = complete_model("run-r", 2);
        let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
        generator.push(
            "director_plan",
            Err(ServiceError::Rejected("content policy".to_string())),
        );
        let store = Arc::new(MemoryStoryStore::new());
        let coordinator = coordinator(generator.clone(), store.clone(), 3);
        let cancel = CancellationToken::new();

        let err = coordinator.start("run-r", captions(), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            ScenecastError::StepGenerationFailed { step: StepId::DirectorPlan, .. }
        ));
        let record = coordinator.status("run-r").await.unwrap();
        assert_eq!(record.status, RunStatus::StepFailed(StepId::DirectorPlan));
        assert!(record.last_error.is_some());

        let checkpoint = store.load("run-r").await.unwrap().unwrap();
        assert_eq!(checkpoint.first_missing_step(), Some(StepId::DirectorPlan));

        let (model, record) = coordinator.resume("run-r", &cancel).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.failures, 0);
        assert!(model.is_terminal());

        for step in [StepId::Analysis, StepId::Segmentation, StepId::Characters, StepId::Locations] {
            assert_eq!(generator.calls(step.name()), 1, "{} was re-run", step);
        }
        assert_eq!(generator.calls("director_plan"), 2);
    }

    #[tokio::test]
    async fn test_stop_after_step_three_and_recover() {
        let expected = complete_model("run-c", 3);

        let uninterrupted = {
            let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
            let store = Arc::new(MemoryStoryStore::new());
            coordinator(generator, store, 3)
                .start("run-c", captions(), &CancellationToken::new())
                .await
                .unwrap()
                .0
        };

        let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
        let store = Arc::new(MemoryStoryStore::new());
        let coordinator = coordinator(generator.clone(), store.clone(), 3);

        let stop = CancellationToken::new();
        generator.cancel_on("locations", stop.clone());
        let (partial, record) = coordinator.start("run-c", captions(), &stop).await.unwrap();
        assert_eq!(partial.first_missing_step(), Some(StepId::DirectorPlan));
        assert_eq!(record.status, RunStatus::RunningStep(StepId::DirectorPlan));
        assert_eq!(generator.calls("director_plan"), 0);

        let (resumed, record) = coordinator
            .resume("run-c", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(resumed, uninterrupted);
        assert_eq!(generator.calls("locations"), 1);
        assert_eq!(generator.calls("director_plan"), 1);
    }

    #[tokio::test]
    async fn test_resume_from_reopened_database() {
        let expected = complete_model("run-db", 3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");

        let uninterrupted = {
            let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
            coordinator(generator, Arc::new(MemoryStoryStore::new()), 3)
                .start("run-db", captions(), &CancellationToken::new())
                .await
                .unwrap()
                .0
        };

        {
            let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
            let store = Arc::new(SqliteStoryStore::new(&path).unwrap());
            let stop = CancellationToken::new();
            generator.cancel_on("locations", stop.clone());
            let (partial, _) = coordinator(generator, store, 3)
                .start("run-db", captions(), &stop)
                .await
                .unwrap();
            assert_eq!(partial.first_missing_step(), Some(StepId::DirectorPlan));
        }

        // A new process: fresh store handle and generator
        let generator = Arc::new(ScriptedTextGenerator::for_model(&expected));
        let store = Arc::new(SqliteStoryStore::new(&path).unwrap());
        let record = store.load_record("run-db").await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::RunningStep(StepId::DirectorPlan));

        let (resumed, record) = coordinator(generator.clone(), store.clone(), 3)
            .resume("run-db", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(resumed, uninterrupted);
        for step in [StepId::Analysis, StepId::Segmentation, StepId::Characters, StepId::Locations] {
            assert_eq!(generator.calls(step.name()), 0, "{} was re-run", step);
        }
        assert_eq!(generator.calls("director_plan"), 1);
        assert_eq!(store.load("run-db").await.unwrap().unwrap(), uninterrupted);
    }

    #[tokio::test]
    async fn test_repeated_failures_abandon_run() {
        let generator = Arc::new(ScriptedTextGenerator::new());
        generator.set_default("analysis", "not json".to_string());
        let store = Arc::new(MemoryStoryStore::new());
        let coordinator = coordinator(generator.clone(), store, 2);
        let cancel = CancellationToken::new();

        assert!(coordinator.start("run-a", captions(), &cancel).await.is_err());
        assert!(coordinator.resume("run-a", &cancel).await.is_err());

        let record = coordinator.status("run-a").await.unwrap();
        assert_eq!(record.status, RunStatus::Abandoned(StepId::Analysis));
        assert_eq!(record.failures, 2);

        let refused = coordinator.resume("run-a", &cancel).await;
        assert!(matches!(refused, Err(ScenecastError::RunAbandoned { .. })));
        assert_eq!(generator.calls("analysis"), 2);
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let generator = Arc::new(ScriptedTextGenerator::new());
        let coordinator = coordinator(generator, Arc::new(MemoryStoryStore::new()), 3);
        let result = coordinator.resume("ghost", &CancellationToken::new()).await;
        assert!(matches!(result, Err(ScenecastError::RunNotFound(_))));
    }
}
