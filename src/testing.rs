//! Fixtures and test doubles shared by unit tests.

use crate::error::ServiceError;
use crate::generation::{GenerationClient, GenerationRequest, GenerationResult};
use crate::llm::{CompletionRequest, TextGenerator};
use crate::pipeline::StepId;
use crate::story::{
    Character, DirectorPlanEntry, Location, Scene, ScenePlanEntry, SceneStatus, StoryAnalysis,
    StoryModel, StorySegment,
};
use crate::transcription::{Transcript, TranscriptSegment};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Three-caption transcript.
pub fn captions() -> Transcript {
    Transcript::new(
        "lighthouse".to_string(),
        vec![
            TranscriptSegment::new(0.0, 6.5, "The keeper climbed the tower every night.".to_string()),
            TranscriptSegment::new(6.5, 14.0, "One night the storm took the lamp.".to_string()),
            TranscriptSegment::new(14.0, 21.0, "He lit it again with his own hands.".to_string()),
        ],
    )
}

/// A model holding only the caption seed.
pub fn seed_model(run_id: &str) -> StoryModel {
    StoryModel::new(run_id, captions())
}

/// A terminal, fully valid model with `n` segments, plan entries and scenes.
pub fn complete_model(run_id: &str, n: u32) -> StoryModel {
    let mut model = seed_model(run_id);
    let (analysis, segments, characters, locations, director_plan, scene_plan, scenes) = tables(n);
    model.analysis = Some(analysis);
    model.segments = segments;
    model.characters = characters;
    model.locations = locations;
    model.director_plan = director_plan;
    model.scene_plan = scene_plan;
    model.scenes = scenes;
    model
}

#[allow(clippy::type_complexity)]
fn tables(
    n: u32,
) -> (
    StoryAnalysis,
    Vec<StorySegment>,
    Vec<Character>,
    Vec<Location>,
    Vec<DirectorPlanEntry>,
    Vec<ScenePlanEntry>,
    Vec<Scene>,
) {
    let analysis = StoryAnalysis {
        theme: "duty".to_string(),
        tone: "somber".to_string(),
        arc: "a keeper restores the light".to_string(),
        summary: "A lighthouse keeper relights the lamp during a storm.".to_string(),
        visual_style: "muted oil painting".to_string(),
    };
    let segments = (1..=n)
        .map(|i| StorySegment {
            index: i,
            start_seconds: f64::from(i - 1) * 7.0,
            end_seconds: f64::from(i) * 7.0,
            text: format!("Narration part {}", i),
            beat: "rising".to_string(),
        })
        .collect();
    let characters = vec![
        Character {
            id: "nv1".to_string(),
            name: "Keeper".to_string(),
            description: "weathered man in an oilskin coat".to_string(),
            reference_image: None,
        },
        Character {
            id: "nv2".to_string(),
            name: "Gull".to_string(),
            description: "a grey gull with a torn wing".to_string(),
            reference_image: None,
        },
    ];
    let locations = vec![Location {
        id: "loc1".to_string(),
        name: "Lighthouse".to_string(),
        description: "white stone tower on black rocks".to_string(),
        reference_image: None,
    }];
    let director_plan = (1..=n)
        .map(|i| DirectorPlanEntry {
            index: i,
            segment_index: i,
            camera: "slow push-in".to_string(),
            pacing: "lingering".to_string(),
            intent: format!("Beat {}", i),
        })
        .collect();
    let scene_plan = (1..=n)
        .map(|i| ScenePlanEntry {
            ordinal: i,
            plan_index: i,
            duration_seconds: 7.0,
            characters: vec!["nv1".to_string()],
            locations: vec!["loc1".to_string()],
            description: format!("Scene {}", i),
        })
        .collect();
    let scenes = (1..=n)
        .map(|i| Scene {
            ordinal: i,
            image_prompt: format!("Keeper in the lighthouse, moment {}", i),
            video_prompt: Some("camera drifts upward".to_string()),
            characters: vec!["nv1".to_string()],
            locations: vec!["loc1".to_string()],
            status: SceneStatus::Pending,
            image_result: None,
            video_result: None,
            image_error: None,
            video_error: None,
        })
        .collect();
    (analysis, segments, characters, locations, director_plan, scene_plan, scenes)
}

/// The response a well-behaved model would give for `step`, built from `model`.
pub fn canned_response(model: &StoryModel, step: StepId) -> String {
    let rows = match step {
        StepId::Analysis => serde_json::to_value(&model.analysis),
        StepId::Segmentation => serde_json::to_value(&model.segments),
        StepId::Characters => serde_json::to_value(&model.characters),
        StepId::Locations => serde_json::to_value(&model.locations),
        StepId::DirectorPlan => serde_json::to_value(&model.director_plan),
        StepId::ScenePlan => serde_json::to_value(&model.scene_plan),
        StepId::ScenePrompts => serde_json::to_value(&model.scenes),
    }
    .unwrap();
    let mut body = serde_json::Map::new();
    body.insert(step.output_key().to_string(), rows);
    let body = serde_json::Value::Object(body);
    format!("Here is the result:\n```json\n{}\n```", body)
}

/// Text generator replaying canned responses, keyed by request label.
#[derive(Default)]
pub struct ScriptedTextGenerator {
    queued: Mutex<HashMap<String, VecDeque<Result<String, ServiceError>>>>,
    defaults: Mutex<HashMap<String, String>>,
    calls: Mutex<HashMap<String, usize>>,
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
}

impl ScriptedTextGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every step with the rows of `model`.
    pub fn for_model(model: &StoryModel) -> Self {
        let generator = Self::new();
        for step in StepId::ALL {
            generator.set_default(step.name(), canned_response(model, step));
        }
        generator
    }

    pub fn set_default(&self, label: &str, response: String) {
        self.defaults.lock().unwrap().insert(label.to_string(), response);
    }

    /// Queue a one-off response served before the default.
    pub fn push(&self, label: &str, response: Result<String, ServiceError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(response);
    }

    /// Cancel `token` when a request labelled `label` is served.
    pub fn cancel_on(&self, label: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((label.to_string(), token));
    }

    pub fn calls(&self, label: &str) -> usize {
        self.calls.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        *self.calls.lock().unwrap().entry(request.label.clone()).or_default() += 1;

        if let Some((label, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if *label == request.label {
                token.cancel();
            }
        }

        if let Some(queued) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&request.label)
            .and_then(|q| q.pop_front())
        {
            return queued;
        }

        self.defaults
            .lock()
            .unwrap()
            .get(&request.label)
            .cloned()
            .ok_or_else(|| ServiceError::Rejected(format!("no scripted response for {}", request.label)))
    }
}

/// Generation client with scripted per-task outcomes. Unscripted tasks succeed.
#[derive(Default)]
pub struct ScriptedClient {
    outcomes: Mutex<HashMap<String, VecDeque<ServiceError>>>,
    delays: Mutex<HashMap<String, Duration>>,
    always: Mutex<Option<ServiceError>>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<GenerationRequest>>,
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
    require_references: Mutex<bool>,
    produced: Mutex<HashSet<PathBuf>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call for `task_id` with `error`.
    pub fn fail_next(&self, task_id: &str, error: ServiceError) -> &Self {
        self.outcomes
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push_back(error);
        self
    }

    /// Fail every call with `error`.
    pub fn fail_always(&self, error: ServiceError) -> &Self {
        *self.always.lock().unwrap() = Some(error);
        self
    }

    /// Delay calls for `task_id`.
    pub fn delay(&self, task_id: &str, delay: Duration) -> &Self {
        self.delays.lock().unwrap().insert(task_id.to_string(), delay);
        self
    }

    /// Cancel `token` when `task_id` is requested.
    pub fn cancel_on(&self, task_id: &str, token: CancellationToken) -> &Self {
        *self.cancel_on.lock().unwrap() = Some((task_id.to_string(), token));
        self
    }

    /// Reject requests whose references this client has not produced yet.
    pub fn require_references(&self) -> &Self {
        *self.require_references.lock().unwrap() = true;
        self
    }

    /// Task ids in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task_id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == task_id).count()
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, ServiceError> {
        self.calls.lock().unwrap().push(request.task_id.clone());
        self.requests.lock().unwrap().push(request.clone());
        if let Some((task_id, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if *task_id == request.task_id {
                token.cancel();
            }
        }
        if *self.require_references.lock().unwrap() {
            let produced = self.produced.lock().unwrap();
            if let Some(missing) = request.references.iter().find(|r| !produced.contains(*r)) {
                return Err(ServiceError::Rejected(format!(
                    "reference image {} does not exist",
                    missing.display()
                )));
            }
        }

        let delay = self.delays.lock().unwrap().get(&request.task_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.always.lock().unwrap().clone() {
            return Err(error);
        }
        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&request.task_id)
            .and_then(|q| q.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        self.produced.lock().unwrap().insert(request.output_path.clone());
        Ok(GenerationResult {
            uri: format!("mem://{}", request.task_id),
            local_path: Some(request.output_path.clone()),
        })
    }
}
