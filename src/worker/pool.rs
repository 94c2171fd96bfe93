//! Fixed pool of worker sessions draining a task queue.

use super::{BackoffPolicy, RateLimitPolicy, SessionStats, WorkerSession};
use crate::config::{AccountSettings, GenerationSettings};
use crate::error::{Result, ScenecastError, ServiceError};
use crate::generation::{create_client, GenerationKind, GenerationRequest};
use crate::store::StoryStore;
use crate::story::{AssetOutcome, AssetTarget};
use crate::tasks::{NextTask, Task, TaskQueue, TaskState};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Retry and timing bounds of the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Attempts per task before it fails terminally.
    pub max_attempts: u32,
    pub task_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitPolicy,
}

impl PoolConfig {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            task_timeout: settings.task_timeout(),
            backoff: BackoffPolicy::from_settings(&settings.backoff),
            rate_limit: RateLimitPolicy::from_settings(&settings.rate_limit),
        }
    }
}

/// A task that failed terminally.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task_id: String,
    pub target: AssetTarget,
    pub kind: GenerationKind,
    pub attempts: u32,
    pub error: String,
}

/// Overall result of draining a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// Every task succeeded.
    Success,
    /// Some tasks failed, were never attempted, or were not saved.
    PartialSuccess,
    /// Dispatch was stopped by cancellation.
    Cancelled,
}

/// Report of one pool run.
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub run_id: String,
    pub succeeded: usize,
    pub failures: Vec<TaskFailure>,
    /// Tasks left without a terminal state.
    pub unattempted: usize,
    /// Tasks whose outcome could not be written to the store; `error` is
    /// the store error.
    pub unsaved: Vec<TaskFailure>,
    pub cancelled: bool,
    pub outcome: PoolOutcome,
    pub sessions: Vec<SessionStats>,
}

/// Error text of tasks failed because no session can take them.
pub const NO_HEALTHY_SESSIONS: &str = "no healthy sessions";

/// State shared by the slots of one `run`.
struct RunScope<'a> {
    run_id: &'a str,
    queue: &'a TaskQueue,
    cancel: &'a CancellationToken,
    unsaved: Mutex<Vec<TaskFailure>>,
}

/// Fixed set of account-bound sessions.
pub struct WorkerPool {
    sessions: Vec<Arc<WorkerSession>>,
    store: Arc<dyn StoryStore>,
    config: PoolConfig,
}

/// Account index for each of `workers` sessions, round-robin.
pub(crate) fn assign_accounts(workers: usize, accounts: usize) -> Vec<usize> {
    if accounts == 0 {
        return Vec::new();
    }
    (0..workers.max(1)).map(|i| i % accounts).collect()
}

impl WorkerPool {
    pub fn new(sessions: Vec<Arc<WorkerSession>>, store: Arc<dyn StoryStore>, config: PoolConfig) -> Self {
        Self {
            sessions,
            store,
            config,
        }
    }

    /// Build `settings.workers` sessions over `accounts`, assigned round-robin.
    pub fn from_settings(
        settings: &GenerationSettings,
        accounts: &[AccountSettings],
        store: Arc<dyn StoryStore>,
    ) -> Result<Self> {
        if accounts.is_empty() {
            return Err(ScenecastError::Config(
                "No generation accounts configured. Add [[accounts]] to the config file.".to_string(),
            ));
        }
        if settings.workers > accounts.len() {
            warn!(
                workers = settings.workers,
                accounts = accounts.len(),
                "More sessions than accounts; some accounts back several sessions"
            );
        }

        let mut sessions = Vec::new();
        for (i, account_idx) in assign_accounts(settings.workers, accounts.len()).into_iter().enumerate() {
            let account = &accounts[account_idx];
            let client = create_client(settings, account)?;
            let id = format!("w{}-{}", i + 1, account.id);
            sessions.push(Arc::new(WorkerSession::new(id, &account.id, account.concurrency, client)));
        }

        Ok(Self::new(sessions, store, PoolConfig::from_settings(settings)))
    }

    pub fn sessions(&self) -> &[Arc<WorkerSession>] {
        &self.sessions
    }

    /// Drain `queue`, writing every terminal outcome to the store.
    ///
    /// A store write that fails is logged and listed in the report's
    /// `unsaved`; the other slots keep draining.
    #[instrument(skip(self, queue, cancel), fields(sessions = self.sessions.len()))]
    pub async fn run(
        &self,
        run_id: &str,
        queue: Arc<TaskQueue>,
        cancel: &CancellationToken,
    ) -> Result<PoolReport> {
        info!(tasks = queue.len(), "Dispatching generation tasks");

        let scope = RunScope {
            run_id,
            queue: &queue,
            cancel,
            unsaved: Mutex::new(Vec::new()),
        };
        let slots = self.sessions.iter().flat_map(|session| {
            (0..session.concurrency()).map(move |slot| (session.clone(), slot))
        });
        let results = join_all(slots.map(|(session, slot)| self.drive_slot(&scope, session, slot))).await;
        for result in results {
            result?;
        }

        let unsaved = scope
            .unsaved
            .into_inner()
            .map_err(|e| ScenecastError::Store(format!("Failed to collect unsaved outcomes: {}", e)))?;
        let report = self.report(run_id, &queue, unsaved, cancel.is_cancelled());
        info!(
            succeeded = report.succeeded,
            failed = report.failures.len(),
            unattempted = report.unattempted,
            unsaved = report.unsaved.len(),
            "Generation finished: {:?}",
            report.outcome
        );
        Ok(report)
    }

    fn all_dead(&self) -> bool {
        self.sessions.iter().all(|s| s.is_dead())
    }

    async fn drive_slot(&self, scope: &RunScope<'_>, session: Arc<WorkerSession>, slot: usize) -> Result<()> {
        let queue = scope.queue;
        let cancel = scope.cancel;
        let mut changes = queue.subscribe();

        loop {
            if cancel.is_cancelled() {
                debug!(session = session.id(), slot, "Dispatch cancelled");
                return Ok(());
            }

            if session.is_dead() {
                if self.all_dead() {
                    let failed = queue.fail_pending(NO_HEALTHY_SESSIONS)?;
                    if !failed.is_empty() {
                        warn!(tasks = failed.len(), "All sessions are dead; failing remaining tasks");
                    }
                    for task in &failed {
                        self.persist(scope, task, Err(NO_HEALTHY_SESSIONS.to_string())).await;
                    }
                }
                return Ok(());
            }

            if let Some(until) = session.cooling_until() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep_until(until) => {}
                }
                continue;
            }

            match queue.next_for(session.id())? {
                NextTask::Ready(task) => self.execute(scope, &session, task).await?,
                NextTask::Wait(at) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep_until(at) => {}
                        _ = changes.changed() => {}
                    }
                }
                NextTask::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = changes.changed() => {}
                    }
                }
                NextTask::Drained => return Ok(()),
            }
        }
    }

    async fn execute(&self, scope: &RunScope<'_>, session: &WorkerSession, task: Task) -> Result<()> {
        let queue = scope.queue;
        let task = queue.start(&task.id)?;
        session.begin(&task.id);

        let request = GenerationRequest {
            task_id: task.id.clone(),
            kind: task.kind,
            prompt: task.prompt.clone(),
            references: task.references.clone(),
            output_path: task.output_path.clone(),
        };

        debug!(session = session.id(), task = %task.id, attempt = task.attempts, "Generating");
        let result = match tokio::time::timeout(
            self.config.task_timeout,
            session.client().generate(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::TransientFault(format!(
                "timed out after {}s",
                self.config.task_timeout.as_secs()
            ))),
        };

        match result {
            Ok(generated) => {
                let reference = generated.reference();
                queue.complete(&task.id, &reference)?;
                session.end(&task.id, Some(true));
                info!(session = session.id(), task = %task.id, "Generated {}", task.target);
                self.persist(scope, &task, Ok(reference)).await;
            }
            Err(error) if error.is_retryable() => {
                let message = error.to_string();
                if matches!(error, ServiceError::RateLimited(_))
                    && session.record_rate_limit(&self.config.rate_limit)
                {
                    warn!(session = session.id(), "Rate limited repeatedly; cooling down");
                }
                queue.mark_retryable(&task.id, &message)?;

                if task.attempts >= self.config.max_attempts {
                    let dependents = queue.fail(&task.id, &message)?;
                    session.end(&task.id, Some(false));
                    warn!(task = %task.id, attempts = task.attempts, "Giving up: {}", message);
                    self.persist(scope, &task, Err(message)).await;
                    self.persist_dependents(scope, &dependents).await;
                } else {
                    let delay = self.config.backoff.delay(task.attempts);
                    queue.requeue(&task.id, delay)?;
                    session.end(&task.id, None);
                    debug!(task = %task.id, delay_ms = delay.as_millis() as u64, "Retrying: {}", message);
                }
            }
            Err(error) => {
                let message = error.to_string();
                let dependents = queue.fail(&task.id, &message)?;
                session.end(&task.id, Some(false));
                if let ServiceError::AccountSuspended(_) = error {
                    warn!(session = session.id(), account = session.account_id(), "Session is dead: {}", message);
                    session.mark_dead(&message);
                } else {
                    warn!(task = %task.id, "Rejected: {}", message);
                }
                self.persist(scope, &task, Err(message)).await;
                self.persist_dependents(scope, &dependents).await;
            }
        }
        Ok(())
    }

    async fn persist_dependents(&self, scope: &RunScope<'_>, dependents: &[Task]) {
        for task in dependents {
            let error = task.last_error.clone().unwrap_or_default();
            warn!(task = %task.id, "Not attempted: {}", error);
            self.persist(scope, task, Err(error)).await;
        }
    }

    /// Write one terminal outcome. A failed write is recorded in the scope.
    async fn persist(&self, scope: &RunScope<'_>, task: &Task, result: std::result::Result<String, String>) {
        let outcome = AssetOutcome {
            target: task.target.clone(),
            kind: task.kind,
            result,
        };
        if let Err(e) = self.store.record_outcome(scope.run_id, &outcome).await {
            error!(task = %task.id, "Failed to save outcome: {}", e);
            if let Ok(mut unsaved) = scope.unsaved.lock() {
                unsaved.push(TaskFailure {
                    task_id: task.id.clone(),
                    target: task.target.clone(),
                    kind: task.kind,
                    attempts: task.attempts,
                    error: e.to_string(),
                });
            }
        }
    }

    fn report(
        &self,
        run_id: &str,
        queue: &TaskQueue,
        unsaved: Vec<TaskFailure>,
        cancelled: bool,
    ) -> PoolReport {
        let tasks = queue.snapshot();
        let succeeded = tasks.iter().filter(|t| t.state == TaskState::Succeeded).count();
        let failures: Vec<TaskFailure> = tasks
            .iter()
            .filter(|t| t.state == TaskState::FailedTerminal)
            .map(|t| TaskFailure {
                task_id: t.id.clone(),
                target: t.target.clone(),
                kind: t.kind,
                attempts: t.attempts,
                error: t.last_error.clone().unwrap_or_default(),
            })
            .collect();
        let unattempted = tasks.iter().filter(|t| !t.state.is_terminal()).count();

        let outcome = if cancelled {
            PoolOutcome::Cancelled
        } else if failures.is_empty() && unattempted == 0 && unsaved.is_empty() {
            PoolOutcome::Success
        } else {
            PoolOutcome::PartialSuccess
        };

        PoolReport {
            run_id: run_id.to_string(),
            succeeded,
            failures,
            unattempted,
            unsaved,
            cancelled,
            outcome,
            sessions: self.sessions.iter().map(|s| s.stats()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStoryStore;
    use crate::story::SceneStatus;
    use crate::tasks::{derive_tasks, DeriveOptions};
    use crate::testing::{complete_model, ScriptedClient};
    use crate::worker::SessionHealth;
    use std::path::PathBuf;

    fn config(max_attempts: u32) -> PoolConfig {
        PoolConfig {
            max_attempts,
            task_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy {
                base: Duration::ZERO,
                max: Duration::ZERO,
                multiplier: 2.0,
            },
            rate_limit: RateLimitPolicy {
                threshold: 100,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
            },
        }
    }

    async fn setup(scenes: u32) -> (Arc<MemoryStoryStore>, Arc<TaskQueue>) {
        let store = Arc::new(MemoryStoryStore::new());
        let model = complete_model("run", scenes);
        store.save(&model).await.unwrap();
        let queue = Arc::new(derive_tasks(&model, &DeriveOptions::default()).unwrap());
        (store, queue)
    }

    fn session(id: &str, client: Arc<ScriptedClient>) -> Arc<WorkerSession> {
        Arc::new(WorkerSession::new(id, format!("acct-{}", id), 1, client))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let (store, queue) = setup(1).await;
        let client = Arc::new(ScriptedClient::new());
        client
            .fail_next("s001-image", ServiceError::TransientFault("reset".to_string()))
            .fail_next("s001-image", ServiceError::RateLimited("429".to_string()));

        let pool = WorkerPool::new(vec![session("w1", client.clone())], store.clone(), config(3));
        let report = pool.run("run", queue.clone(), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, PoolOutcome::Success);
        assert_eq!(client.calls_for("s001-image"), 3);
        let task = &queue.snapshot()[0];
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempts, 3);

        let model = store.load("run").await.unwrap().unwrap();
        assert_eq!(model.scene(1).unwrap().status, SceneStatus::Generated);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (store, queue) = setup(1).await;
        let client = Arc::new(ScriptedClient::new());
        client.fail_always(ServiceError::TransientFault("upstream 502".to_string()));

        let pool = WorkerPool::new(vec![session("w1", client.clone())], store.clone(), config(2));
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, PoolOutcome::PartialSuccess);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 2);
        assert_eq!(client.calls_for("s001-image"), 2);

        let model = store.load("run").await.unwrap().unwrap();
        let scene = model.scene(1).unwrap();
        assert_eq!(scene.status, SceneStatus::Failed);
        assert!(scene.last_error().unwrap().contains("upstream 502"));
    }

    #[tokio::test]
    async fn test_suspended_account_is_not_retried() {
        let (store, queue) = setup(3).await;
        let banned = Arc::new(ScriptedClient::new());
        banned.fail_always(ServiceError::AccountSuspended("account disabled".to_string()));
        let healthy = Arc::new(ScriptedClient::new());

        let pool = WorkerPool::new(
            vec![session("w1", banned.clone()), session("w2", healthy.clone())],
            store,
            config(5),
        );
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(banned.calls().len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 1);
        assert!(report.failures[0].error.contains("account disabled"));
        assert_eq!(report.succeeded, 2);
        assert_eq!(healthy.calls().len(), 2);
        assert!(matches!(report.sessions[0].health, SessionHealth::Dead { .. }));
        assert_eq!(report.outcome, PoolOutcome::PartialSuccess);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completion_persists_all() {
        let (store, queue) = setup(5).await;
        let slow = Arc::new(ScriptedClient::new());
        slow.delay("s001-image", Duration::from_secs(1))
            .delay("s003-image", Duration::from_secs(20));
        let fast = Arc::new(ScriptedClient::new());
        fast.delay("s002-image", Duration::from_secs(2));

        let pool = WorkerPool::new(
            vec![session("w1", slow.clone()), session("w2", fast.clone())],
            store.clone(),
            config(3),
        );
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, PoolOutcome::Success);

        // s004 and s005 finished on the fast session while s003 was in flight
        assert_eq!(slow.calls(), vec!["s001-image".to_string(), "s003-image".to_string()]);
        assert_eq!(
            fast.calls(),
            vec!["s002-image".to_string(), "s004-image".to_string(), "s005-image".to_string()]
        );

        let model = store.load("run").await.unwrap().unwrap();
        for ordinal in 1..=5 {
            let scene = model.scene(ordinal).unwrap();
            assert_eq!(scene.status, SceneStatus::Generated, "scene {}", ordinal);
        }
        assert!(model.scene(3).unwrap().image_result.as_deref().unwrap().ends_with("s003.png"));
        assert!(model.scene(5).unwrap().image_result.as_deref().unwrap().ends_with("s005.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_dispatch() {
        let (store, queue) = setup(3).await;
        let client = Arc::new(ScriptedClient::new());
        client.delay("s001-image", Duration::from_secs(10));
        let pool = WorkerPool::new(vec![session("w1", client.clone())], store, config(3));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = pool.run("run", queue, &cancel).await.unwrap();
        assert_eq!(report.outcome, PoolOutcome::Cancelled);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.unattempted, 2);
        assert_eq!(client.calls(), vec!["s001-image".to_string()]);
    }

    #[tokio::test]
    async fn test_all_sessions_dead_fails_remaining() {
        let (store, queue) = setup(4).await;
        let a = Arc::new(ScriptedClient::new());
        a.fail_always(ServiceError::AccountSuspended("403".to_string()));
        let b = Arc::new(ScriptedClient::new());
        b.fail_always(ServiceError::AccountSuspended("403".to_string()));

        let pool = WorkerPool::new(vec![session("w1", a), session("w2", b)], store.clone(), config(3));
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failures.len(), 4);
        assert_eq!(report.unattempted, 0);
        let unattempted: Vec<&TaskFailure> = report
            .failures
            .iter()
            .filter(|f| f.error == NO_HEALTHY_SESSIONS)
            .collect();
        assert_eq!(unattempted.len(), 2);
        assert!(unattempted.iter().all(|f| f.attempts == 0));

        let model = store.load("run").await.unwrap().unwrap();
        assert_eq!(model.failed_scenes().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_session_cools_down() {
        let (store, queue) = setup(1).await;
        let client = Arc::new(ScriptedClient::new());
        client
            .fail_next("s001-image", ServiceError::RateLimited("quota".to_string()))
            .fail_next("s001-image", ServiceError::RateLimited("quota".to_string()));

        let mut config = config(5);
        config.rate_limit = RateLimitPolicy {
            threshold: 2,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        };
        let pool = WorkerPool::new(vec![session("w1", client.clone())], store, config);

        let started = tokio::time::Instant::now();
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, PoolOutcome::Success);
        assert_eq!(client.calls_for("s001-image"), 3);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let (store, queue) = setup(1).await;
        let client = Arc::new(ScriptedClient::new());
        client.delay("s001-image", Duration::from_millis(200));

        let mut config = config(1);
        config.task_timeout = Duration::from_millis(10);
        let pool = WorkerPool::new(vec![session("w1", client)], store, config);
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("timed out"));
    }

    async fn setup_with_references(scenes: u32) -> (Arc<MemoryStoryStore>, Arc<TaskQueue>) {
        let store = Arc::new(MemoryStoryStore::new());
        let model = complete_model("run", scenes);
        store.save(&model).await.unwrap();
        let options = DeriveOptions {
            video: true,
            reference_images: true,
            ..Default::default()
        };
        let queue = Arc::new(derive_tasks(&model, &options).unwrap());
        (store, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenes_wait_for_references_and_start_frame() {
        let (store, queue) = setup_with_references(1).await;
        let client = Arc::new(ScriptedClient::new());
        client
            .require_references()
            .delay("nv1-image", Duration::from_secs(5))
            .delay("loc1-image", Duration::from_secs(2));

        let sessions = (1..=5).map(|i| session(&format!("w{}", i), client.clone())).collect();
        let pool = WorkerPool::new(sessions, store.clone(), config(3));
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, PoolOutcome::Success);
        assert_eq!(report.succeeded, 5);
        let calls = client.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(&calls[3..], &["s001-image".to_string(), "s001-video".to_string()]);

        let requests = client.requests();
        assert_eq!(
            requests[3].references,
            vec![PathBuf::from("nv/nv1.png"), PathBuf::from("loc/loc1.png")]
        );
        assert_eq!(requests[4].references, vec![PathBuf::from("img/s001.png")]);

        let model = store.load("run").await.unwrap().unwrap();
        assert_eq!(model.character("nv1").unwrap().reference_image.as_deref(), Some("nv/nv1.png"));
        assert!(model.scene(1).unwrap().video_result.is_some());
    }

    #[tokio::test]
    async fn test_failed_reference_fails_its_scene() {
        let (store, queue) = setup_with_references(2).await;
        let client = Arc::new(ScriptedClient::new());
        client.fail_next("nv1-image", ServiceError::Rejected("content policy".to_string()));

        let pool = WorkerPool::new(
            vec![session("w1", client.clone()), session("w2", client.clone())],
            store.clone(),
            config(3),
        );
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        // Both scenes show nv1, so neither is attempted
        assert_eq!(report.outcome, PoolOutcome::PartialSuccess);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 5);
        assert!(client.calls().iter().all(|c| !c.starts_with('s')));
        let scene_failure = report
            .failures
            .iter()
            .find(|f| f.task_id == "s002-image")
            .unwrap();
        assert_eq!(scene_failure.attempts, 0);
        assert_eq!(scene_failure.error, "dependency nv1-image failed");

        let model = store.load("run").await.unwrap().unwrap();
        assert_eq!(model.failed_scenes().len(), 2);
        assert!(model.scene(1).unwrap().last_error().unwrap().contains("nv1-image"));
        assert!(model.location("loc1").unwrap().reference_image.is_some());
    }

    /// Memory store that refuses outcomes for one scene.
    struct FlakyStore {
        inner: MemoryStoryStore,
        broken: AssetTarget,
    }

    #[async_trait::async_trait]
    impl StoryStore for FlakyStore {
        async fn load(&self, run_id: &str) -> Result<Option<crate::story::StoryModel>> {
            self.inner.load(run_id).await
        }

        async fn save(&self, model: &crate::story::StoryModel) -> Result<()> {
            self.inner.save(model).await
        }

        async fn load_record(&self, run_id: &str) -> Result<Option<crate::pipeline::RunRecord>> {
            self.inner.load_record(run_id).await
        }

        async fn save_record(&self, record: &crate::pipeline::RunRecord) -> Result<()> {
            self.inner.save_record(record).await
        }

        async fn list_records(&self) -> Result<Vec<crate::pipeline::RunRecord>> {
            self.inner.list_records().await
        }

        async fn record_outcome(&self, run_id: &str, outcome: &AssetOutcome) -> Result<()> {
            if outcome.target == self.broken {
                return Err(ScenecastError::Store("database is locked".to_string()));
            }
            self.inner.record_outcome(run_id, outcome).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_keeps_the_report() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStoryStore::new(),
            broken: AssetTarget::Scene(2),
        });
        let model = complete_model("run", 3);
        store.save(&model).await.unwrap();
        let queue = Arc::new(derive_tasks(&model, &DeriveOptions::default()).unwrap());
        let client = Arc::new(ScriptedClient::new());

        let pool = WorkerPool::new(vec![session("w1", client.clone())], store.clone(), config(3));
        let report = pool.run("run", queue, &CancellationToken::new()).await.unwrap();

        assert_eq!(client.calls().len(), 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.unsaved.len(), 1);
        assert_eq!(report.unsaved[0].task_id, "s002-image");
        assert!(report.unsaved[0].error.contains("database is locked"));
        assert_eq!(report.outcome, PoolOutcome::PartialSuccess);

        let saved = store.load("run").await.unwrap().unwrap();
        assert_eq!(saved.scene(1).unwrap().status, SceneStatus::Generated);
        assert_eq!(saved.scene(2).unwrap().status, SceneStatus::Pending);
        assert_eq!(saved.scene(3).unwrap().status, SceneStatus::Generated);
    }

    #[test]
    fn test_round_robin_accounts() {
        assert_eq!(assign_accounts(5, 2), vec![0, 1, 0, 1, 0]);
        assert_eq!(assign_accounts(1, 3), vec![0]);
        assert!(assign_accounts(3, 0).is_empty());
    }

    #[test]
    fn test_pool_requires_accounts() {
        let settings = GenerationSettings::default();
        let store: Arc<dyn StoryStore> = Arc::new(MemoryStoryStore::new());
        assert!(WorkerPool::from_settings(&settings, &[], store).is_err());
    }
}
