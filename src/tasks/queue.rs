//! Thread-safe task queue shared by all worker sessions.

use super::{Task, TaskState};
use crate::error::{Result, ScenecastError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// What a session should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextTask {
    /// A task was assigned to the session.
    Ready(Task),
    /// Pending tasks exist but are backing off until the given instant.
    Wait(Instant),
    /// Nothing to dispatch now; in-flight tasks may still be requeued.
    Idle,
    /// Every task reached a terminal state.
    Drained,
}

/// Task counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueSummary {
    pub fn is_drained(&self) -> bool {
        self.succeeded + self.failed == self.total
    }
}

struct QueueState {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl QueueState {
    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        let idx = *self
            .index
            .get(task_id)
            .ok_or_else(|| invalid(task_id, "unknown task"))?;
        Ok(&mut self.tasks[idx])
    }

    /// Whether every dependency of `task` has succeeded. Dependencies
    /// outside the queue count as satisfied.
    fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.index
                .get(dep)
                .map_or(true, |&idx| self.tasks[idx].state == TaskState::Succeeded)
        })
    }

    /// Fail the pending tasks that depend on `failed_id`, transitively.
    fn fail_dependents(&mut self, failed_id: &str) -> Vec<Task> {
        let mut failed = Vec::new();
        let mut frontier = vec![failed_id.to_string()];
        while let Some(dep) = frontier.pop() {
            for task in self
                .tasks
                .iter_mut()
                .filter(|t| t.state == TaskState::Pending && t.depends_on.contains(&dep))
            {
                task.state = TaskState::FailedTerminal;
                task.last_error = Some(format!("dependency {} failed", dep));
                frontier.push(task.id.clone());
                failed.push(task.clone());
            }
        }
        failed
    }
}

fn invalid(task_id: &str, reason: impl Into<String>) -> ScenecastError {
    ScenecastError::InvalidTransition {
        task_id: task_id.to_string(),
        reason: reason.into(),
    }
}

fn expect_state(task: &Task, allowed: &[TaskState], action: &str) -> Result<()> {
    if allowed.contains(&task.state) {
        Ok(())
    } else {
        Err(invalid(&task.id, format!("cannot {} a task that is {}", action, task.state)))
    }
}

/// Queue of generation tasks.
///
/// All transitions happen under one mutex. Every change bumps a version
/// counter so sessions waiting for work can be woken without polling.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    version: watch::Sender<u64>,
}

impl TaskQueue {
    /// Create a queue; dispatch order is the order of `tasks`.
    pub fn new(tasks: Vec<Task>) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState { tasks, index }),
            version,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| ScenecastError::Store(format!("Failed to acquire queue lock: {}", e)))
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Assign the first eligible pending task to `worker`.
    ///
    /// A task is eligible once its backoff has elapsed and all of its
    /// dependencies have succeeded.
    pub fn next_for(&self, worker: &str) -> Result<NextTask> {
        let next = {
            let mut state = self.lock()?;
            let now = Instant::now();

            let eligible = state.tasks.iter().position(|t| {
                t.state == TaskState::Pending
                    && t.eligible_at.map_or(true, |at| at <= now)
                    && state.dependencies_met(t)
            });

            match eligible {
                Some(idx) => {
                    let task = &mut state.tasks[idx];
                    task.state = TaskState::Assigned;
                    task.worker = Some(worker.to_string());
                    NextTask::Ready(task.clone())
                }
                None => {
                    let earliest = state
                        .tasks
                        .iter()
                        .filter(|t| t.state == TaskState::Pending && state.dependencies_met(t))
                        .filter_map(|t| t.eligible_at)
                        .min();
                    if let Some(at) = earliest {
                        NextTask::Wait(at)
                    } else if state.tasks.iter().all(|t| t.state.is_terminal()) {
                        NextTask::Drained
                    } else {
                        NextTask::Idle
                    }
                }
            }
        };

        if matches!(next, NextTask::Ready(_)) {
            self.notify();
        }
        Ok(next)
    }

    /// Mark an assigned task as in progress and count the attempt.
    pub fn start(&self, task_id: &str) -> Result<Task> {
        let task = {
            let mut state = self.lock()?;
            let task = state.task_mut(task_id)?;
            expect_state(task, &[TaskState::Assigned], "start")?;
            task.state = TaskState::InProgress;
            task.attempts += 1;
            task.clone()
        };
        self.notify();
        Ok(task)
    }

    /// Return an assigned task to the pending set without counting an attempt.
    pub fn release(&self, task_id: &str) -> Result<()> {
        {
            let mut state = self.lock()?;
            let task = state.task_mut(task_id)?;
            expect_state(task, &[TaskState::Assigned], "release")?;
            task.state = TaskState::Pending;
            task.worker = None;
        }
        self.notify();
        Ok(())
    }

    /// Record a retryable failure of an in-progress task.
    pub fn mark_retryable(&self, task_id: &str, error: &str) -> Result<()> {
        {
            let mut state = self.lock()?;
            let task = state.task_mut(task_id)?;
            expect_state(task, &[TaskState::InProgress], "mark retryable")?;
            task.state = TaskState::FailedRetryable;
            task.last_error = Some(error.to_string());
        }
        self.notify();
        Ok(())
    }

    /// Make a retryable task pending again once `delay` has elapsed.
    pub fn requeue(&self, task_id: &str, delay: Duration) -> Result<()> {
        {
            let mut state = self.lock()?;
            let task = state.task_mut(task_id)?;
            expect_state(task, &[TaskState::FailedRetryable], "requeue")?;
            task.state = TaskState::Pending;
            task.worker = None;
            task.eligible_at = Some(Instant::now() + delay);
        }
        self.notify();
        Ok(())
    }

    /// Record the result of an in-progress task.
    pub fn complete(&self, task_id: &str, result: &str) -> Result<()> {
        {
            let mut state = self.lock()?;
            let task = state.task_mut(task_id)?;
            expect_state(task, &[TaskState::InProgress], "complete")?;
            task.state = TaskState::Succeeded;
            task.result = Some(result.to_string());
            task.last_error = None;
        }
        self.notify();
        Ok(())
    }

    /// Fail a task terminally, along with every pending task that depends
    /// on it. Returns the dependents failed with it.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<Vec<Task>> {
        let dependents = {
            let mut state = self.lock()?;
            let task = state.task_mut(task_id)?;
            expect_state(
                task,
                &[
                    TaskState::Pending,
                    TaskState::Assigned,
                    TaskState::InProgress,
                    TaskState::FailedRetryable,
                ],
                "fail",
            )?;
            task.state = TaskState::FailedTerminal;
            task.last_error = Some(error.to_string());
            state.fail_dependents(task_id)
        };
        self.notify();
        Ok(dependents)
    }

    /// Fail every task that is still pending. Returns the failed tasks.
    pub fn fail_pending(&self, error: &str) -> Result<Vec<Task>> {
        let failed: Vec<Task> = {
            let mut state = self.lock()?;
            state
                .tasks
                .iter_mut()
                .filter(|t| t.state == TaskState::Pending)
                .map(|t| {
                    t.state = TaskState::FailedTerminal;
                    t.last_error = Some(error.to_string());
                    t.clone()
                })
                .collect()
        };
        if !failed.is_empty() {
            self.notify();
        }
        Ok(failed)
    }

    /// Counts by state.
    pub fn summary(&self) -> Result<QueueSummary> {
        let state = self.lock()?;
        let mut summary = QueueSummary {
            total: state.tasks.len(),
            ..Default::default()
        };
        for task in &state.tasks {
            match task.state {
                TaskState::Pending | TaskState::FailedRetryable => summary.pending += 1,
                TaskState::Assigned | TaskState::InProgress => summary.in_flight += 1,
                TaskState::Succeeded => summary.succeeded += 1,
                TaskState::FailedTerminal => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    /// Copy of every task, in dispatch order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().map(|s| s.tasks.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver notified after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
