//! Background task orchestrator.
//!
//! Sub-tasks are dispatched fire-and-forget, each runs on its own tokio task
//! with its own session, and finished results are collected later without the
//! primary task ever blocking on them. Cancelling a task means it is no longer
//! waited for; the runner is interrupted at its next await point and its
//! session is torn down, but nothing proves the remote side stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

use super::subagent::{RoleConfig, RoleRegistry};
use crate::session::{Session, SessionManager};

/// Default ceiling on tasks running at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What a runner hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub summary: String,
    #[serde(default)]
    pub data: Option<Value>,
    /// Paths inside the task's session worth keeping.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed(TaskOutput),
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    #[must_use]
    pub fn state(&self) -> TaskState {
        match self {
            Self::Completed(_) => TaskState::Completed,
            Self::Failed(_) => TaskState::Failed,
            Self::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Point-in-time view of a task, as returned by `poll` and `list`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub role: String,
    pub brief: String,
    pub state: TaskState,
    pub progress: Vec<String>,
    pub session_id: Option<String>,
    pub dispatched_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final result of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub role: String,
    pub brief: String,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    /// One line for the decision-maker's context.
    #[must_use]
    pub fn headline(&self) -> String {
        match &self.outcome {
            TaskOutcome::Completed(output) => {
                format!("[{}] {} completed: {}", self.id, self.role, output.summary)
            }
            TaskOutcome::Failed(message) => {
                format!("[{}] {} failed: {}", self.id, self.role, message)
            }
            TaskOutcome::Cancelled => format!("[{}] {} cancelled", self.id, self.role),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorErrorKind {
    UnknownRole,
    NotFound,
    Timeout,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown role `{role}`")]
    UnknownRole { role: String },

    #[error("task {task_id} not found")]
    NotFound { task_id: String },

    #[error("task {task_id} did not finish within {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },
}

impl OrchestratorError {
    #[must_use]
    pub fn kind(&self) -> OrchestratorErrorKind {
        match self {
            Self::UnknownRole { .. } => OrchestratorErrorKind::UnknownRole,
            Self::NotFound { .. } => OrchestratorErrorKind::NotFound,
            Self::Timeout { .. } => OrchestratorErrorKind::Timeout,
        }
    }

    /// The role or task id the error is about.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::UnknownRole { role } => role,
            Self::NotFound { task_id } | Self::Timeout { task_id, .. } => task_id,
        }
    }
}

/// Body of a sub-task, typically an external decision-maker driving the
/// session through the tool layer.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<TaskOutput>;
}

/// Everything a runner gets for one task.
pub struct TaskContext {
    pub task_id: String,
    pub role: RoleConfig,
    pub brief: String,
    pub session: Arc<Session>,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

/// Appends progress notes visible through `poll`.
#[derive(Clone)]
pub struct ProgressReporter {
    slot: Arc<TaskSlot>,
}

impl ProgressReporter {
    pub fn report(&self, note: impl Into<String>) {
        let note = note.into();
        tracing::debug!(task_id = %self.slot.id, "Progress: {}", note);
        lock(&self.slot.inner).progress.push(note);
    }
}

/// Runs the brief as code in the task's session and reports its stdout.
/// Useful where no decision-maker is attached.
pub struct CodeTaskRunner;

#[async_trait]
impl TaskRunner for CodeTaskRunner {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<TaskOutput> {
        ctx.progress.report("running brief as code");
        let output = ctx.session.run_code(&ctx.brief, None).await?;
        Ok(TaskOutput {
            summary: output.stdout.trim_end().to_string(),
            data: None,
            artifacts: Vec::new(),
        })
    }
}

#[derive(Default)]
struct SlotInner {
    progress: Vec<String>,
    outcome: Option<TaskOutcome>,
    session: Option<Arc<Session>>,
    finished_at: Option<DateTime<Utc>>,
    completion_seq: Option<u64>,
    delivered: bool,
}

struct TaskSlot {
    id: String,
    seq: u64,
    role: String,
    brief: String,
    dispatched_at: DateTime<Utc>,
    state: watch::Sender<TaskState>,
    cancel: CancellationToken,
    inner: Mutex<SlotInner>,
}

impl TaskSlot {
    fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Dispatched -> Running; false if the task was cancelled meanwhile.
    fn start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TaskState::Dispatched {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Records the outcome unless the task already ended. Completed and
    /// failed tasks get a completion sequence number for delivery order.
    fn finish(&self, outcome: TaskOutcome, completion_seq: Option<u64>) -> bool {
        let mut inner = lock(&self.inner);
        if self.state().is_terminal() {
            return false;
        }
        let state = outcome.state();
        inner.outcome = Some(outcome);
        inner.finished_at = Some(Utc::now());
        inner.completion_seq = completion_seq;
        inner.delivered = state == TaskState::Cancelled;
        self.state.send_replace(state);
        true
    }

    fn snapshot(&self) -> TaskSnapshot {
        let inner = lock(&self.inner);
        TaskSnapshot {
            id: self.id.clone(),
            role: self.role.clone(),
            brief: self.brief.clone(),
            state: self.state(),
            progress: inner.progress.clone(),
            session_id: inner.session.as_ref().map(|s| s.id().to_string()),
            dispatched_at: self.dispatched_at,
            finished_at: inner.finished_at,
        }
    }

    /// The final report, marking it delivered.
    fn take_report(&self) -> Option<TaskReport> {
        let mut inner = lock(&self.inner);
        let outcome = inner.outcome.clone()?;
        inner.delivered = true;
        Some(TaskReport {
            id: self.id.clone(),
            role: self.role.clone(),
            brief: self.brief.clone(),
            outcome,
        })
    }
}

struct Shared {
    manager: Arc<SessionManager>,
    roles: RoleRegistry,
    runner: Arc<dyn TaskRunner>,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, Arc<TaskSlot>>>,
    next_id: AtomicU64,
    completions: AtomicU64,
}

/// Owns background tasks from dispatch until discard. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<SessionManager>,
        roles: RoleRegistry,
        runner: Arc<dyn TaskRunner>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                roles,
                runner,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                completions: AtomicU64::new(0),
            }),
        }
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.shared.roles
    }

    fn slot(&self, task_id: &str) -> Result<Arc<TaskSlot>, OrchestratorError> {
        lock(&self.shared.tasks)
            .get(task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Starts a task and returns at once. The task waits in `dispatched`
    /// until a concurrency slot frees up.
    pub fn dispatch(&self, role: &str, brief: &str) -> Result<TaskSnapshot, OrchestratorError> {
        let config = self
            .shared
            .roles
            .get(role)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownRole {
                role: role.to_string(),
            })?;

        let seq = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (state, _) = watch::channel(TaskState::Dispatched);
        let slot = Arc::new(TaskSlot {
            id: format!("task-{seq:04}"),
            seq,
            role: config.name.clone(),
            brief: brief.to_string(),
            dispatched_at: Utc::now(),
            state,
            cancel: CancellationToken::new(),
            inner: Mutex::new(SlotInner::default()),
        });
        lock(&self.shared.tasks).insert(slot.id.clone(), slot.clone());
        tracing::info!(task_id = %slot.id, role = %config.name, "Task dispatched");

        let snapshot = slot.snapshot();
        tokio::spawn(run_task(self.shared.clone(), slot, config));
        Ok(snapshot)
    }

    /// Current state and progress notes. Never blocks.
    pub fn poll(&self, task_id: &str) -> Result<TaskSnapshot, OrchestratorError> {
        Ok(self.slot(task_id)?.snapshot())
    }

    /// Blocks until the task ends or `timeout` passes. A returned report is
    /// not delivered again by `collect`.
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskReport, OrchestratorError> {
        let slot = self.slot(task_id)?;
        let mut state = slot.state.subscribe();
        if tokio::time::timeout(timeout, state.wait_for(|s| s.is_terminal()))
            .await
            .is_err()
        {
            return Err(OrchestratorError::Timeout {
                task_id: task_id.to_string(),
                timeout,
            });
        }
        slot.take_report().ok_or_else(|| OrchestratorError::NotFound {
            task_id: task_id.to_string(),
        })
    }

    /// Stops waiting for a task and tears down its session. Terminal tasks
    /// are left as they are.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        let slot = self.slot(task_id)?;
        if !slot.finish(TaskOutcome::Cancelled, None) {
            return Ok(slot.state());
        }
        slot.cancel.cancel();
        let session = lock(&slot.inner).session.clone();
        if let Some(session) = session {
            session.close().await;
        }
        tracing::info!(task_id = %task_id, "Task cancelled");
        Ok(TaskState::Cancelled)
    }

    /// Completed and failed tasks not yet delivered, in completion order.
    /// Each report is returned once.
    pub fn collect(&self) -> Vec<TaskReport> {
        let mut ready: Vec<(u64, Arc<TaskSlot>)> = lock(&self.shared.tasks)
            .values()
            .filter_map(|slot| {
                let inner = lock(&slot.inner);
                match inner.completion_seq {
                    Some(seq) if !inner.delivered => Some((seq, slot.clone())),
                    _ => None,
                }
            })
            .collect();
        ready.sort_by_key(|(seq, _)| *seq);
        ready
            .into_iter()
            .filter_map(|(_, slot)| slot.take_report())
            .collect()
    }

    /// Forgets a task, cancelling it first if it is still live.
    pub async fn discard(&self, task_id: &str) -> Result<(), OrchestratorError> {
        if !self.slot(task_id)?.state().is_terminal() {
            self.cancel(task_id).await?;
        }
        lock(&self.shared.tasks).remove(task_id);
        Ok(())
    }

    /// All tasks in dispatch order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut slots: Vec<Arc<TaskSlot>> = lock(&self.shared.tasks).values().cloned().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Cancels every live task.
    pub async fn shutdown(&self) {
        let live: Vec<String> = self
            .list()
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in live {
            let _ = self.cancel(&id).await;
        }
    }
}

async fn run_task(shared: Arc<Shared>, slot: Arc<TaskSlot>, role: RoleConfig) {
    let permit = tokio::select! {
        permit = shared.permits.clone().acquire_owned() => permit,
        () = slot.cancel.cancelled() => return,
    };
    let Ok(_permit) = permit else {
        return;
    };
    if !slot.start() {
        return;
    }
    tracing::debug!(task_id = %slot.id, "Task running");

    let label = format!("task {}", slot.id);
    let created = tokio::select! {
        created = shared.manager.create_session(&label) => created,
        () = slot.cancel.cancelled() => return,
    };
    let session = match created {
        Ok(session) => Arc::new(session),
        Err(e) => {
            tracing::warn!(task_id = %slot.id, "Failed to create task session: {}", e);
            let seq = shared.completions.fetch_add(1, Ordering::SeqCst);
            slot.finish(
                TaskOutcome::Failed(format!("failed to create session: {e}")),
                Some(seq),
            );
            return;
        }
    };
    lock(&slot.inner).session = Some(session.clone());
    if slot.cancel.is_cancelled() {
        session.close().await;
        return;
    }

    let ctx = TaskContext {
        task_id: slot.id.clone(),
        role,
        brief: slot.brief.clone(),
        session: session.clone(),
        progress: ProgressReporter { slot: slot.clone() },
        cancel: slot.cancel.clone(),
    };
    let result = tokio::select! {
        result = AssertUnwindSafe(shared.runner.run(ctx)).catch_unwind() => Some(result),
        () = slot.cancel.cancelled() => None,
    };
    session.close().await;

    let outcome = match result {
        None => return,
        Some(Ok(Ok(output))) => TaskOutcome::Completed(output),
        Some(Ok(Err(e))) => TaskOutcome::Failed(format!("{e:#}")),
        Some(Err(_)) => TaskOutcome::Failed("task runner panicked".to_string()),
    };
    let seq = shared.completions.fetch_add(1, Ordering::SeqCst);
    if slot.finish(outcome, Some(seq)) {
        tracing::info!(task_id = %slot.id, state = %slot.state(), "Task finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRunner, task_manager};
    use std::time::Instant;

    fn orchestrator(max_concurrent: usize) -> Orchestrator {
        Orchestrator::new(
            task_manager(),
            RoleRegistry::with_builtin(),
            Arc::new(MockRunner),
            max_concurrent,
        )
    }

    async fn wait_for_state(orch: &Orchestrator, id: &str, state: TaskState) {
        for _ in 0..200 {
            if orch.poll(id).unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} never reached {state}");
    }

    #[tokio::test]
    async fn test_dispatch_returns_immediately() {
        let orch = orchestrator(2);
        let started = Instant::now();
        let task = orch.dispatch("general", "sleep:5000").unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(task.state, TaskState::Dispatched);
        assert_eq!(task.id, "task-0001");

        wait_for_state(&orch, &task.id, TaskState::Running).await;
        assert!(orch.poll(&task.id).unwrap().session_id.is_some());
        orch.shutdown().await;
        assert_eq!(orch.poll(&task.id).unwrap().state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_role_and_task() {
        let orch = orchestrator(1);
        let err = orch.dispatch("wizard", "x").unwrap_err();
        assert_eq!(err.kind(), OrchestratorErrorKind::UnknownRole);
        assert_eq!(err.subject(), "wizard");

        let err = orch.poll("task-9999").unwrap_err();
        assert_eq!(err.kind(), OrchestratorErrorKind::NotFound);
        let err = orch
            .wait("task-9999", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OrchestratorErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_wait_does_not_block_on_other_tasks() {
        let orch = orchestrator(3);
        let slow = orch.dispatch("general", "sleep:1500").unwrap();
        let fast = orch.dispatch("research", "sleep:200").unwrap();

        let started = Instant::now();
        let report = orch.wait(&fast.id, Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1200));
        assert_eq!(report.role, "research");
        assert!(matches!(report.outcome, TaskOutcome::Completed(ref out) if out.summary == "slept 200ms"));

        // The waited result is not delivered again; the slow one is not done.
        assert!(orch.collect().is_empty());

        wait_for_state(&orch, &slow.id, TaskState::Completed).await;
        let delivered = orch.collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, slow.id);
        assert!(orch.collect().is_empty());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let orch = orchestrator(1);
        let task = orch.dispatch("general", "sleep:2000").unwrap();
        let err = orch
            .wait(&task.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OrchestratorErrorKind::Timeout);
        assert!(!orch.poll(&task.id).unwrap().state.is_terminal());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_collect_in_completion_order() {
        let orch = orchestrator(3);
        let a = orch.dispatch("general", "sleep:400").unwrap();
        let b = orch.dispatch("general", "sleep:100").unwrap();
        let c = orch.dispatch("general", "fail:boom").unwrap();
        for id in [&a.id, &b.id, &c.id] {
            orch.wait(id, Duration::from_secs(5)).await.unwrap();
        }
        // Waiting delivered them; dispatch three more and let them settle.
        let d = orch.dispatch("general", "sleep:300").unwrap();
        let e = orch.dispatch("general", "sleep:50").unwrap();
        wait_for_state(&orch, &d.id, TaskState::Completed).await;
        let ids: Vec<String> = orch.collect().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![e.id, d.id]);
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let orch = orchestrator(2);
        let failed = orch.dispatch("general", "fail:no data").unwrap();
        let panicked = orch.dispatch("general", "panic").unwrap();

        let report = orch.wait(&failed.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Failed("no data".to_string()));
        let report = orch.wait(&panicked.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.outcome.state(), TaskState::Failed);

        let ok = orch.dispatch("general", "sleep:10").unwrap();
        let report = orch.wait(&ok.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.outcome.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_running_and_terminal() {
        let orch = orchestrator(1);
        let task = orch.dispatch("general", "sleep:5000").unwrap();
        wait_for_state(&orch, &task.id, TaskState::Running).await;

        assert_eq!(orch.cancel(&task.id).await.unwrap(), TaskState::Cancelled);
        assert_eq!(orch.cancel(&task.id).await.unwrap(), TaskState::Cancelled);
        let report = orch.wait(&task.id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Cancelled);
        // Cancelled tasks are never auto-delivered.
        assert!(orch.collect().is_empty());

        let done = orch.dispatch("general", "sleep:10").unwrap();
        orch.wait(&done.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(orch.cancel(&done.id).await.unwrap(), TaskState::Completed);
        assert_eq!(orch.poll(&done.id).unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let orch = orchestrator(2);
        let tasks: Vec<TaskSnapshot> = (0..3)
            .map(|_| orch.dispatch("general", "sleep:400").unwrap())
            .collect();

        wait_for_state(&orch, &tasks[0].id, TaskState::Running).await;
        wait_for_state(&orch, &tasks[1].id, TaskState::Running).await;
        assert_eq!(orch.poll(&tasks[2].id).unwrap().state, TaskState::Dispatched);

        let report = orch.wait(&tasks[2].id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.outcome.state(), TaskState::Completed);
        assert!(orch.poll(&tasks[0].id).unwrap().state.is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let orch = orchestrator(1);
        let first = orch.dispatch("general", "sleep:300").unwrap();
        let queued = orch.dispatch("general", "sleep:10").unwrap();
        assert_eq!(orch.cancel(&queued.id).await.unwrap(), TaskState::Cancelled);

        orch.wait(&first.id, Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = orch.poll(&queued.id).unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(snapshot.session_id.is_none());
    }

    #[tokio::test]
    async fn test_progress_list_and_discard() {
        let orch = orchestrator(2);
        let a = orch.dispatch("general", "sleep:10").unwrap();
        let b = orch.dispatch("research", "sleep:5000").unwrap();
        orch.wait(&a.id, Duration::from_secs(5)).await.unwrap();

        let snapshot = orch.poll(&a.id).unwrap();
        assert_eq!(snapshot.progress, vec!["started".to_string()]);
        assert!(snapshot.finished_at.is_some());

        let ids: Vec<String> = orch.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        orch.discard(&a.id).await.unwrap();
        orch.discard(&b.id).await.unwrap();
        assert!(orch.list().is_empty());
        let err = orch.discard(&a.id).await.unwrap_err();
        assert_eq!(err.kind(), OrchestratorErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_code_task_runner() {
        let orch = Orchestrator::new(
            task_manager(),
            RoleRegistry::with_builtin(),
            Arc::new(CodeTaskRunner),
            1,
        );
        let task = orch.dispatch("general", "echo computed").unwrap();
        let report = orch.wait(&task.id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(
            report.headline(),
            format!("[{}] general completed: computed", task.id)
        );

        let task = orch.dispatch("general", "exit 4").unwrap();
        let report = orch.wait(&task.id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(report.outcome.state(), TaskState::Failed);
    }
}
