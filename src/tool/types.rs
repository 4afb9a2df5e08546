use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::{Orchestrator, OrchestratorError, OrchestratorErrorKind, TaskContext};
use crate::session::{ExecutionError, FileError, Session, SessionError};

/// Default bound on `wait_task` when the caller gives none.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct ToolContext {
    /// Session every file and code tool operates on.
    pub session: Arc<Session>,
    /// Present for the primary task only; sub-tasks cannot dispatch.
    pub orchestrator: Option<Orchestrator>,
    pub abort_signal: CancellationToken,
    pub wait_timeout: Duration,
}

impl ToolContext {
    pub fn new(session: Arc<Session>, abort_signal: CancellationToken) -> Self {
        Self {
            session,
            orchestrator: None,
            abort_signal,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator, wait_timeout: Duration) -> Self {
        self.orchestrator = Some(orchestrator);
        self.wait_timeout = wait_timeout;
        self
    }

    /// Context for a background task's runner, bound to the task's session
    /// and cancellation token.
    pub fn for_task(task: &TaskContext) -> Self {
        Self::new(task.session.clone(), task.cancel.clone())
    }

    pub fn orchestrator(&self) -> Result<&Orchestrator, ToolError> {
        self.orchestrator.as_ref().ok_or_else(|| {
            ToolError::PermissionDenied("background tasks are not available here".to_string())
        })
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session.id())
            .field("orchestrator", &self.orchestrator.as_ref().map(|_| "Orchestrator"))
            .field("abort_signal", &self.abort_signal)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    pub metadata: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;

    /// Whether the tool needs the background orchestrator.
    fn requires_orchestrator(&self) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<SessionError> for ToolError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::File(
                e @ (FileError::InvalidArgument { .. }
                | FileError::NoMatch { .. }
                | FileError::AmbiguousMatch { .. }),
            ) => Self::InvalidArgs(e.to_string()),
            SessionError::File(e @ FileError::Permission { .. }) => {
                Self::PermissionDenied(e.to_string())
            }
            SessionError::Execution(ExecutionError::Rejected { reason }) => {
                Self::PermissionDenied(reason)
            }
            SessionError::Execution(ExecutionError::Cancelled { .. }) => Self::Cancelled,
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ToolError {
    fn from(err: OrchestratorError) -> Self {
        match err.kind() {
            OrchestratorErrorKind::UnknownRole | OrchestratorErrorKind::NotFound => {
                Self::InvalidArgs(err.to_string())
            }
            OrchestratorErrorKind::Timeout => Self::ExecutionFailed(err.to_string()),
        }
    }
}
