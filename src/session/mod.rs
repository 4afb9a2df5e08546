//! Execution sessions: one isolated environment per task, its lifecycle and
//! the file and code operations run against it.

mod files;
mod manager;
mod store;

pub use files::{ContentMatch, EditOutcome, SearchMode, SearchOptions, DEFAULT_READ_LIMIT};
pub use manager::{SessionManager, SessionSettings};
pub use store::{
    DEFAULT_MAX_AGE, Lookup, SessionRecord, SessionStore, SessionStoreError, StaleReason,
};

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::codegen::GeneratedModule;
use crate::sandbox::{Backend, BackendError, EnvironmentHandle, RunOutput, RunRequest};

/// Fixed working areas inside every session.
pub const TOOLS_DIR: &str = crate::codegen::TOOLS_DIR;
pub const DATA_DIR: &str = "data";
pub const RESULTS_DIR: &str = "results";
pub const CODE_DIR: &str = "code";

const TRUNCATION_MARKER: &str = "\n\n[Output truncated]";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Suspended,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process did not exit normally.
    pub exit_status: i32,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    Timeout,
    Runtime,
    BackendUnavailable,
    Rejected,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        partial: ExecutionOutput,
    },

    #[error("execution failed with exit status {}", output.exit_status)]
    Runtime { output: ExecutionOutput },

    #[error("execution backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("code rejected: {reason}")]
    Rejected { reason: String },

    #[error("execution cancelled")]
    Cancelled { partial: ExecutionOutput },
}

impl ExecutionError {
    #[must_use]
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            Self::Timeout { .. } => ExecutionErrorKind::Timeout,
            Self::Runtime { .. } => ExecutionErrorKind::Runtime,
            Self::BackendUnavailable { .. } => ExecutionErrorKind::BackendUnavailable,
            Self::Rejected { .. } => ExecutionErrorKind::Rejected,
            Self::Cancelled { .. } => ExecutionErrorKind::Cancelled,
        }
    }

    /// Whatever output was captured before the failure.
    #[must_use]
    pub fn output(&self) -> Option<&ExecutionOutput> {
        match self {
            Self::Timeout { partial, .. } | Self::Cancelled { partial } => Some(partial),
            Self::Runtime { output } => Some(output),
            Self::BackendUnavailable { .. } | Self::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileErrorKind {
    NotFound,
    Permission,
    Conflict,
    NoMatch,
    AmbiguousMatch,
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("permission denied for {path}: {reason}")]
    Permission { path: String, reason: String },

    #[error("conflict at {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("old_string not found in {path}")]
    NoMatch { path: String },

    #[error(
        "old_string found {count} times in {path}; add more context to make it unique or use replace_all"
    )]
    AmbiguousMatch { path: String, count: usize },

    #[error("invalid argument for {path}: {reason}")]
    InvalidArgument { path: String, reason: String },
}

impl FileError {
    #[must_use]
    pub fn kind(&self) -> FileErrorKind {
        match self {
            Self::NotFound { .. } => FileErrorKind::NotFound,
            Self::Permission { .. } => FileErrorKind::Permission,
            Self::Conflict { .. } => FileErrorKind::Conflict,
            Self::NoMatch { .. } => FileErrorKind::NoMatch,
            Self::AmbiguousMatch { .. } => FileErrorKind::AmbiguousMatch,
            Self::InvalidArgument { .. } => FileErrorKind::InvalidArgument,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::NotFound { path }
            | Self::Permission { path, .. }
            | Self::Conflict { path, .. }
            | Self::NoMatch { path }
            | Self::AmbiguousMatch { path, .. }
            | Self::InvalidArgument { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    Execution(ExecutionErrorKind),
    File(FileErrorKind),
    InvalidState,
    Backend,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("session {session_id} cannot {operation} while {state}")]
    InvalidState {
        session_id: String,
        state: SessionState,
        operation: &'static str,
    },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl SessionError {
    #[must_use]
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Execution(e) => SessionErrorKind::Execution(e.kind()),
            Self::File(e) => SessionErrorKind::File(e.kind()),
            Self::InvalidState { .. } => SessionErrorKind::InvalidState,
            Self::Backend(_) => SessionErrorKind::Backend,
        }
    }

    /// Only a lost backend ends the session for good.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Execution(ExecutionError::BackendUnavailable { .. })
                | Self::Backend(BackendError::Unavailable(_))
        )
    }
}

/// What `install_module` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallOutcome {
    Installed,
    Updated,
    Unchanged,
}

/// Files copied out of `results/` by [`Session::export_results`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub files: Vec<String>,
    pub bytes: u64,
}

/// One isolated environment bound to a task.
pub struct Session {
    id: String,
    name: String,
    backend: Arc<dyn Backend>,
    env: EnvironmentHandle,
    settings: Arc<SessionSettings>,
    run_env: BTreeMap<String, String>,
    state: Mutex<SessionState>,
    installed: Mutex<HashMap<String, String>>,
    /// Serializes operations so the session is busy for one at a time.
    op_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    code_counter: AtomicU64,
}

/// Holds the session busy; restores the prior state on drop unless the
/// session was terminated meanwhile.
struct BusyGuard<'a> {
    session: &'a Session,
    previous: SessionState,
    _op: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.session.state);
        if *state == SessionState::Busy {
            *state = self.previous;
        }
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        name: String,
        backend: Arc<dyn Backend>,
        env: EnvironmentHandle,
        settings: Arc<SessionSettings>,
        run_env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            name,
            backend,
            env,
            settings,
            run_env,
            state: Mutex::new(SessionState::Initializing),
            installed: Mutex::new(HashMap::new()),
            op_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            code_counter: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn environment(&self) -> &EnvironmentHandle {
        &self.env
    }

    /// Absolute root of the working directory inside the environment.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.env.root
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Module name to content fingerprint, for every installed module.
    #[must_use]
    pub fn installed_modules(&self) -> BTreeMap<String, String> {
        lock(&self.installed)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn mark_ready(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Initializing {
            *state = SessionState::Ready;
        }
    }

    fn invalid_state(&self, state: SessionState, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            session_id: self.id.clone(),
            state,
            operation,
        }
    }

    /// Waits for any running operation, then marks the session busy.
    async fn begin(&self, operation: &'static str) -> Result<BusyGuard<'_>, SessionError> {
        let op = self.op_lock.lock().await;
        let mut state = lock(&self.state);
        match *state {
            previous @ (SessionState::Ready | SessionState::Initializing) => {
                *state = SessionState::Busy;
                drop(state);
                Ok(BusyGuard {
                    session: self,
                    previous,
                    _op: op,
                })
            }
            other => Err(self.invalid_state(other, operation)),
        }
    }

    /// Translates a backend failure, terminating the session when the
    /// backend is gone.
    fn backend_failure(&self, err: BackendError, path: &str) -> SessionError {
        match err {
            BackendError::Unavailable(message) => {
                tracing::error!(session_id = %self.id, "Execution backend unavailable: {}", message);
                *lock(&self.state) = SessionState::Terminated;
                self.cancel.cancel();
                ExecutionError::BackendUnavailable { message }.into()
            }
            BackendError::NotFound(_) => FileError::NotFound {
                path: path.to_string(),
            }
            .into(),
            BackendError::PermissionDenied(reason) => FileError::Permission {
                path: path.to_string(),
                reason,
            }
            .into(),
            BackendError::Conflict(reason) => FileError::Conflict {
                path: path.to_string(),
                reason,
            }
            .into(),
            other => SessionError::Backend(other),
        }
    }

    fn check_code(&self, code: &str) -> Result<(), ExecutionError> {
        let limit = self.settings.max_code_length;
        if limit > 0 && code.len() > limit {
            return Err(ExecutionError::Rejected {
                reason: format!("code is {} bytes, limit is {limit}", code.len()),
            });
        }
        if let Some(pattern) = self
            .settings
            .blocked_patterns
            .iter()
            .find(|p| p.is_match(code))
        {
            return Err(ExecutionError::Rejected {
                reason: format!("code matches blocked pattern `{}`", pattern.as_str()),
            });
        }
        Ok(())
    }

    fn to_text(&self, bytes: &[u8]) -> (String, bool) {
        let mut text = String::from_utf8_lossy(bytes).into_owned();
        let max = self.settings.max_output_bytes;
        if max == 0 || text.len() <= max {
            return (text, false);
        }
        let truncate_at = text
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map_or(max, |(i, c)| i + c.len_utf8());
        text.truncate(truncate_at);
        text.push_str(TRUNCATION_MARKER);
        (text, true)
    }

    fn execution_output(&self, raw: &RunOutput) -> ExecutionOutput {
        let (stdout, out_truncated) = self.to_text(&raw.stdout);
        let (stderr, err_truncated) = self.to_text(&raw.stderr);
        ExecutionOutput {
            stdout,
            stderr,
            exit_status: raw.exit_code.unwrap_or(-1),
            truncated: out_truncated || err_truncated,
        }
    }

    async fn execute(
        &self,
        command: String,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, SessionError> {
        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        let mut request = RunRequest::new(command, timeout);
        request.env.clone_from(&self.run_env);
        request.cancel = self.cancel.child_token();

        let raw = self
            .backend
            .run(&self.env, request)
            .await
            .map_err(|e| self.backend_failure(e, "."))?;
        let output = self.execution_output(&raw);

        if raw.timed_out {
            tracing::warn!(session_id = %self.id, ?timeout, "Execution timed out");
            return Err(ExecutionError::Timeout {
                timeout,
                partial: output,
            }
            .into());
        }
        if raw.cancelled {
            return Err(ExecutionError::Cancelled { partial: output }.into());
        }
        if output.exit_status != 0 {
            return Err(ExecutionError::Runtime { output }.into());
        }
        Ok(output)
    }

    /// Runs a code snippet with the configured interpreter.
    ///
    /// The code is saved under `code/` first so tracebacks point at a real
    /// file. A non-zero exit is a runtime error carrying the full output.
    pub async fn run_code(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, SessionError> {
        self.check_code(code)?;
        let _busy = self.begin("run code").await?;

        let n = self.code_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let digest = Sha256::digest(code.as_bytes());
        let file = format!(
            "{CODE_DIR}/{n:04}_{}.{}",
            &format!("{digest:x}")[..8],
            self.settings.code_extension
        );
        self.backend
            .upload_file(&self.env, &file, code.as_bytes())
            .await
            .map_err(|e| self.backend_failure(e, &file))?;

        tracing::debug!(session_id = %self.id, file = %file, "Running code");
        let command = format!("{} {file}", self.settings.interpreter);
        self.execute(command, timeout).await
    }

    /// Runs a shell command at the session root.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, SessionError> {
        let _busy = self.begin("run command").await?;
        tracing::debug!(session_id = %self.id, "Running command");
        self.execute(command.to_string(), timeout).await
    }

    /// Installs a generated module. Same content is a no-op; changed content
    /// overwrites the previous files and removes docs that no longer exist.
    pub async fn install_module(
        &self,
        module: &GeneratedModule,
    ) -> Result<InstallOutcome, SessionError> {
        let previous = lock(&self.installed).get(&module.module_name).cloned();
        if previous.as_deref() == Some(module.fingerprint.as_str()) {
            return Ok(InstallOutcome::Unchanged);
        }

        let _busy = self.begin("install module").await?;
        if previous.is_some() {
            let docs_dir = module.docs_dir();
            self.backend
                .remove_path(&self.env, &docs_dir)
                .await
                .map_err(|e| self.backend_failure(e, &docs_dir))?;
        }
        for (path, content) in module.files() {
            self.backend
                .upload_file(&self.env, &path, content.as_bytes())
                .await
                .map_err(|e| self.backend_failure(e, &path))?;
        }
        lock(&self.installed).insert(module.module_name.clone(), module.fingerprint.clone());

        let outcome = if previous.is_some() {
            InstallOutcome::Updated
        } else {
            InstallOutcome::Installed
        };
        tracing::debug!(
            session_id = %self.id,
            module = %module.module_name,
            ?outcome,
            "Installed tool module"
        );
        Ok(outcome)
    }

    /// Removes a module that is no longer offered.
    pub async fn uninstall_module(&self, module_name: &str) -> Result<bool, SessionError> {
        if lock(&self.installed).remove(module_name).is_none() {
            return Ok(false);
        }
        let _busy = self.begin("uninstall module").await?;
        for path in [
            format!("{TOOLS_DIR}/{module_name}.py"),
            format!("{TOOLS_DIR}/docs/{module_name}"),
        ] {
            self.backend
                .remove_path(&self.env, &path)
                .await
                .map_err(|e| self.backend_failure(e, &path))?;
        }
        Ok(true)
    }

    pub async fn suspend(&self) -> Result<(), SessionError> {
        let _op = self.op_lock.lock().await;
        let current = self.state();
        match current {
            SessionState::Suspended => return Ok(()),
            SessionState::Ready => {}
            other => return Err(self.invalid_state(other, "suspend")),
        }
        self.backend
            .suspend(&self.env)
            .await
            .map_err(|e| self.backend_failure(e, "."))?;
        *lock(&self.state) = SessionState::Suspended;
        tracing::debug!(session_id = %self.id, "Session suspended");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        let _op = self.op_lock.lock().await;
        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Suspended => {}
            other => return Err(self.invalid_state(other, "resume")),
        }
        self.backend
            .resume(&self.env)
            .await
            .map_err(|e| self.backend_failure(e, "."))?;
        *lock(&self.state) = SessionState::Ready;
        tracing::debug!(session_id = %self.id, "Session resumed");
        Ok(())
    }

    /// Tears the environment down. Interrupts any running operation and is
    /// safe to call more than once.
    pub async fn close(&self) {
        if !self.terminate() {
            return;
        }
        if let Err(e) = self.backend.destroy(&self.env).await {
            tracing::warn!(session_id = %self.id, "Failed to destroy environment: {}", e);
        } else {
            tracing::debug!(session_id = %self.id, "Session closed");
        }
    }

    /// Ends the session but leaves the environment in place for a later
    /// attach.
    pub fn detach(&self) {
        if self.terminate() {
            tracing::debug!(session_id = %self.id, env_id = %self.env.id, "Session detached");
        }
    }

    /// Returns false if the session was already terminated.
    fn terminate(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::Terminated {
            return false;
        }
        *state = SessionState::Terminated;
        drop(state);
        self.cancel.cancel();
        true
    }

    /// Copies everything under `results/` into `dest` on the host.
    pub async fn export_results(&self, dest: &Path) -> Result<ExportSummary, SessionError> {
        let _busy = self.begin("export results").await?;
        let entries = match self.backend.list_entries(&self.env, RESULTS_DIR).await {
            Ok(entries) => entries,
            Err(BackendError::NotFound(_)) => return Ok(ExportSummary::default()),
            Err(e) => return Err(self.backend_failure(e, RESULTS_DIR)),
        };

        let mut summary = ExportSummary::default();
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            let bytes = self
                .backend
                .download_file(&self.env, &entry.path)
                .await
                .map_err(|e| self.backend_failure(e, &entry.path))?;
            let relative = entry
                .path
                .strip_prefix(&format!("{RESULTS_DIR}/"))
                .unwrap_or(&entry.path);
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    FileError::Permission {
                        path: parent.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
            }
            tokio::fs::write(&target, &bytes)
                .await
                .map_err(|e| FileError::Permission {
                    path: target.display().to_string(),
                    reason: e.to_string(),
                })?;
            summary.bytes += bytes.len() as u64;
            summary.files.push(entry.path);
        }
        summary.files.sort();
        Ok(summary)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == SessionState::Terminated {
            return;
        }
        self.cancel.cancel();
        // Teardown on paths that never reached close().
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let env = self.env.clone();
            let id = self.id.clone();
            handle.spawn(async move {
                if let Err(e) = backend.destroy(&env).await {
                    tracing::warn!(session_id = %id, "Failed to destroy dropped session: {}", e);
                }
            });
        } else {
            tracing::warn!(session_id = %self.id, "Session dropped outside a runtime; environment left behind");
        }
    }
}
