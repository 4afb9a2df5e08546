//! Execution backends: the isolated environments sessions run in.
//!
//! Paths handed to a [`Backend`] are always relative to the environment root
//! and already normalized by the caller.

mod local;

pub use local::LocalBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Reference to one live environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub id: String,
    /// Absolute root as seen by code running inside the environment.
    pub root: String,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    /// Relative to the environment root; `None` runs at the root.
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl RunRequest {
    #[must_use]
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: BTreeMap::new(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }
}

/// Captured result of one command. Output is kept even when the command
/// was cut short.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Relative to the environment root, `/`-separated.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("execution backend unavailable: {0}")]
    Unavailable(String),

    #[error("environment `{0}` not found")]
    UnknownEnvironment(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend I/O error: {0}")]
    Io(String),
}

impl BackendError {
    /// Maps an I/O error on `path` to the matching backend error.
    #[must_use]
    pub fn from_io(path: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            ErrorKind::AlreadyExists | ErrorKind::IsADirectory | ErrorKind::NotADirectory => {
                Self::Conflict(format!("{path}: {err}"))
            }
            _ => Self::Io(format!("{path}: {err}")),
        }
    }
}

/// Protocol for talking to an isolated execution environment.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, label: &str) -> Result<EnvironmentHandle, BackendError>;

    /// Reconnects to an environment created earlier, possibly by another process.
    async fn attach(&self, id: &str) -> Result<EnvironmentHandle, BackendError>;

    async fn run(
        &self,
        env: &EnvironmentHandle,
        request: RunRequest,
    ) -> Result<RunOutput, BackendError>;

    async fn upload_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError>;

    async fn download_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
    ) -> Result<Vec<u8>, BackendError>;

    async fn make_dir(&self, env: &EnvironmentHandle, path: &str) -> Result<(), BackendError>;

    /// Every entry under `dir`, recursively. A file path lists just that file.
    async fn list_entries(
        &self,
        env: &EnvironmentHandle,
        dir: &str,
    ) -> Result<Vec<EntryInfo>, BackendError>;

    /// Removing a missing path succeeds.
    async fn remove_path(&self, env: &EnvironmentHandle, path: &str) -> Result<(), BackendError>;

    async fn suspend(&self, _env: &EnvironmentHandle) -> Result<(), BackendError> {
        Ok(())
    }

    async fn resume(&self, _env: &EnvironmentHandle) -> Result<(), BackendError> {
        Ok(())
    }

    async fn destroy(&self, env: &EnvironmentHandle) -> Result<(), BackendError>;
}
