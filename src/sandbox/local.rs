use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{Backend, BackendError, EntryInfo, EnvironmentHandle, RunOutput, RunRequest};

/// How long readers may keep draining pipes after the process is gone.
/// Background grandchildren can hold a pipe open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Each environment is a private directory under `base`; commands run
/// through a host shell with that directory as working directory.
pub struct LocalBackend {
    base: PathBuf,
    shell: String,
    _temp: Option<TempDir>,
}

impl LocalBackend {
    pub fn new(base: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base: base.canonicalize()?,
            shell: "sh".to_string(),
            _temp: None,
        })
    }

    /// Backend rooted in a temporary directory removed on drop.
    pub fn temporary() -> std::io::Result<Self> {
        let temp = tempfile::Builder::new().prefix("ptc-").tempdir()?;
        let mut backend = Self::new(temp.path())?;
        backend._temp = Some(temp);
        Ok(backend)
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn root(&self, env: &EnvironmentHandle) -> Result<PathBuf, BackendError> {
        Ok(self.base.join(valid_id(&env.id)?))
    }

    fn resolve(&self, env: &EnvironmentHandle, path: &str) -> Result<PathBuf, BackendError> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BackendError::PermissionDenied(path.to_string()));
        }
        Ok(self.root(env)?.join(rel))
    }
}

fn valid_id(id: &str) -> Result<&str, BackendError> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(id),
        _ => Err(BackendError::UnknownEnvironment(id.to_string())),
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn capture<R>(reader: Option<R>, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .extend_from_slice(&buf[..n]),
            }
        }
    })
}

async fn drain(task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(READER_GRACE, task).await.is_err() {
        abort.abort();
    }
}

fn take(sink: &Mutex<Vec<u8>>) -> Vec<u8> {
    std::mem::take(&mut *sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, label: &str) -> Result<EnvironmentHandle, BackendError> {
        let id = format!("env-{}", uuid::Uuid::new_v4().simple());
        let root = self.base.join(&id);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", root.display())))?;
        tracing::debug!(env_id = %id, label = %label, root = %root.display(), "Created local environment");
        Ok(EnvironmentHandle {
            id,
            root: root.to_string_lossy().into_owned(),
        })
    }

    async fn attach(&self, id: &str) -> Result<EnvironmentHandle, BackendError> {
        let root = self.base.join(valid_id(id)?);
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(EnvironmentHandle {
                id: id.to_string(),
                root: root.to_string_lossy().into_owned(),
            }),
            _ => Err(BackendError::UnknownEnvironment(id.to_string())),
        }
    }

    async fn run(
        &self,
        env: &EnvironmentHandle,
        request: RunRequest,
    ) -> Result<RunOutput, BackendError> {
        let dir = match request.workdir.as_deref() {
            Some(workdir) if !workdir.is_empty() => self.resolve(env, workdir)?,
            _ => self.root(env)?,
        };
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(BackendError::NotFound(dir.to_string_lossy().into_owned()));
        }

        // Spawn child process with kill_on_drop for cancellation safety
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&request.command)
            .current_dir(&dir)
            .envs(&request.env)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::Unavailable(format!("failed to spawn {}: {e}", self.shell))
            })?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let out_reader = capture(child.stdout.take(), stdout.clone());
        let err_reader = capture(child.stderr.take(), stderr.clone());

        let mut output = RunOutput::default();
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| BackendError::Io(format!("wait failed: {e}")))?;
                output.exit_code = status.code();
            }
            () = tokio::time::sleep(request.timeout) => {
                output.timed_out = true;
            }
            () = request.cancel.cancelled() => {
                output.cancelled = true;
            }
        }
        if output.timed_out || output.cancelled {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        drain(out_reader).await;
        drain(err_reader).await;
        output.stdout = take(&stdout);
        output.stderr = take(&stderr);
        Ok(output)
    }

    async fn upload_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        let target = self.resolve(env, path)?;
        if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            return Err(BackendError::Conflict(format!("{path} is a directory")));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::from_io(path, &e))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| BackendError::from_io(path, &e))
    }

    async fn download_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
    ) -> Result<Vec<u8>, BackendError> {
        let target = self.resolve(env, path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| BackendError::from_io(path, &e))?;
        if meta.is_dir() {
            return Err(BackendError::Conflict(format!("{path} is a directory")));
        }
        tokio::fs::read(&target)
            .await
            .map_err(|e| BackendError::from_io(path, &e))
    }

    async fn make_dir(&self, env: &EnvironmentHandle, path: &str) -> Result<(), BackendError> {
        let target = self.resolve(env, path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| BackendError::from_io(path, &e))
    }

    async fn list_entries(
        &self,
        env: &EnvironmentHandle,
        dir: &str,
    ) -> Result<Vec<EntryInfo>, BackendError> {
        let root = self.root(env)?;
        let target = self.resolve(env, dir)?;
        if tokio::fs::metadata(&target).await.is_err() {
            return Err(BackendError::NotFound(dir.to_string()));
        }

        // Use spawn_blocking for sync walk
        tokio::task::spawn_blocking(move || {
            let walker = ignore::WalkBuilder::new(&target)
                .standard_filters(false)
                .hidden(true)
                .build();
            walker
                .flatten()
                .filter(|entry| !(entry.depth() == 0 && entry.path().is_dir()))
                .filter_map(|entry| {
                    let meta = entry.metadata().ok()?;
                    Some(EntryInfo {
                        path: relative(&root, entry.path()),
                        is_dir: meta.is_dir(),
                        size: meta.len(),
                        modified: meta.modified().ok(),
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| BackendError::Io(format!("listing task failed: {e}")))
    }

    async fn remove_path(&self, env: &EnvironmentHandle, path: &str) -> Result<(), BackendError> {
        let target = self.resolve(env, path)?;
        let result = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(BackendError::from_io(path, &e))
            }
            _ => Ok(()),
        }
    }

    async fn destroy(&self, env: &EnvironmentHandle) -> Result<(), BackendError> {
        let root = self.root(env)?;
        match tokio::fs::remove_dir_all(&root).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(BackendError::Io(format!("{}: {e}", root.display())))
            }
            _ => {
                tracing::debug!(env_id = %env.id, "Destroyed local environment");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (LocalBackend, EnvironmentHandle) {
        let backend = LocalBackend::temporary().unwrap();
        let env = backend.create("test").await.unwrap();
        (backend, env)
    }

    #[tokio::test]
    async fn test_run_captures_output_and_status() {
        let (backend, env) = setup().await;
        let output = backend
            .run(
                &env,
                RunRequest::new("echo out; echo err >&2; exit 3", Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_output() {
        let (backend, env) = setup().await;
        let output = backend
            .run(
                &env,
                RunRequest::new("echo started; sleep 10; echo never", Duration::from_millis(300)),
            )
            .await
            .unwrap();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert_eq!(String::from_utf8_lossy(&output.stdout), "started\n");
    }

    #[tokio::test]
    async fn test_run_cancel() {
        let (backend, env) = setup().await;
        let request = RunRequest::new("sleep 10", Duration::from_secs(30));
        let cancel = request.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let output = backend.run(&env, request).await.unwrap();
        assert!(output.cancelled);
    }

    #[tokio::test]
    async fn test_run_uses_env_and_root() {
        let (backend, env) = setup().await;
        let mut request = RunRequest::new("printf '%s %s' \"$GREETING\" \"$(pwd)\"", Duration::from_secs(5));
        request.env.insert("GREETING".into(), "hello".into());
        let output = backend.run(&env, request).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            format!("hello {}", env.root)
        );
    }

    #[tokio::test]
    async fn test_file_roundtrip_and_listing() {
        let (backend, env) = setup().await;
        backend
            .upload_file(&env, "data/a.txt", b"alpha")
            .await
            .unwrap();
        backend.make_dir(&env, "results").await.unwrap();
        assert_eq!(
            backend.download_file(&env, "data/a.txt").await.unwrap(),
            b"alpha"
        );

        let entries = backend.list_entries(&env, "").await.unwrap();
        let mut paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["data", "data/a.txt", "results"]);

        let file_only = backend.list_entries(&env, "data/a.txt").await.unwrap();
        assert_eq!(file_only.len(), 1);
        assert_eq!(file_only[0].size, 5);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (backend, env) = setup().await;
        backend.make_dir(&env, "data").await.unwrap();

        assert!(matches!(
            backend.download_file(&env, "missing.txt").await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            backend.download_file(&env, "data").await,
            Err(BackendError::Conflict(_))
        ));
        assert!(matches!(
            backend.upload_file(&env, "data", b"x").await,
            Err(BackendError::Conflict(_))
        ));
        assert!(matches!(
            backend.upload_file(&env, "../escape.txt", b"x").await,
            Err(BackendError::PermissionDenied(_))
        ));
        assert!(backend.remove_path(&env, "missing.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_and_destroy() {
        let (backend, env) = setup().await;
        let attached = backend.attach(&env.id).await.unwrap();
        assert_eq!(attached, env);

        backend.destroy(&env).await.unwrap();
        assert!(matches!(
            backend.attach(&env.id).await,
            Err(BackendError::UnknownEnvironment(_))
        ));
        assert!(matches!(
            backend.attach("../etc").await,
            Err(BackendError::UnknownEnvironment(_))
        ));
        // Destroy is idempotent.
        backend.destroy(&env).await.unwrap();
    }
}
