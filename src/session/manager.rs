//! Creates sessions on a backend, prepares their working areas and keeps
//! their installed tool modules current.

use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::{
    CODE_DIR, DATA_DIR, ExecutionError, InstallOutcome, Lookup, RESULTS_DIR, Session,
    SessionError, SessionRecord, SessionStore, TOOLS_DIR,
};
use crate::codegen::{BRIDGE_URL_VAR, GeneratedModule, support_files};
use crate::sandbox::{Backend, BackendError, EnvironmentHandle};

/// Execution limits shared by every session a manager creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Command that runs a saved code file, e.g. `python3`.
    pub interpreter: String,
    /// Extension for saved code files.
    pub code_extension: String,
    pub default_timeout: Duration,
    /// Per-stream cap on returned output; 0 disables truncation.
    pub max_output_bytes: usize,
    /// 0 disables the check.
    pub max_code_length: usize,
    /// Code matching any of these is rejected before it runs.
    pub blocked_patterns: Vec<Regex>,
    /// Largest file `write_file` or an edit may leave behind, in bytes.
    /// 0 disables the check.
    pub max_file_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            code_extension: "py".to_string(),
            default_timeout: Duration::from_secs(120),
            max_output_bytes: 100_000,
            max_code_length: 100_000,
            blocked_patterns: Vec::new(),
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

fn backend_error(err: BackendError) -> SessionError {
    match err {
        BackendError::Unavailable(message) => ExecutionError::BackendUnavailable { message }.into(),
        other => SessionError::Backend(other),
    }
}

pub struct SessionManager {
    backend: Arc<dyn Backend>,
    settings: Arc<SessionSettings>,
    modules: RwLock<Arc<[GeneratedModule]>>,
    bridge_url: Option<String>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Backend>, settings: SessionSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            modules: RwLock::new(Arc::from(Vec::new())),
            bridge_url: None,
        }
    }

    /// Endpoint generated modules call back into.
    #[must_use]
    pub fn with_bridge_url(mut self, url: impl Into<String>) -> Self {
        self.bridge_url = Some(url.into());
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Replaces the module set installed into new sessions.
    pub fn set_modules(&self, modules: Vec<GeneratedModule>) {
        *self
            .modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::from(modules);
    }

    pub fn modules(&self) -> Arc<[GeneratedModule]> {
        self.modules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn run_env(&self, env: &EnvironmentHandle) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        // Scripts run from code/, so the root must be importable explicitly.
        vars.insert("PYTHONPATH".to_string(), env.root.clone());
        if let Some(url) = &self.bridge_url {
            vars.insert(BRIDGE_URL_VAR.to_string(), url.clone());
        }
        vars
    }

    fn session(&self, name: &str, env: EnvironmentHandle) -> Session {
        let id = format!("sess-{}", uuid::Uuid::new_v4().simple());
        let run_env = self.run_env(&env);
        Session::new(
            id,
            name.to_string(),
            self.backend.clone(),
            env,
            self.settings.clone(),
            run_env,
        )
    }

    /// Lays out the working areas and installs the support package and
    /// every current module.
    async fn prepare(&self, session: &Session) -> Result<(), SessionError> {
        {
            let _busy = session.begin("prepare").await?;
            for dir in [TOOLS_DIR, DATA_DIR, RESULTS_DIR, CODE_DIR] {
                self.backend
                    .make_dir(&session.env, dir)
                    .await
                    .map_err(|e| session.backend_failure(e, dir))?;
            }
            for (path, content) in support_files() {
                self.backend
                    .upload_file(&session.env, path, content.as_bytes())
                    .await
                    .map_err(|e| session.backend_failure(e, path))?;
            }
        }
        self.sync_modules(session).await?;
        Ok(())
    }

    /// Creates a fresh environment and session. The session is ready with
    /// all current modules installed, or the environment is torn down.
    pub async fn create_session(&self, name: &str) -> Result<Session, SessionError> {
        let env = self.backend.create(name).await.map_err(backend_error)?;
        let session = self.session(name, env);
        if let Err(e) = self.prepare(&session).await {
            session.close().await;
            return Err(e);
        }
        session.mark_ready();
        tracing::info!(
            session_id = %session.id(),
            env_id = %session.environment().id,
            backend = self.backend.name(),
            "Session created"
        );
        Ok(session)
    }

    /// Reconnects to an existing environment. A failed attach leaves the
    /// environment untouched.
    pub async fn attach_session(&self, name: &str, env_id: &str) -> Result<Session, SessionError> {
        let env = self.backend.attach(env_id).await.map_err(backend_error)?;
        let session = self.session(name, env);
        let prepared = match self.prepare(&session).await {
            Ok(()) => self.prune_stale_tools(&session).await,
            Err(e) => Err(e),
        };
        let pruned = match prepared {
            Ok(pruned) => pruned,
            Err(e) => {
                session.detach();
                return Err(e);
            }
        };
        session.mark_ready();
        tracing::info!(session_id = %session.id(), env_id = %env_id, pruned, "Session attached");
        Ok(session)
    }

    /// Removes generated files an earlier process left in `tools/` that the
    /// current module set no longer produces. Support files stay.
    async fn prune_stale_tools(&self, session: &Session) -> Result<usize, SessionError> {
        let modules = self.modules();
        let mut expected: HashSet<String> = support_files()
            .iter()
            .map(|(path, _)| (*path).to_string())
            .collect();
        for module in modules.iter() {
            expected.extend(module.files().into_iter().map(|(path, _)| path));
        }
        let current_docs: HashSet<String> =
            modules.iter().map(GeneratedModule::docs_dir).collect();
        let docs_root = format!("{TOOLS_DIR}/docs/");

        let _busy = session.begin("prune tools").await?;
        let entries = match self.backend.list_entries(&session.env, TOOLS_DIR).await {
            Ok(entries) => entries,
            Err(BackendError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(session.backend_failure(e, TOOLS_DIR)),
        };

        let mut stale: Vec<String> = entries
            .into_iter()
            .filter(|entry| {
                if entry.is_dir {
                    // Only whole provider directories directly under docs/.
                    entry
                        .path
                        .strip_prefix(&docs_root)
                        .is_some_and(|rest| !rest.contains('/'))
                        && !current_docs.contains(&entry.path)
                } else if expected.contains(&entry.path) {
                    false
                } else if entry.path.starts_with(&docs_root) {
                    true
                } else {
                    entry
                        .path
                        .strip_prefix(&format!("{TOOLS_DIR}/"))
                        .is_some_and(|rest| !rest.contains('/') && rest.ends_with(".py"))
                }
            })
            .map(|entry| entry.path)
            .collect();
        stale.sort();
        for path in &stale {
            tracing::debug!(session_id = %session.id(), path = %path, "Removing stale tool file");
            self.backend
                .remove_path(&session.env, path)
                .await
                .map_err(|e| session.backend_failure(e, path))?;
        }
        Ok(stale.len())
    }

    /// Installs every current module and removes ones no longer offered.
    pub async fn sync_modules(
        &self,
        session: &Session,
    ) -> Result<Vec<(String, InstallOutcome)>, SessionError> {
        let modules = self.modules();
        let mut outcomes = Vec::with_capacity(modules.len());
        for module in modules.iter() {
            let outcome = session.install_module(module).await?;
            outcomes.push((module.module_name.clone(), outcome));
        }
        for stale in session.installed_modules().into_keys() {
            if !modules.iter().any(|m| m.module_name == stale) {
                session.uninstall_module(&stale).await?;
            }
        }
        Ok(outcomes)
    }

    /// Reattaches the persisted environment for `name` when it is still
    /// valid, otherwise replaces it with a fresh one. Returns the session and
    /// whether it was reused.
    pub async fn resume_or_create(
        &self,
        store: &SessionStore,
        name: &str,
        config_hash: &str,
        max_age: Duration,
    ) -> crate::Result<(Session, bool)> {
        match store.lookup(name, self.backend.name(), config_hash, max_age)? {
            Lookup::Reusable(record) => {
                match self.attach_session(name, &record.environment_id).await {
                    Ok(session) => {
                        store.touch(name)?;
                        return Ok((session, true));
                    }
                    Err(e) => {
                        tracing::warn!(session = %name, env_id = %record.environment_id, "Failed to reattach session: {}", e);
                        store.delete(name)?;
                    }
                }
            }
            Lookup::Stale { record, reason } => {
                tracing::info!(session = %name, env_id = %record.environment_id, ?reason, "Discarding stale session");
                self.discard_environment(&record.environment_id).await;
                store.delete(name)?;
            }
            Lookup::Missing => {}
        }

        let session = self.create_session(name).await?;
        let now = chrono::Utc::now().timestamp();
        store.save(&SessionRecord {
            name: name.to_string(),
            environment_id: session.environment().id.clone(),
            backend: self.backend.name().to_string(),
            config_hash: config_hash.to_string(),
            created_at: now,
            last_used: now,
        })?;
        Ok((session, false))
    }

    /// Best-effort teardown of an environment by id.
    pub async fn discard_environment(&self, env_id: &str) {
        match self.backend.attach(env_id).await {
            Ok(env) => {
                if let Err(e) = self.backend.destroy(&env).await {
                    tracing::warn!(env_id = %env_id, "Failed to destroy environment: {}", e);
                }
            }
            Err(e) => tracing::debug!(env_id = %env_id, "Environment already gone: {}", e),
        }
    }

    /// Destroys environments whose records expired and forgets them.
    pub async fn sweep_expired(
        &self,
        store: &SessionStore,
        max_age: Duration,
    ) -> crate::Result<usize> {
        let expired = store.take_expired(max_age)?;
        for record in &expired {
            if record.backend == self.backend.name() {
                self.discard_environment(&record.environment_id).await;
            }
        }
        Ok(expired.len())
    }
}
