//! The primary task's view of the system: one session, the tool catalog and
//! the background orchestrator, assembled into a per-step context for the
//! decision-maker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::background::{Orchestrator, TaskReport, TaskRunner};
use super::subagent::RoleRegistry;
use crate::codegen::{ExposureMode, GeneratedModule, GenerationError, generate_all, render_summaries};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::{DiscoveryReport, InvocationBridge, ProviderSpec, ToolRegistry};
use crate::sandbox::LocalBackend;
use crate::session::{
    ExecutionOutput, InstallOutcome, Session, SessionError, SessionManager, SessionStore,
};
use crate::tool::ToolContext;

/// Name of the primary task's session, also its persistence key.
pub const PRIMARY_SESSION: &str = "primary";

/// Discovered descriptors and the modules generated from them.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    pub report: DiscoveryReport,
    pub modules: Vec<GeneratedModule>,
    pub failures: BTreeMap<String, GenerationError>,
}

impl ToolCatalog {
    /// Discovers every provider and generates a module per healthy one.
    pub async fn build(registry: &ToolRegistry, specs: &BTreeMap<String, ProviderSpec>) -> Self {
        let specs: Vec<ProviderSpec> = specs.values().cloned().collect();
        let report = registry.discover_all(&specs).await;
        let (modules, failures) = generate_all(&report.tools);
        for (provider, error) in &failures {
            tracing::warn!(provider = %provider, "Failed to generate tool module: {}", error);
        }
        Self {
            report,
            modules,
            failures,
        }
    }
}

/// What the decision-maker sees at the start of a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub summaries: String,
    /// Background results that finished since the previous step.
    pub delivered: Vec<TaskReport>,
}

impl StepContext {
    #[must_use]
    pub fn render(&self) -> String {
        if self.delivered.is_empty() {
            return self.summaries.clone();
        }
        let mut out = self.summaries.clone();
        out.push_str("\n\nBackground tasks finished since the last step:\n");
        for report in &self.delivered {
            out.push_str("- ");
            out.push_str(&report.headline());
            out.push('\n');
        }
        out
    }
}

pub struct Workbench {
    registry: Arc<ToolRegistry>,
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    orchestrator: Orchestrator,
    specs: BTreeMap<String, ProviderSpec>,
    exposure: ExposureMode,
    wait_timeout: Duration,
    persistent: bool,
    bridge: Option<InvocationBridge>,
}

impl Workbench {
    pub fn new(
        registry: Arc<ToolRegistry>,
        manager: Arc<SessionManager>,
        session: Arc<Session>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            registry,
            manager,
            session,
            orchestrator,
            specs: BTreeMap::new(),
            exposure: ExposureMode::default(),
            wait_timeout: Duration::from_secs(300),
            persistent: false,
            bridge: None,
        }
    }

    #[must_use]
    pub fn with_specs(mut self, specs: BTreeMap<String, ProviderSpec>) -> Self {
        self.specs = specs;
        self
    }

    #[must_use]
    pub fn with_exposure(mut self, mode: ExposureMode) -> Self {
        self.exposure = mode;
        self
    }

    /// Wires everything from config: registry, bridge, local backend,
    /// primary session and orchestrator. Returns the initial catalog too.
    pub async fn bootstrap(
        config: &Config,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<(Self, ToolCatalog)> {
        let registry = Arc::new(ToolRegistry::default().with_invoke_timeout(config.invoke_timeout()));
        let specs = config.provider_specs();
        let catalog = ToolCatalog::build(&registry, &specs).await;

        let bridge = if config.mcp.bridge {
            Some(InvocationBridge::start(registry.clone())?)
        } else {
            None
        };

        let backend = Arc::new(LocalBackend::new(config.backend_root())?);
        let mut manager = SessionManager::new(backend, config.session_settings()?);
        if let Some(bridge) = &bridge {
            manager = manager.with_bridge_url(bridge.url());
        }
        manager.set_modules(catalog.modules.clone());
        let manager = Arc::new(manager);

        let session = if config.session.persist {
            let store = SessionStore::open(&config.sessions_db_path())?;
            manager.sweep_expired(&store, config.max_age()).await?;
            let (session, reused) = manager
                .resume_or_create(&store, PRIMARY_SESSION, &config.config_hash(), config.max_age())
                .await?;
            tracing::info!(session_id = %session.id(), reused, "Primary session ready");
            session
        } else {
            manager.create_session(PRIMARY_SESSION).await?
        };

        let mut roles = RoleRegistry::with_builtin();
        roles
            .load_directory(&config.roles_dir())
            .map_err(|e| Error::Config(format!("roles: {e:#}")))?;
        let orchestrator = Orchestrator::new(
            manager.clone(),
            roles,
            runner,
            config.orchestrator.max_concurrent_tasks,
        );

        let mut workbench = Self::new(registry, manager, Arc::new(session), orchestrator)
            .with_specs(specs)
            .with_exposure(config.mcp.tool_exposure_mode);
        workbench.wait_timeout = config.wait_timeout();
        workbench.persistent = config.session.persist;
        workbench.bridge = bridge;
        Ok((workbench, catalog))
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Prompt text describing the installed tool modules.
    pub fn tool_summaries(&self) -> String {
        render_summaries(&self.manager.modules(), &self.specs, self.exposure)
    }

    pub async fn execute_code(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<ExecutionOutput, SessionError> {
        self.session.run_code(code, timeout).await
    }

    /// Context for the next decision step. Finished background results are
    /// delivered here exactly once, without any explicit wait.
    pub fn begin_step(&self) -> StepContext {
        StepContext {
            summaries: self.tool_summaries(),
            delivered: self.orchestrator.collect(),
        }
    }

    /// Rediscovers providers and brings the primary session's modules up to
    /// date. Providers whose cache is still valid are not contacted.
    pub async fn refresh_tools(&self) -> Result<(ToolCatalog, Vec<(String, InstallOutcome)>)> {
        let catalog = ToolCatalog::build(&self.registry, &self.specs).await;
        self.manager.set_modules(catalog.modules.clone());
        let installed = self.manager.sync_modules(&self.session).await?;
        Ok((catalog, installed))
    }

    /// Tool-layer context bound to the primary session.
    pub fn tool_context(&self, abort_signal: CancellationToken) -> ToolContext {
        ToolContext::new(self.session.clone(), abort_signal)
            .with_orchestrator(self.orchestrator.clone(), self.wait_timeout)
    }

    /// Cancels outstanding tasks, ends the primary session and closes every
    /// provider connection. A persistent session is detached, not destroyed.
    pub async fn close(mut self) {
        self.orchestrator.shutdown().await;
        if self.persistent {
            self.session.detach();
        } else {
            self.session.close().await;
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown();
        }
        self.registry.shutdown().await;
    }
}
