//! Shared fixtures for unit tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{TaskContext, TaskOutput, TaskRunner};
use crate::mcp::{
    ConnectionError, Connector, McpToolDef, ProviderSpec, ProviderTransport, TransportError,
};
use crate::sandbox::LocalBackend;
use crate::session::{SessionManager, SessionSettings};
use crate::tool::ToolContext;
use tokio_util::sync::CancellationToken;

/// In-memory provider with scripted responses.
#[derive(Clone, Default)]
pub struct MockTransport {
    tools: Arc<Mutex<Vec<McpToolDef>>>,
    responses: HashMap<String, Value>,
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    discover_calls: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(self, name: &str, input_schema: Value) -> Self {
        self.tools.lock().unwrap().push(McpToolDef {
            name: name.to_string(),
            description: format!("The {name} tool."),
            input_schema,
            output_schema: None,
        });
        self
    }

    pub fn with_response(mut self, tool: &str, result: Value) -> Self {
        self.responses.insert(tool.to_string(), result);
        self
    }

    pub fn with_failure(mut self, tool: &str, message: &str) -> Self {
        self.failures.insert(tool.to_string(), message.to_string());
        self
    }

    pub fn with_delay(mut self, tool: &str, delay: Duration) -> Self {
        self.delays.insert(tool.to_string(), delay);
        self
    }

    pub fn tools_handle(&self) -> Arc<Mutex<Vec<McpToolDef>>> {
        self.tools.clone()
    }

    pub fn discover_calls(&self) -> Arc<AtomicUsize> {
        self.discover_calls.clone()
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<(String, Value)>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    async fn discover(&self) -> Result<Vec<McpToolDef>, TransportError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), arguments.clone()));
        if let Some(delay) = self.delays.get(tool) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(message) = self.failures.get(tool) {
            return Err(TransportError::Remote(message.clone()));
        }
        Ok(self
            .responses
            .get(tool)
            .cloned()
            .unwrap_or_else(|| json!({"tool": tool, "arguments": arguments})))
    }
}

/// Hands out mock transports by provider name; unknown names are unreachable.
#[derive(Default)]
pub struct MockConnector {
    providers: HashMap<String, MockTransport>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: &str, transport: MockTransport) -> Self {
        self.providers.insert(name.to_string(), transport);
        self
    }

    /// Documents intent in tests; any name not registered is unreachable.
    pub fn with_unreachable(self, name: &str) -> Self {
        debug_assert!(!self.providers.contains_key(name));
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        spec: &ProviderSpec,
    ) -> Result<Arc<dyn ProviderTransport>, ConnectionError> {
        match self.providers.get(&spec.name) {
            Some(transport) => Ok(Arc::new(transport.clone())),
            None => Err(ConnectionError::Unreachable {
                provider: spec.name.clone(),
                message: "connection refused".into(),
            }),
        }
    }
}

/// Session settings that run code through `sh`, so tests need no Python.
pub fn shell_settings() -> SessionSettings {
    SessionSettings {
        interpreter: "sh".to_string(),
        code_extension: "sh".to_string(),
        default_timeout: Duration::from_secs(10),
        ..SessionSettings::default()
    }
}

/// Manager over a throwaway local backend.
pub fn task_manager() -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(LocalBackend::temporary().unwrap()),
        shell_settings(),
    ))
}

/// Tool context over a fresh session without an orchestrator.
pub async fn tool_context() -> ToolContext {
    let session = task_manager().create_session("tools").await.unwrap();
    ToolContext::new(Arc::new(session), CancellationToken::new())
}

/// Runner scripted by its brief: `sleep:<ms>`, `fail:<message>` or `panic`.
pub struct MockRunner;

#[async_trait]
impl TaskRunner for MockRunner {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<TaskOutput> {
        ctx.progress.report("started");
        if let Some(ms) = ctx.brief.strip_prefix("sleep:") {
            let ms: u64 = ms.parse()?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(TaskOutput {
                summary: format!("slept {ms}ms"),
                ..TaskOutput::default()
            });
        }
        if let Some(message) = ctx.brief.strip_prefix("fail:") {
            anyhow::bail!("{message}");
        }
        if ctx.brief == "panic" {
            panic!("scripted panic");
        }
        anyhow::bail!("unknown brief: {}", ctx.brief)
    }
}
