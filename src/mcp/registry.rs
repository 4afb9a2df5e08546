use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use super::descriptor::{ToolDescriptor, fingerprint};
use super::transport::{Connector, DefaultConnector, ProviderTransport};
use super::{ConnectionError, DiscoveryError, InvocationError, ProviderSpec, TransportError};

const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Failed(String),
    Closed,
}

#[derive(Default)]
struct DescriptorCache {
    tools: Option<Arc<[ToolDescriptor]>>,
    fingerprint: Option<String>,
}

/// A provider connection owned by the registry.
pub struct ProviderConnection {
    spec: ProviderSpec,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn ProviderTransport>>>,
    cache: Mutex<DescriptorCache>,
    generation: AtomicU64,
}

impl ProviderConnection {
    fn new(spec: ProviderSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(ConnectionState::Connecting),
            transport: Mutex::new(None),
            cache: Mutex::new(DescriptorCache::default()),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.state), ConnectionState::Ready)
    }

    /// Bumped every time the cached descriptor set changes content.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Fingerprint of the last discovered descriptor set.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        lock(&self.cache).fingerprint.clone()
    }

    #[must_use]
    pub fn cached_tools(&self) -> Option<Arc<[ToolDescriptor]>> {
        lock(&self.cache).tools.clone()
    }

    fn transport(&self) -> Option<Arc<dyn ProviderTransport>> {
        lock(&self.transport).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn invalidate(&self) {
        lock(&self.cache).tools = None;
    }

    /// Stores a fresh descriptor set, bumping the generation when it differs.
    fn store(&self, tools: Vec<ToolDescriptor>) -> Arc<[ToolDescriptor]> {
        let print = fingerprint(&tools);
        let tools: Arc<[ToolDescriptor]> = tools.into();
        let mut cache = lock(&self.cache);
        if cache.fingerprint.as_deref() != Some(print.as_str()) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            cache.fingerprint = Some(print);
        }
        cache.tools = Some(tools.clone());
        tools
    }

    async fn close(&self) {
        let transport = lock(&self.transport).take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.invalidate();
        self.set_state(ConnectionState::Closed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Connect,
    Discover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProviderStatus {
    Ready { tool_count: usize },
    Failed { stage: FailureStage, message: String },
    Disabled,
}

/// Outcome of discovering every configured provider.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub statuses: BTreeMap<String, ProviderStatus>,
    pub tools: BTreeMap<String, Vec<ToolDescriptor>>,
}

impl DiscoveryReport {
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProviderStatus)> {
        self.statuses
            .iter()
            .filter(|(_, status)| matches!(status, ProviderStatus::Failed { .. }))
            .map(|(name, status)| (name.as_str(), status))
    }

    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.values().map(Vec::len).sum()
    }
}

/// Owns all provider connections. Shared by sessions through an `Arc`.
pub struct ToolRegistry {
    connector: Arc<dyn Connector>,
    connections: RwLock<BTreeMap<String, Arc<ProviderConnection>>>,
    invoke_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConnector))
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(BTreeMap::new()),
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    #[must_use]
    pub fn invoke_timeout(&self) -> Duration {
        self.invoke_timeout
    }

    #[must_use]
    pub fn connection(&self, provider: &str) -> Option<Arc<ProviderConnection>> {
        self.connections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ProviderConnection>> {
        self.connections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Opens a connection, or returns the existing one if it is ready.
    pub async fn connect(
        &self,
        spec: ProviderSpec,
    ) -> Result<Arc<ProviderConnection>, ConnectionError> {
        if !spec.enabled {
            return Err(ConnectionError::Disabled {
                provider: spec.name,
            });
        }
        if let Some(existing) = self.connection(&spec.name)
            && existing.is_ready()
        {
            return Ok(existing);
        }

        let connection = Arc::new(ProviderConnection::new(spec));
        self.connections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(connection.name().to_string(), connection.clone());

        tracing::debug!(
            provider = %connection.name(),
            transport = %connection.spec().transport,
            endpoint = %connection.spec().endpoint(),
            "Connecting to tool provider"
        );
        match self.connector.connect(connection.spec()).await {
            Ok(transport) => {
                *lock(&connection.transport) = Some(transport);
                connection.set_state(ConnectionState::Ready);
                tracing::info!(provider = %connection.name(), "Tool provider connected");
                Ok(connection)
            }
            Err(e) => {
                tracing::error!(provider = %connection.name(), "Failed to connect: {}", e);
                connection.set_state(ConnectionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Ordered descriptors for a provider. Served from cache until the
    /// provider signals a schema change.
    pub async fn list_tools(
        &self,
        provider: &str,
    ) -> Result<Arc<[ToolDescriptor]>, DiscoveryError> {
        let not_connected = || DiscoveryError::NotConnected {
            provider: provider.to_string(),
        };
        let connection = self.connection(provider).ok_or_else(not_connected)?;
        if !connection.is_ready() {
            return Err(not_connected());
        }
        if let Some(tools) = connection.cached_tools() {
            return Ok(tools);
        }
        let transport = connection.transport().ok_or_else(not_connected)?;

        let defs = transport.discover().await.map_err(|e| match e {
            TransportError::Protocol(message) => DiscoveryError::Malformed {
                provider: provider.to_string(),
                message,
            },
            other => DiscoveryError::Unavailable {
                provider: provider.to_string(),
                message: other.to_string(),
            },
        })?;

        let mut tools: Vec<ToolDescriptor> = defs
            .iter()
            .map(|def| ToolDescriptor::from_def(provider, def))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        tracing::debug!(provider = %provider, count = tools.len(), "Discovered tools");
        Ok(connection.store(tools))
    }

    /// Connects and discovers every spec concurrently. A failing provider
    /// only produces a failure entry.
    pub async fn discover_all(&self, specs: &[ProviderSpec]) -> DiscoveryReport {
        let attempts = specs.iter().map(|spec| async move {
            let name = spec.name.clone();
            if !spec.enabled {
                return (name, Err(ProviderStatus::Disabled));
            }
            if let Err(e) = self.connect(spec.clone()).await {
                return (
                    name,
                    Err(ProviderStatus::Failed {
                        stage: FailureStage::Connect,
                        message: e.to_string(),
                    }),
                );
            }
            match self.list_tools(&name).await {
                Ok(tools) => (name, Ok(tools)),
                Err(e) => {
                    tracing::error!(provider = %name, "Failed to list tools: {}", e);
                    (
                        name,
                        Err(ProviderStatus::Failed {
                            stage: FailureStage::Discover,
                            message: e.to_string(),
                        }),
                    )
                }
            }
        });

        let mut report = DiscoveryReport::default();
        for (name, outcome) in futures::future::join_all(attempts).await {
            match outcome {
                Ok(tools) => {
                    report.statuses.insert(
                        name.clone(),
                        ProviderStatus::Ready {
                            tool_count: tools.len(),
                        },
                    );
                    report.tools.insert(name, tools.to_vec());
                }
                Err(status) => {
                    report.statuses.insert(name, status);
                }
            }
        }
        report
    }

    /// Calls a tool with the registry's default timeout.
    pub async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, InvocationError> {
        self.invoke_with_timeout(provider, tool, arguments, self.invoke_timeout)
            .await
    }

    /// Calls a tool. A timeout abandons only this call; the connection stays ready.
    pub async fn invoke_with_timeout(
        &self,
        provider: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, InvocationError> {
        let not_connected = || InvocationError::NotConnected {
            provider: provider.to_string(),
            tool: tool.to_string(),
        };
        let connection = self.connection(provider).ok_or_else(not_connected)?;
        if !connection.is_ready() {
            return Err(not_connected());
        }
        if let Some(tools) = connection.cached_tools()
            && !tools.iter().any(|t| t.name == tool)
        {
            return Err(InvocationError::UnknownTool {
                provider: provider.to_string(),
                tool: tool.to_string(),
            });
        }
        let transport = connection.transport().ok_or_else(not_connected)?;

        tracing::debug!(provider = %provider, tool = %tool, "Invoking tool");
        match tokio::time::timeout(timeout, transport.invoke(tool, arguments)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(TransportError::Disconnected)) => {
                connection.set_state(ConnectionState::Failed("disconnected".into()));
                Err(not_connected())
            }
            Ok(Err(e)) => Err(InvocationError::RemoteFault {
                provider: provider.to_string(),
                tool: tool.to_string(),
                message: match e {
                    TransportError::Remote(message) => message,
                    other => other.to_string(),
                },
            }),
            Err(_) => {
                tracing::warn!(provider = %provider, tool = %tool, ?timeout, "Tool call timed out");
                Err(InvocationError::Timeout {
                    provider: provider.to_string(),
                    tool: tool.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Drops the cached descriptors so the next `list_tools` rediscovers.
    pub fn notify_schema_changed(&self, provider: &str) {
        if let Some(connection) = self.connection(provider) {
            tracing::debug!(provider = %provider, "Tool schema changed, invalidating cache");
            connection.invalidate();
        }
    }

    /// Cached descriptors of every ready provider.
    #[must_use]
    pub fn tools_by_provider(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        self.connections()
            .into_iter()
            .filter(|c| c.is_ready())
            .filter_map(|c| {
                c.cached_tools()
                    .map(|tools| (c.name().to_string(), tools.to_vec()))
            })
            .collect()
    }

    /// Search tools by keyword (case-insensitive substring match on name + description).
    #[must_use]
    pub fn search_tools(&self, query: &str) -> Vec<ToolDescriptor> {
        let query_lower = query.to_lowercase();
        self.tools_by_provider()
            .into_values()
            .flatten()
            .filter(|tool| {
                tool.name.to_lowercase().contains(&query_lower)
                    || tool.description.to_lowercase().contains(&query_lower)
            })
            .collect()
    }

    /// Closes and forgets one provider.
    pub async fn disable(&self, provider: &str) -> bool {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(provider);
        match removed {
            Some(connection) => {
                connection.close().await;
                tracing::info!(provider = %provider, "Tool provider disabled");
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let all: Vec<_> = std::mem::take(
            &mut *self
                .connections
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
        .into_values()
        .collect();
        for connection in all {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::InvocationErrorKind;
    use crate::testing::{MockConnector, MockTransport};
    use serde_json::json;

    fn alpha() -> MockTransport {
        MockTransport::new()
            .with_tool("search", json!({"properties": {"q": {"type": "string"}}, "required": ["q"]}))
            .with_tool("fetch", json!({"properties": {"url": {"type": "string"}}}))
            .with_tool("summarize", json!({}))
    }

    #[tokio::test]
    async fn test_discover_all_isolates_failures() {
        let connector = MockConnector::new()
            .with_provider("alpha", alpha())
            .with_unreachable("beta");
        let registry = ToolRegistry::new(Arc::new(connector));

        let report = registry
            .discover_all(&[
                ProviderSpec::stdio("alpha", "alpha-server"),
                ProviderSpec::stdio("beta", "beta-server"),
            ])
            .await;

        assert_eq!(report.tools.len(), 1);
        assert_eq!(report.tools["alpha"].len(), 3);
        assert_eq!(
            report.statuses["alpha"],
            ProviderStatus::Ready { tool_count: 3 }
        );
        assert!(matches!(
            report.statuses["beta"],
            ProviderStatus::Failed {
                stage: FailureStage::Connect,
                ..
            }
        ));
        assert_eq!(report.failures().count(), 1);
        assert_eq!(registry.tools_by_provider().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_provider_is_reported() {
        let registry = ToolRegistry::new(Arc::new(MockConnector::new()));
        let spec = ProviderSpec {
            enabled: false,
            ..ProviderSpec::stdio("gamma", "gamma-server")
        };
        let report = registry.discover_all(&[spec.clone()]).await;
        assert_eq!(report.statuses["gamma"], ProviderStatus::Disabled);
        assert!(matches!(
            registry.connect(spec).await,
            Err(ConnectionError::Disabled { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_tools_is_cached_until_schema_change() {
        let transport = alpha();
        let calls = transport.discover_calls();
        let connector = MockConnector::new().with_provider("alpha", transport);
        let registry = ToolRegistry::new(Arc::new(connector));
        registry
            .connect(ProviderSpec::stdio("alpha", "alpha-server"))
            .await
            .unwrap();

        let first = registry.list_tools("alpha").await.unwrap();
        let second = registry.list_tools("alpha").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let connection = registry.connection("alpha").unwrap();
        assert_eq!(connection.generation(), 1);

        registry.notify_schema_changed("alpha");
        registry.list_tools("alpha").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Same content, same generation.
        assert_eq!(connection.generation(), 1);
    }

    #[tokio::test]
    async fn test_schema_change_bumps_generation() {
        let transport = alpha();
        let tools = transport.tools_handle();
        let connector = MockConnector::new().with_provider("alpha", transport);
        let registry = ToolRegistry::new(Arc::new(connector));
        registry
            .connect(ProviderSpec::stdio("alpha", "alpha-server"))
            .await
            .unwrap();
        registry.list_tools("alpha").await.unwrap();

        tools.lock().unwrap().pop();
        registry.notify_schema_changed("alpha");
        let refreshed = registry.list_tools("alpha").await.unwrap();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(registry.connection("alpha").unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_invoke_timeout_keeps_connection_usable() {
        let transport = alpha()
            .with_response("search", json!({"hits": 3}))
            .with_delay("fetch", Duration::from_millis(500));
        let connector = MockConnector::new().with_provider("alpha", transport);
        let registry = ToolRegistry::new(Arc::new(connector));
        registry
            .connect(ProviderSpec::stdio("alpha", "alpha-server"))
            .await
            .unwrap();

        let err = registry
            .invoke_with_timeout("alpha", "fetch", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), InvocationErrorKind::Timeout);
        assert_eq!(err.provider(), "alpha");
        assert_eq!(err.tool(), "fetch");

        let result = registry
            .invoke("alpha", "search", json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"hits": 3}));
        assert!(registry.connection("alpha").unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_invoke_remote_fault_and_unknown_tool() {
        let transport = alpha().with_failure("summarize", "model overloaded");
        let connector = MockConnector::new().with_provider("alpha", transport);
        let registry = ToolRegistry::new(Arc::new(connector));
        registry
            .connect(ProviderSpec::stdio("alpha", "alpha-server"))
            .await
            .unwrap();
        registry.list_tools("alpha").await.unwrap();

        let err = registry
            .invoke("alpha", "summarize", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), InvocationErrorKind::RemoteFault);
        assert!(err.to_string().contains("model overloaded"));

        let err = registry.invoke("alpha", "nope", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), InvocationErrorKind::UnknownTool);

        let err = registry.invoke("beta", "x", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), InvocationErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_search_and_disable() {
        let connector = MockConnector::new().with_provider("alpha", alpha());
        let registry = ToolRegistry::new(Arc::new(connector));
        registry
            .discover_all(&[ProviderSpec::stdio("alpha", "alpha-server")])
            .await;

        let hits = registry.search_tools("FETCH");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "fetch");

        assert!(registry.disable("alpha").await);
        assert!(!registry.disable("alpha").await);
        assert!(registry.search_tools("fetch").is_empty());
        assert!(matches!(
            registry.list_tools("alpha").await,
            Err(DiscoveryError::NotConnected { .. })
        ));
    }
}
