//! Descriptor registry: remote tool providers, their connections and the
//! tool descriptors they advertise.

mod bridge;
mod descriptor;
mod registry;
mod transport;

pub use bridge::{BridgeCall, BridgeFault, BridgeReply, InvocationBridge};
pub use descriptor::{McpToolDef, ParamSpec, ParamType, ToolDescriptor, fingerprint};
pub use registry::{
    ConnectionState, DiscoveryReport, FailureStage, ProviderConnection, ProviderStatus,
    ToolRegistry,
};
pub use transport::{Connector, DefaultConnector, HttpTransport, ProviderTransport, StdioTransport};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::codegen::ExposureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// How to reach one tool provider. Loaded from `[providers.<name>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSpec {
    /// Filled from the config table key when empty.
    pub name: String,
    pub enabled: bool,
    pub description: String,
    /// Extra usage notes shown next to the provider summary.
    pub instruction: String,
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub url: Option<String>,
    /// Overrides the global exposure mode for this provider.
    pub tool_exposure_mode: Option<ExposureMode>,
}

impl Default for ProviderSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            description: String::new(),
            instruction: String::new(),
            transport: TransportKind::Stdio,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            tool_exposure_mode: None,
        }
    }
}

impl ProviderSpec {
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Human-readable endpoint used in logs and status output.
    #[must_use]
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::Stdio => {
                let mut parts = vec![self.command.clone().unwrap_or_default()];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
            TransportKind::Http => self.url.clone().unwrap_or_default(),
        }
    }
}

/// Low-level transport failure, before it is attributed to a registry stage.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn server: {0}")]
    SpawnFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("provider `{provider}` is disabled")]
    Disabled { provider: String },

    #[error("provider `{provider}` has no {field} configured")]
    InvalidSpec {
        provider: String,
        field: &'static str,
    },

    #[error("failed to connect to provider `{provider}`: {message}")]
    Unreachable { provider: String, message: String },
}

impl ConnectionError {
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Disabled { provider }
            | Self::InvalidSpec { provider, .. }
            | Self::Unreachable { provider, .. } => provider,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("provider `{provider}` is not connected")]
    NotConnected { provider: String },

    #[error("provider `{provider}` failed to list tools: {message}")]
    Unavailable { provider: String, message: String },

    #[error("provider `{provider}` returned a malformed tool list: {message}")]
    Malformed { provider: String, message: String },
}

impl DiscoveryError {
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::NotConnected { provider }
            | Self::Unavailable { provider, .. }
            | Self::Malformed { provider, .. } => provider,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    Timeout,
    RemoteFault,
    NotConnected,
    UnknownTool,
}

impl InvocationErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RemoteFault => "remote_fault",
            Self::NotConnected => "not_connected",
            Self::UnknownTool => "unknown_tool",
        }
    }
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("call to `{provider}.{tool}` timed out after {timeout:?}")]
    Timeout {
        provider: String,
        tool: String,
        timeout: Duration,
    },

    #[error("`{provider}.{tool}` failed: {message}")]
    RemoteFault {
        provider: String,
        tool: String,
        message: String,
    },

    #[error("provider `{provider}` is not connected (calling `{tool}`)")]
    NotConnected { provider: String, tool: String },

    #[error("provider `{provider}` has no tool `{tool}`")]
    UnknownTool { provider: String, tool: String },
}

impl InvocationError {
    #[must_use]
    pub fn kind(&self) -> InvocationErrorKind {
        match self {
            Self::Timeout { .. } => InvocationErrorKind::Timeout,
            Self::RemoteFault { .. } => InvocationErrorKind::RemoteFault,
            Self::NotConnected { .. } => InvocationErrorKind::NotConnected,
            Self::UnknownTool { .. } => InvocationErrorKind::UnknownTool,
        }
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Timeout { provider, .. }
            | Self::RemoteFault { provider, .. }
            | Self::NotConnected { provider, .. }
            | Self::UnknownTool { provider, .. } => provider,
        }
    }

    #[must_use]
    pub fn tool(&self) -> &str {
        match self {
            Self::Timeout { tool, .. }
            | Self::RemoteFault { tool, .. }
            | Self::NotConnected { tool, .. }
            | Self::UnknownTool { tool, .. } => tool,
        }
    }
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),
}
