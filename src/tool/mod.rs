pub mod builtin;
pub mod types;

pub use types::*;

use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};

use crate::agent::RoleConfig;

/// Routes decision-maker tool calls to the registered tools.
pub struct ToolOrchestrator {
    tools: HashMap<String, Box<dyn Tool>>,
    /// When set, only these tools may be called.
    allowed: Option<BTreeSet<String>>,
}

impl ToolOrchestrator {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            allowed: None,
        }
    }

    pub fn register_tool(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Restricts calls to `tools`. Unknown names are ignored.
    #[must_use]
    pub fn with_allowed<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed.as_ref().is_none_or(|a| a.contains(name))
    }

    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::ExecutionFailed(format!("Tool not found: {name}")))?;
        if !self.is_allowed(name) {
            return Err(ToolError::PermissionDenied(format!(
                "Tool {name} is not available to this role"
            )));
        }
        if ctx.abort_signal.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        tracing::debug!(tool = %name, session_id = %ctx.session.id(), "Calling tool");
        let result = tool.execute(args, ctx).await;
        if let Err(e) = &result {
            tracing::debug!(tool = %name, "Tool failed: {}", e);
        }
        result
    }

    /// Callable tools, sorted by name.
    pub fn list_tools(&self) -> Vec<&dyn Tool> {
        let mut tools: Vec<&dyn Tool> = self
            .tools
            .values()
            .filter(|t| self.is_allowed(t.name()))
            .map(|t| t.as_ref())
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Tool definitions in the `{name, description, input_schema}` shape
    /// decision-makers accept.
    pub fn definitions(&self) -> Vec<Value> {
        self.list_tools()
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.parameters(),
                })
            })
            .collect()
    }

    /// Tools for the primary task: code and file tools plus the background
    /// task tools.
    pub fn with_builtins() -> Self {
        let mut orch = Self::new();
        orch.register_tool(Box::new(builtin::ExecuteCodeTool));
        orch.register_tool(Box::new(builtin::BashTool));
        orch.register_tool(Box::new(builtin::ReadTool));
        orch.register_tool(Box::new(builtin::WriteTool));
        orch.register_tool(Box::new(builtin::EditTool));
        orch.register_tool(Box::new(builtin::GlobTool));
        orch.register_tool(Box::new(builtin::GrepTool));
        orch.register_tool(Box::new(builtin::DispatchTaskTool));
        orch.register_tool(Box::new(builtin::TaskStatusTool));
        orch.register_tool(Box::new(builtin::WaitTaskTool));
        orch.register_tool(Box::new(builtin::CancelTaskTool));
        orch
    }

    /// Tools for a background task under `role`. Task tools are left out and
    /// the role's whitelist applies when it has one.
    pub fn for_role(role: &RoleConfig) -> Self {
        let mut orch = Self::with_builtins();
        orch.tools.retain(|_, t| !t.requires_orchestrator());
        if !role.tools.is_empty() {
            orch = orch.with_allowed(role.tools.iter().cloned());
        }
        orch
    }
}

impl Default for ToolOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
