//! Background task affordances for the primary task: dispatch, poll, wait
//! and cancel. Finished results also arrive on their own at the next step.

use super::required_str;
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ToolError> {
    serde_json::to_string_pretty(value).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
}

pub struct DispatchTaskTool;

#[async_trait]
impl Tool for DispatchTaskTool {
    fn name(&self) -> &str {
        "dispatch_task"
    }

    fn description(&self) -> &str {
        "Start a sub-task in the background and return immediately with its id. \
         The result is delivered automatically once it finishes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "role": {
                    "type": "string",
                    "description": "Role to run the sub-task under (e.g. general, research)"
                },
                "brief": {
                    "type": "string",
                    "description": "What the sub-task should do and report back"
                }
            },
            "required": ["role", "brief"]
        })
    }

    fn requires_orchestrator(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let role = required_str(&args, "role")?;
        let brief = required_str(&args, "brief")?;
        let task = ctx.orchestrator()?.dispatch(role, brief)?;
        Ok(
            ToolResult::ok(format!("Dispatched {} ({}): {}", task.id, task.role, task.state))
                .with_metadata(json!({ "task_id": task.id })),
        )
    }
}

pub struct TaskStatusTool;

#[async_trait]
impl Tool for TaskStatusTool {
    fn name(&self) -> &str {
        "task_status"
    }

    fn description(&self) -> &str {
        "Check a background task's state and progress without waiting. \
         Without task_id, lists every task."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "Task to check (default: all tasks)"
                }
            }
        })
    }

    fn requires_orchestrator(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let orchestrator = ctx.orchestrator()?;
        let content = match args.get("task_id").and_then(Value::as_str) {
            Some(task_id) => to_json(&orchestrator.poll(task_id)?)?,
            None => to_json(&orchestrator.list())?,
        };
        Ok(ToolResult::ok(content))
    }
}

pub struct WaitTaskTool;

#[async_trait]
impl Tool for WaitTaskTool {
    fn name(&self) -> &str {
        "wait_task"
    }

    fn description(&self) -> &str {
        "Block until a background task finishes and return its result. \
         Only use this when the next step cannot proceed without it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "Task to wait for"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds to wait before giving up"
                }
            },
            "required": ["task_id"]
        })
    }

    fn requires_orchestrator(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let task_id = required_str(&args, "task_id")?;
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map_or(ctx.wait_timeout, Duration::from_secs);
        let orchestrator = ctx.orchestrator()?;

        let report = tokio::select! {
            report = orchestrator.wait(task_id, timeout) => report?,
            () = ctx.abort_signal.cancelled() => return Err(ToolError::Cancelled),
        };
        let is_error = report.outcome.state() != crate::agent::TaskState::Completed;
        Ok(ToolResult {
            content: report.headline(),
            is_error,
            metadata: Some(serde_json::to_value(&report.outcome).unwrap_or(Value::Null)),
        })
    }
}

pub struct CancelTaskTool;

#[async_trait]
impl Tool for CancelTaskTool {
    fn name(&self) -> &str {
        "cancel_task"
    }

    fn description(&self) -> &str {
        "Stop waiting for a background task and tear down its session"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "Task to cancel"
                }
            },
            "required": ["task_id"]
        })
    }

    fn requires_orchestrator(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let task_id = required_str(&args, "task_id")?;
        let state = ctx.orchestrator()?.cancel(task_id).await?;
        Ok(ToolResult::ok(format!("{task_id}: {state}")))
    }
}
