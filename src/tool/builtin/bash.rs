use super::{execution_result, required_str, timeout_arg, until_aborted};
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::json;

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command at the session root. Prefer execute_code for tool calls \
         and the file tools (glob, grep, read_file, edit_file) for file operations."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds before the command is stopped (default: session setting)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let command = required_str(&args, "command")?;
        let result =
            until_aborted(ctx, ctx.session.run_command(command, timeout_arg(&args))).await?;
        execution_result(result)
    }
}
