use super::{execution_result, required_str, timeout_arg, until_aborted};
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::json;

pub struct ExecuteCodeTool;

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn name(&self) -> &'static str {
        "execute_code"
    }

    fn description(&self) -> &'static str {
        "Run code in the session's interpreter. Import tool modules from `tools`, keep large \
         intermediate results in data/ or results/, and print only what you need to see."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The code to run"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds before the run is stopped (default: session setting)"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let code = required_str(&args, "code")?;
        let result = until_aborted(ctx, ctx.session.run_code(code, timeout_arg(&args))).await?;
        execution_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_execute_code_success() {
        let ctx = tool_context().await;
        let result = ExecuteCodeTool
            .execute(json!({"code": "echo hello\necho oops >&2"}), &ctx)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.content.starts_with("Exit code: 0\n"));
        assert!(result.content.contains("hello\nSTDERR:\noops\n"));
    }

    #[tokio::test]
    async fn test_execute_code_failure_keeps_output() {
        let ctx = tool_context().await;
        let result = ExecuteCodeTool
            .execute(json!({"code": "echo partial\nexit 3"}), &ctx)
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("partial"));
        let metadata = result.metadata.unwrap();
        assert_eq!(metadata["exit_code"], 3);
        assert_eq!(metadata["error"], "runtime");
    }

    #[tokio::test]
    async fn test_execute_code_timeout() {
        let ctx = tool_context().await;
        let result = ExecuteCodeTool
            .execute(
                json!({"code": "echo before\nsleep 30", "timeout_secs": 1}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("before"));
        assert_eq!(result.metadata.unwrap()["error"], "timeout");
    }

    #[tokio::test]
    async fn test_execute_code_requires_code() {
        let ctx = tool_context().await;
        assert!(matches!(
            ExecuteCodeTool.execute(json!({}), &ctx).await,
            Err(ToolError::InvalidArgs(_))
        ));
    }
}
