use super::{optional_usize, required_str};
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::json;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the session as numbered lines"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path relative to the session root, or absolute under it"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Number of lines to read"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let file_path = required_str(&args, "file_path")?;
        let content = ctx
            .session
            .read_file(
                file_path,
                optional_usize(&args, "offset"),
                optional_usize(&args, "limit"),
            )
            .await?;
        Ok(ToolResult::ok(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_read_numbered_lines() {
        let ctx = tool_context().await;
        ctx.session
            .write_file("data/notes.txt", "one\ntwo\nthree\n")
            .await
            .unwrap();
        let result = ReadTool
            .execute(
                json!({"file_path": "data/notes.txt", "offset": 2, "limit": 1}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.content, "     2\u{2192}two");
    }

    #[tokio::test]
    async fn test_read_outside_root() {
        let ctx = tool_context().await;
        assert!(matches!(
            ReadTool
                .execute(json!({"file_path": "../secret"}), &ctx)
                .await,
            Err(ToolError::PermissionDenied(_))
        ));
        assert!(matches!(
            ReadTool
                .execute(json!({"file_path": "data/missing.txt"}), &ctx)
                .await,
            Err(ToolError::ExecutionFailed(_))
        ));
    }
}
