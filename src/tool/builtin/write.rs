use super::required_str;
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::json;

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the session"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path relative to the session root, or absolute under it"
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let file_path = required_str(&args, "file_path")?;
        let content = required_str(&args, "content")?;
        let bytes = ctx.session.write_file(file_path, content).await?;
        Ok(ToolResult::ok(format!("Wrote {bytes} bytes to {file_path}"))
            .with_metadata(json!({ "bytes": bytes })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_write_creates_parents() {
        let ctx = tool_context().await;
        let result = WriteTool
            .execute(
                json!({"file_path": "results/deep/out.csv", "content": "a,b\n"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.content, "Wrote 4 bytes to results/deep/out.csv");
        let bytes = ctx.session.read_bytes("results/deep/out.csv").await.unwrap();
        assert_eq!(bytes, b"a,b\n");
    }

    #[tokio::test]
    async fn test_write_requires_content() {
        let ctx = tool_context().await;
        assert!(matches!(
            WriteTool.execute(json!({"file_path": "x"}), &ctx).await,
            Err(ToolError::InvalidArgs(_))
        ));
    }
}
