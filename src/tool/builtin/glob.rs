use super::{optional_usize, required_str};
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::json;

/// Paths returned when no limit is given.
const DEFAULT_LIMIT: usize = 200;

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (e.g., '*.json' or 'data/**/*.csv'), newest first"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The glob pattern. Without '/' it matches at any depth"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (default: session root)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of paths to return (default: 200)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&args, "pattern")?;
        let path = args.get("path").and_then(|v| v.as_str());
        let limit = optional_usize(&args, "limit").unwrap_or(DEFAULT_LIMIT);

        let mut paths = ctx.session.list_files(pattern, path).await?;
        let shown: Vec<String> = paths.by_ref().take(limit).collect();
        let more = paths.count();

        let mut content = if shown.is_empty() {
            "No files found matching the pattern.".to_string()
        } else {
            shown.join("\n")
        };
        if more > 0 {
            content.push_str(&format!("\n\n({more} more not shown)"));
        }
        Ok(ToolResult::ok(content).with_metadata(json!({ "count": shown.len() + more })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_glob_matches() {
        let ctx = tool_context().await;
        for path in ["data/a.json", "data/nested/b.json", "results/c.csv"] {
            ctx.session.write_file(path, "{}").await.unwrap();
        }

        let result = GlobTool
            .execute(json!({"pattern": "*.json"}), &ctx)
            .await
            .unwrap();
        let mut lines: Vec<&str> = result.content.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["data/a.json", "data/nested/b.json"]);

        let result = GlobTool
            .execute(json!({"pattern": "*.json", "path": "data", "limit": 1}), &ctx)
            .await
            .unwrap();
        assert!(result.content.contains("(1 more not shown)"));
        assert_eq!(result.metadata.unwrap()["count"], 2);
    }

    #[tokio::test]
    async fn test_glob_no_matches() {
        let ctx = tool_context().await;
        let result = GlobTool
            .execute(json!({"pattern": "*.parquet"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.content, "No files found matching the pattern.");
    }
}
