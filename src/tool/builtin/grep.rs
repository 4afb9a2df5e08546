use super::{optional_usize, required_str};
use crate::session::{SearchMode, SearchOptions};
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

/// Results returned when no head_limit is given.
const DEFAULT_HEAD_LIMIT: usize = 250;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents in the session with a regex"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "The directory or file to search in (default: session root)"
                },
                "glob": {
                    "type": "string",
                    "description": "Only search files matching this glob, e.g. '*.py'"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Matching lines, matching files, or match counts per file (default: content)"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Ignore case"
                },
                "multiline": {
                    "type": "boolean",
                    "description": "Let patterns span lines"
                },
                "offset": {
                    "type": "integer",
                    "description": "Skip this many results"
                },
                "head_limit": {
                    "type": "integer",
                    "description": "Maximum number of results (default: 250)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&args, "pattern")?;
        let path = args.get("path").and_then(Value::as_str);
        let flag = |key: &str| args.get(key).and_then(Value::as_bool).unwrap_or(false);
        let output_mode = args
            .get("output_mode")
            .and_then(Value::as_str)
            .unwrap_or("content");

        let mode = match output_mode {
            "content" => SearchMode::Content,
            "files_with_matches" | "count" => SearchMode::FilesWithMatches,
            other => {
                return Err(ToolError::InvalidArgs(format!(
                    "unknown output_mode: {other}"
                )));
            }
        };
        let offset = optional_usize(&args, "offset").unwrap_or(0);
        let head_limit = optional_usize(&args, "head_limit").unwrap_or(DEFAULT_HEAD_LIMIT);
        let options = SearchOptions {
            mode,
            case_insensitive: flag("case_insensitive"),
            glob: args.get("glob").and_then(Value::as_str).map(str::to_string),
            multiline: flag("multiline"),
            offset,
            head_limit: Some(head_limit),
        };

        let results: Vec<String> = if output_mode == "count" {
            ctx.session
                .count_matches(pattern, path, options)
                .await?
                .into_iter()
                .skip(offset)
                .take(head_limit)
                .map(|(path, count)| format!("{path}:{count}"))
                .collect()
        } else {
            let mut hits = ctx.session.search_content(pattern, path, options).await?;
            let mut results = Vec::new();
            while let Some(hit) = hits.next().await {
                if ctx.abort_signal.is_cancelled() {
                    return Err(ToolError::Cancelled);
                }
                let hit = hit?;
                results.push(match mode {
                    SearchMode::Content => format!("{}:{}: {}", hit.path, hit.line, hit.text.trim()),
                    SearchMode::FilesWithMatches => hit.path,
                });
            }
            results
        };

        Ok(ToolResult::ok(if results.is_empty() {
            "No matches found.".to_string()
        } else {
            results.join("\n")
        })
        .with_metadata(json!({ "match_count": results.len() })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    async fn seeded() -> ToolContext {
        let ctx = tool_context().await;
        ctx.session
            .write_file("data/a.py", "import os\nTOKEN = 1\ntoken = 2\n")
            .await
            .unwrap();
        ctx.session
            .write_file("data/b.txt", "token token\n")
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_grep_content() {
        let ctx = seeded().await;
        let result = GrepTool
            .execute(json!({"pattern": "token", "path": "data"}), &ctx)
            .await
            .unwrap();
        assert_eq!(
            result.content,
            "data/a.py:3: token = 2\ndata/b.txt:1: token token"
        );
    }

    #[tokio::test]
    async fn test_grep_modes() {
        let ctx = seeded().await;
        let result = GrepTool
            .execute(
                json!({
                    "pattern": "token",
                    "path": "data",
                    "case_insensitive": true,
                    "output_mode": "count"
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.content, "data/a.py:2\ndata/b.txt:2");

        let result = GrepTool
            .execute(
                json!({
                    "pattern": "token",
                    "path": "data",
                    "glob": "*.py",
                    "output_mode": "files_with_matches"
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.content, "data/a.py");

        assert!(matches!(
            GrepTool
                .execute(json!({"pattern": "x", "output_mode": "lines"}), &ctx)
                .await,
            Err(ToolError::InvalidArgs(_))
        ));
    }

    #[tokio::test]
    async fn test_grep_no_matches() {
        let ctx = seeded().await;
        let result = GrepTool
            .execute(json!({"pattern": "zq[0-9]absent"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.content, "No matches found.");
    }
}
