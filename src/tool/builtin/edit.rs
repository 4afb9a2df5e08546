use super::required_str;
use crate::tool::{Tool, ToolContext, ToolError, ToolResult};
use async_trait::async_trait;
use serde_json::json;

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing exact text. Use for surgical edits instead of rewriting entire files."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path relative to the session root, or absolute under it"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact text to replace (must exist in file)"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text (must differ from old_string)"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false, requires unique match)"
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let file_path = required_str(&args, "file_path")?;
        let old_string = required_str(&args, "old_string")?;
        let new_string = required_str(&args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let outcome = if replace_all {
            ctx.session
                .replace_all(file_path, old_string, new_string)
                .await?
        } else {
            ctx.session
                .edit_file(file_path, old_string, new_string)
                .await?
        };

        let occurrences = if outcome.replacements > 1 {
            format!(" ({} occurrences)", outcome.replacements)
        } else {
            String::new()
        };
        Ok(ToolResult::ok(format!(
            "Successfully edited {}{occurrences}:\n\n```diff\n{}```",
            outcome.path, outcome.diff
        ))
        .with_metadata(json!({ "replacements": outcome.replacements })))
    }
}
