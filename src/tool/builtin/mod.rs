mod bash;
mod edit;
mod execute_code;
mod glob;
mod grep;
mod read;
mod tasks;
mod write;

pub use bash::BashTool;
pub use edit::EditTool;
pub use execute_code::ExecuteCodeTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use read::ReadTool;
pub use tasks::{CancelTaskTool, DispatchTaskTool, TaskStatusTool, WaitTaskTool};
pub use write::WriteTool;

use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;

use crate::session::{ExecutionError, ExecutionOutput, SessionError};
use crate::tool::{ToolContext, ToolError, ToolResult};

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArgs(format!("{key} is required")))
}

fn optional_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

fn timeout_arg(args: &Value) -> Option<Duration> {
    args.get("timeout_secs")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
}

/// Runs `fut` unless the context is aborted first.
async fn until_aborted<F: Future>(ctx: &ToolContext, fut: F) -> Result<F::Output, ToolError> {
    tokio::select! {
        out = fut => Ok(out),
        () = ctx.abort_signal.cancelled() => Err(ToolError::Cancelled),
    }
}

fn render_output(output: &ExecutionOutput) -> String {
    let mut raw = output.stdout.clone();
    if !output.stderr.is_empty() {
        if !raw.is_empty() && !raw.ends_with('\n') {
            raw.push('\n');
        }
        raw.push_str("STDERR:\n");
        raw.push_str(&output.stderr);
    }
    let total_lines = raw.lines().count();
    format!(
        "Exit code: {}\nOutput lines: {total_lines}\n\n{raw}",
        output.exit_status
    )
}

/// Turns a code or command run into a tool result. Timeouts and failing
/// exits still return what was printed, flagged as an error.
fn execution_result(
    result: Result<ExecutionOutput, SessionError>,
) -> Result<ToolResult, ToolError> {
    match result {
        Ok(output) => Ok(ToolResult {
            content: render_output(&output),
            is_error: false,
            metadata: Some(json!({
                "exit_code": output.exit_status,
                "truncated": output.truncated,
            })),
        }),
        Err(SessionError::Execution(err @ ExecutionError::Timeout { .. }))
        | Err(SessionError::Execution(err @ ExecutionError::Runtime { .. })) => {
            let error = if matches!(err, ExecutionError::Timeout { .. }) {
                "timeout"
            } else {
                "runtime"
            };
            let output = err.output().cloned().unwrap_or_default();
            Ok(ToolResult {
                content: format!("{err}\n{}", render_output(&output)),
                is_error: true,
                metadata: Some(json!({
                    "exit_code": output.exit_status,
                    "truncated": output.truncated,
                    "error": error,
                })),
            })
        }
        Err(err) => Err(err.into()),
    }
}
