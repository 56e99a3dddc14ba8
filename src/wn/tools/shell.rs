//! Shell built-in: run a command line and capture its output.
//!
//! The optional `timeout` argument (seconds, minimum 1) maps to process
//! supervision: when the deadline passes the child is killed and the call
//! fails.  Stdout and stderr are captured separately; a non-zero exit code
//! makes the result a failure while still carrying the captured output in
//! the diagnostic so the model can see what happened.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::wn::provider::{ToolDefinition, ToolResult};

use super::{optional_u64, require_str};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// `shell { command, timeout? }` — execute through `sh -c`.
pub fn shell_tool() -> ToolDefinition {
    ToolDefinition::new(
        "shell",
        "Run a shell command and return its output.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line to execute"},
                "timeout": {
                    "type": "integer",
                    "description": "Seconds before the command is killed (default 60)",
                    "minimum": 1,
                },
            },
            "required": ["command"],
        }),
        Arc::new(|args| {
            Box::pin(async move {
                let command = match require_str(&args, "command") {
                    Ok(command) => command.to_string(),
                    Err(err) => return ToolResult::failure(err),
                };
                let timeout_secs = match optional_u64(&args, "timeout") {
                    Ok(timeout) => timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
                    Err(err) => return ToolResult::failure(err),
                };
                run_command(&command, Duration::from_secs(timeout_secs)).await
            })
        }),
    )
}

async fn run_command(command: &str, timeout: Duration) -> ToolResult {
    let child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return ToolResult::failure(format!("cannot spawn shell: {}", err)),
    };

    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    match waited {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if output.status.success() {
                ToolResult::success(combine_output(&stdout, &stderr))
            } else {
                let code = output.status.code().unwrap_or(-1);
                ToolResult::failure(format!(
                    "exit code {}\n{}",
                    code,
                    combine_output(&stdout, &stderr)
                ))
            }
        }
        Ok(Err(err)) => ToolResult::failure(format!("command failed: {}", err)),
        Err(_) => ToolResult::failure(format!(
            "command timed out after {} seconds",
            timeout.as_secs()
        )),
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    if stderr.trim().is_empty() {
        stdout.to_string()
    } else if stdout.trim().is_empty() {
        format!("stderr:\n{}", stderr)
    } else {
        format!("{}\nstderr:\n{}", stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let tool = shell_tool();
        let result = (tool.execute)(serde_json::json!({"command": "echo hello"})).await;
        assert!(result.ok);
        assert_eq!(result.output.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_output() {
        let tool = shell_tool();
        let result =
            (tool.execute)(serde_json::json!({"command": "echo oops >&2; exit 3"})).await;
        assert!(!result.ok);
        let error = result.error.unwrap();
        assert!(error.contains("exit code 3"));
        assert!(error.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let result = run_command("sleep 5", Duration::from_millis(100)).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected_by_validation() {
        let tool = shell_tool();
        let result =
            (tool.execute)(serde_json::json!({"command": "true", "timeout": 0})).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("timeout"));
    }
}
