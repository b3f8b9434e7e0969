//! `run_shell_command`: executes a shell command and returns its output.
//! Always gated by the guardian — see
//! `coordination::guardian::SecurityPolicy::RESTRICTED_TOOLS`.
//!
//! Grounded on `app/tools/local_system.py::terminal`, with the dangerous-
//! pattern detection and head/tail output truncation adapted from the
//! `skilllite-agent` crate's `run_command` extension.

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(300);
const MAX_OUTPUT_CHARS: usize = 8000;

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"rm\s+(-[a-zA-Z]*f[a-zA-Z]*\s+|.*--force)", "rm with force flag"),
    (r"rm\s+-[a-zA-Z]*r[a-zA-Z]*\s+/\s*$", "rm -rf /"),
    (r"(curl|wget)\s+.*\|\s*(bash|sh|zsh)", "piping a remote script to a shell"),
    (r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;\s*:", "fork bomb"),
    (r"chmod\s+(-[a-zA-Z]*R|--recursive)\s+777", "recursive chmod 777"),
];

fn dangerous_reason(cmd: &str) -> Option<&'static str> {
    DANGEROUS_PATTERNS.iter().find_map(|(pattern, reason)| {
        regex::Regex::new(pattern).ok()?.is_match(cmd).then_some(*reason)
    })
}

/// Drains an optional child pipe to completion, consuming it concurrently
/// with `child.wait()` so a chatty command can't deadlock on a full pipe
/// buffer.
async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn truncate(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let head_size = MAX_OUTPUT_CHARS * 2 / 3;
    let tail_size = MAX_OUTPUT_CHARS / 3;
    let head: String = output.chars().take(head_size).collect();
    let tail: String = output
        .chars()
        .rev()
        .take(tail_size)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!(
        "{head}\n\n[... output truncated: {} total chars, showing head + tail ...]\n\n{tail}",
        output.len()
    )
}

pub struct RunShellCommand;

#[async_trait]
impl Tool for RunShellCommand {
    fn name(&self) -> &str {
        "run_shell_command"
    }

    fn description(&self) -> &str {
        "Executes a shell command and returns its combined stdout/stderr. Requires user approval."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to execute"},
            },
            "required": ["command"],
        })
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed {
                tool: self.name().to_string(),
                message: "missing required argument `command`".to_string(),
            })?;

        if command.trim().is_empty() {
            return Err(ToolError::Failed {
                tool: self.name().to_string(),
                message: "command must not be empty".to_string(),
            });
        }

        if let Some(reason) = dangerous_reason(command) {
            tracing::warn!(command, reason, "run_shell_command executing a flagged pattern");
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("spawning `{command}`: {e}"),
            })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let run_to_completion = async { tokio::join!(child.wait(), read_pipe(stdout_pipe), read_pipe(stderr_pipe)) };

        let (status, stdout_buf, stderr_buf) = match tokio::time::timeout(TIMEOUT, run_to_completion).await {
            Ok((status, out, err)) => (
                status.map_err(|e| ToolError::Failed {
                    tool: self.name().to_string(),
                    message: format!("waiting on `{command}`: {e}"),
                })?,
                out,
                err,
            ),
            Err(_) => {
                let _ = child.kill().await;
                return Err(ToolError::TimedOut {
                    tool: self.name().to_string(),
                    seconds: TIMEOUT.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_buf);
        let stderr = String::from_utf8_lossy(&stderr_buf);
        let code = status.code().unwrap_or(-1);

        let body = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.trim().to_string(),
            (true, false) => stderr.trim().to_string(),
            (false, false) => format!("{}\n[stderr]: {}", stdout.trim(), stderr.trim()),
        };

        let result = if status.success() {
            if body.is_empty() {
                "Command succeeded (exit 0)".to_string()
            } else {
                format!("Command succeeded (exit 0):\n{body}")
            }
        } else {
            format!("Command failed (exit {code}):\n{body}")
        };

        Ok(truncate(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_simple_command() {
        let mut args = Map::new();
        args.insert("command".to_string(), Value::String("echo hi".to_string()));
        let out = RunShellCommand.invoke(&args).await.unwrap();
        assert!(out.contains("hi"));
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let mut args = Map::new();
        args.insert("command".to_string(), Value::String("exit 3".to_string()));
        let out = RunShellCommand.invoke(&args).await.unwrap();
        assert!(out.contains("exit 3"));
    }

    #[test]
    fn flags_fork_bomb_pattern() {
        assert!(dangerous_reason(":(){ :|:& };:").is_some());
    }

    #[test]
    fn leaves_ordinary_commands_unflagged() {
        assert!(dangerous_reason("ls -la").is_none());
    }
}
