use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::ShellConfig;
use crate::executor::ToolError;
use crate::tool::TypedTool;

const DEFAULT_BLOCKED: &[&str] = &["rm -rf /", "mkfs", "dd if=", "shutdown", "reboot", "halt"];

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ShellParams {
    /// Bash command line to run
    pub command: String,
    /// Working directory, defaults to the process directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Runs a bash command with a timeout and a substring blocklist.
#[derive(Debug)]
pub struct ShellTool {
    timeout: Duration,
    blocked: Vec<String>,
}

impl ShellTool {
    #[must_use]
    pub fn new(config: &ShellConfig) -> Self {
        let mut blocked: Vec<String> = DEFAULT_BLOCKED.iter().map(|s| (*s).to_owned()).collect();
        blocked.extend(config.blocked_commands.iter().map(|s| s.to_lowercase()));
        blocked.sort();
        blocked.dedup();
        Self {
            timeout: Duration::from_secs(config.timeout),
            blocked,
        }
    }

    fn find_blocked(&self, command: &str) -> Option<&str> {
        let lower = command.to_lowercase();
        self.blocked
            .iter()
            .find(|b| lower.contains(b.as_str()))
            .map(String::as_str)
    }
}

impl TypedTool for ShellTool {
    type Params = ShellParams;

    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a bash command and return its combined stdout, stderr and exit code."
    }

    async fn run(&self, params: ShellParams) -> Result<String, ToolError> {
        if let Some(pattern) = self.find_blocked(&params.command) {
            tracing::warn!(pattern, "blocked shell command");
            return Err(ToolError::Blocked {
                command: params.command,
            });
        }
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&params.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr] ");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            match output.status.code() {
                Some(code) => {
                    let _ = write!(text, "[exit code {code}]");
                }
                None => text.push_str("[terminated by signal]"),
            }
        }
        if text.trim().is_empty() {
            text = "(no output)".to_owned();
        }
        Ok(text)
    }
}
