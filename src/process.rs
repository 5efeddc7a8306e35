//! Subprocess plumbing shared by every external-tool adapter.
//!
//! Commands are always a program plus a fixed argument list; nothing here
//! goes through a shell.

use crate::errors::ExternalError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// A fully specified invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Short name for errors and logs: the file name of the program.
fn tool_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string())
}

/// Run a command to completion.
///
/// A missing binary maps to [`ExternalError::NotInstalled`], a timeout to
/// [`ExternalError::Timeout`] (the child is killed). A non-zero exit is not
/// an error here; callers interpret exit codes themselves.
pub async fn run_tool(cmd: &ToolCommand) -> Result<ToolOutput, ExternalError> {
    let tool = tool_name(&cmd.program);
    tracing::debug!(tool = %tool, args = ?cmd.args, "running external tool");

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &cmd.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExternalError::NotInstalled { tool: tool.clone() }
        } else {
            ExternalError::unavailable(&tool, format!("failed to spawn: {}", e))
        }
    })?;

    if let Some(input) = &cmd.stdin
        && let Some(mut stdin) = child.stdin.take()
    {
        // A child that exits without reading stdin closes the pipe; that is
        // not a failure of the tool.
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            tracing::debug!(tool = %tool, error = %e, "stdin closed early");
        }
    }

    let output = match timeout(cmd.timeout, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|e| ExternalError::unavailable(&tool, format!("failed to wait: {}", e)))?,
        Err(_) => {
            tracing::warn!(tool = %tool, secs = cmd.timeout.as_secs(), "external tool timed out");
            return Err(ExternalError::Timeout {
                tool,
                secs: cmd.timeout.as_secs(),
            });
        }
    };

    let result = ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    tracing::debug!(tool = %tool, code = ?result.code, "external tool finished");
    Ok(result)
}

/// Locate `program` on `PATH`. Paths containing a separator are checked as-is.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_not_installed() {
        let err = run_tool(&ToolCommand::new("sdp-definitely-not-a-real-tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalError::NotInstalled { .. }));
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let out = run_tool(&ToolCommand::new("sh").args(["-c", "echo hi; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_stdin_is_piped() {
        let out = run_tool(&ToolCommand::new("cat").stdin("{\"a\":1}"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let err = run_tool(
            &ToolCommand::new("sleep")
                .arg("5")
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExternalError::Timeout { .. }));
    }

    #[test]
    fn test_find_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("sdp-definitely-not-a-real-tool").is_none());
    }
}
