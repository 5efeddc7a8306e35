//! Delegation of phase work to an external agent runtime.
//!
//! The engine writes a prompt file and hands it to an [`AgentRunner`]. The
//! runner reports how the agent exited; it never advances the checkpoint.
//! The caller inspects the outcome and advances explicitly.

use crate::errors::ExternalError;
use crate::process::{ToolCommand, run_tool};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// How many trailing characters of agent output are kept in the outcome.
const OUTPUT_TAIL: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentOutcome {
    pub runtime: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub output_tail: String,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run the agent on `prompt_file` inside `workdir`. A non-zero exit is
    /// an unsuccessful outcome, not an error.
    async fn run(&self, prompt_file: &Path, workdir: &Path) -> Result<AgentOutcome, ExternalError>;
}

fn tail(s: &str) -> String {
    let trimmed = s.trim_end();
    let start = trimmed.len().saturating_sub(OUTPUT_TAIL);
    let start = (start..=trimmed.len())
        .find(|&i| trimmed.is_char_boundary(i))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

/// Runs `<cmd> run <prompt-file>`.
pub struct OpencodeRunner {
    command: String,
    timeout: Duration,
}

impl OpencodeRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(3_600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_for(&self, prompt_file: &Path, workdir: &Path) -> ToolCommand {
        ToolCommand::new(&self.command)
            .arg("run")
            .arg(prompt_file.to_string_lossy())
            .current_dir(workdir)
            .timeout(self.timeout)
    }
}

#[async_trait]
impl AgentRunner for OpencodeRunner {
    fn name(&self) -> &str {
        "opencode"
    }

    async fn run(&self, prompt_file: &Path, workdir: &Path) -> Result<AgentOutcome, ExternalError> {
        let cmd = self.command_for(prompt_file, workdir);
        tracing::info!(runtime = self.name(), prompt = %prompt_file.display(), "delegating to agent");
        let out = run_tool(&cmd).await?;
        let output = if out.stdout.trim().is_empty() {
            &out.stderr
        } else {
            &out.stdout
        };
        Ok(AgentOutcome {
            runtime: self.name().to_string(),
            exit_code: out.code,
            success: out.success(),
            output_tail: tail(output),
        })
    }
}

/// Records prompts and returns a fixed outcome.
#[derive(Debug)]
pub struct FakeAgentRunner {
    exit_code: i32,
    prompts: Mutex<Vec<PathBuf>>,
}

impl FakeAgentRunner {
    pub fn succeeding() -> Self {
        Self::exiting(0)
    }

    pub fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<PathBuf> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AgentRunner for FakeAgentRunner {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run(&self, prompt_file: &Path, _workdir: &Path) -> Result<AgentOutcome, ExternalError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt_file.to_path_buf());
        Ok(AgentOutcome {
            runtime: self.name().to_string(),
            exit_code: Some(self.exit_code),
            success: self.exit_code == 0,
            output_tail: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_command_is_fixed_argument_list() {
        let runner = OpencodeRunner::new("opencode");
        let cmd = runner.command_for(Path::new("/tmp/p; rm -rf /.md"), Path::new("/repo"));
        assert_eq!(cmd.program, "opencode");
        assert_eq!(cmd.args, vec!["run", "/tmp/p; rm -rf /.md"]);
    }

    #[tokio::test]
    async fn test_runner_reports_exit_status() {
        let dir = tempdir().unwrap();
        let ok = script(dir.path(), "#!/bin/sh\necho \"ran $1 $2\"\nexit 0\n");
        let outcome = OpencodeRunner::new(ok)
            .run(Path::new("prompt.md"), dir.path())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output_tail, "ran run prompt.md");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_unsuccessful_not_error() {
        let dir = tempdir().unwrap();
        let fail = script(dir.path(), "#!/bin/sh\necho broke >&2\nexit 3\n");
        let outcome = OpencodeRunner::new(fail)
            .run(Path::new("prompt.md"), dir.path())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.output_tail, "broke");
    }

    #[tokio::test]
    async fn test_missing_runtime_is_not_installed() {
        let dir = tempdir().unwrap();
        let err = OpencodeRunner::new("definitely-not-an-agent-binary")
            .run(Path::new("prompt.md"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalError::NotInstalled { .. }));
    }

    #[test]
    fn test_tail_keeps_end_on_char_boundary() {
        let long = "é".repeat(OUTPUT_TAIL);
        let t = tail(&long);
        assert!(t.len() <= OUTPUT_TAIL);
        assert!(t.chars().all(|c| c == 'é'));
    }
}
