//! Hook execution engine.
//!
//! Each hook is a program plus a fixed argument list. The context is piped
//! as JSON on stdin and summarized in `SDP_*` environment variables. Exit
//! code 0 continues (stdout may carry a JSON [`HookResult`]), anything else
//! blocks, and so does a timeout.

use super::config::HookDefinition;
use super::types::{HookContext, HookResult};
use crate::errors::{ExternalError, ResilienceError};
use crate::process::{ToolCommand, ToolOutput, run_tool};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct HookExecutor {
    project_dir: PathBuf,
}

impl HookExecutor {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    fn working_dir(&self, hook: &HookDefinition) -> PathBuf {
        hook.working_dir
            .as_ref()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.project_dir.join(p)
                }
            })
            .unwrap_or_else(|| self.project_dir.clone())
    }

    /// `./x.sh` and `scripts/x.sh` resolve against the working dir; bare
    /// names go through PATH.
    fn program(hook: &HookDefinition, working_dir: &Path) -> String {
        let command = Path::new(&hook.command);
        if command.is_relative() && command.components().count() > 1 {
            working_dir.join(command).to_string_lossy().to_string()
        } else {
            hook.command.clone()
        }
    }

    /// Execute a single hook. Failures of the hook itself (missing program,
    /// non-zero exit, timeout) come back as a blocking [`HookResult`].
    pub async fn execute(
        &self,
        hook: &HookDefinition,
        context: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookResult> {
        let working_dir = self.working_dir(hook);
        let context_json =
            serde_json::to_string(context).context("Failed to serialize hook context to JSON")?;

        let cmd = ToolCommand::new(Self::program(hook, &working_dir))
            .args(hook.args.iter().cloned())
            .current_dir(&working_dir)
            .env("SDP_EVENT", context.event.as_str())
            .env("SDP_PHASE", context.phase.as_str())
            .env("SDP_FEATURE", &context.feature_id)
            .env(
                "SDP_WORKSTREAM",
                context.workstream_id.clone().unwrap_or_default(),
            )
            .stdin(context_json)
            .timeout(Duration::from_secs(hook.timeout_secs));

        tracing::debug!(
            command = %hook.command,
            event = %context.event,
            timeout_secs = hook.timeout_secs,
            "executing hook"
        );

        let outcome = tokio::select! {
            outcome = run_tool(&cmd) => outcome,
            _ = cancel.cancelled() => return Err(ResilienceError::Cancelled.into()),
        };

        let output = match outcome {
            Ok(output) => output,
            Err(ExternalError::Timeout { secs, .. }) => {
                return Ok(HookResult::block(format!(
                    "Hook '{}' timed out after {} seconds",
                    hook.command, secs
                )));
            }
            Err(e) => {
                return Ok(HookResult::block(format!(
                    "Hook '{}' could not run: {}",
                    hook.command, e
                )));
            }
        };

        tracing::debug!(command = %hook.command, code = ?output.code, "hook completed");
        Ok(Self::parse_hook_result(&output, hook))
    }

    fn parse_hook_result(output: &ToolOutput, hook: &HookDefinition) -> HookResult {
        let stdout = output.stdout.trim();
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            tracing::debug!(command = %hook.command, stderr = %stderr, "hook stderr");
        }

        let reason = |fallback: String| {
            if !stderr.is_empty() {
                stderr.to_string()
            } else if !stdout.is_empty() {
                stdout.to_string()
            } else {
                fallback
            }
        };

        match output.code {
            Some(0) => {
                if !stdout.is_empty()
                    && let Ok(result) = serde_json::from_str::<HookResult>(stdout)
                {
                    return result;
                }
                HookResult::continue_execution()
            }
            Some(1) => HookResult::block(reason(format!(
                "Hook '{}' returned exit code 1",
                hook.command
            ))),
            Some(code) => HookResult::block(format!(
                "Hook '{}' failed (exit {}): {}",
                hook.command,
                code,
                reason("no output".to_string())
            )),
            None => HookResult::block(format!(
                "Hook '{}' was terminated by a signal",
                hook.command
            )),
        }
    }

    /// Execute hooks in order, stopping at the first blocking result.
    pub async fn execute_all(
        &self,
        hooks: &[&HookDefinition],
        context: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookResult> {
        for hook in hooks {
            let result = self.execute(hook, context, cancel).await?;
            if !result.should_continue() {
                return Ok(result);
            }
        }
        Ok(HookResult::continue_execution())
    }
}
