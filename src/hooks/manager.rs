//! Hook manager: loads definitions, matches them to events and phases, and
//! runs them.

use super::config::{HookDefinition, HooksConfig};
use super::executor::HookExecutor;
use super::types::{HookContext, HookEvent, HookResult};
use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub struct HookManager {
    config: HooksConfig,
    executor: HookExecutor,
}

impl HookManager {
    /// Load `.sdp/hooks.toml` (if any) and merge `extra` definitions, usually
    /// the `[[hooks]]` entries of `.sdp/config.toml`.
    pub fn new(project_dir: impl AsRef<Path>, extra: HooksConfig) -> Result<Self> {
        let project_dir = project_dir.as_ref();
        let mut config = HooksConfig::load_or_default(&project_dir.join(".sdp"))?;
        config.merge(extra);
        Ok(Self::with_config(project_dir, config))
    }

    pub fn with_config(project_dir: impl AsRef<Path>, config: HooksConfig) -> Self {
        for warning in config.validate() {
            tracing::warn!("{}", warning);
        }
        Self {
            executor: HookExecutor::new(project_dir),
            config,
        }
    }

    pub fn hook_count(&self) -> usize {
        self.config.enabled_hook_count()
    }

    /// Run every hook matching the context's event and phase, in order,
    /// stopping at the first block.
    pub async fn run_hooks(
        &self,
        context: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<HookResult> {
        let hooks: Vec<&HookDefinition> = self
            .config
            .hooks_for_event_and_phase(context.event, context.phase.as_str());
        if hooks.is_empty() {
            return Ok(HookResult::continue_execution());
        }
        tracing::debug!(event = %context.event, phase = %context.phase, count = hooks.len(), "running hooks");
        let result = self.executor.execute_all(&hooks, context, cancel).await?;
        if !result.should_continue() {
            tracing::warn!(
                event = %context.event,
                phase = %context.phase,
                message = result.message.as_deref().unwrap_or(""),
                "hook blocked"
            );
        }
        Ok(result)
    }

    pub fn has_hooks_for(&self, event: HookEvent) -> bool {
        self.config.hooks.iter().any(|h| h.enabled && h.event == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookAction;
    use crate::phase::Phase;
    use tempfile::tempdir;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_no_hooks_continues() {
        let dir = tempdir().unwrap();
        let manager = HookManager::new(dir.path(), HooksConfig::default()).unwrap();
        assert_eq!(manager.hook_count(), 0);
        let ctx = HookContext::pre_phase("F016", Phase::Build, None, "commit abc1234");
        let result = manager.run_hooks(&ctx, &CancellationToken::new()).await.unwrap();
        assert!(result.should_continue());
    }

    #[tokio::test]
    async fn test_only_matching_phase_runs() {
        let dir = tempdir().unwrap();
        let block = script(dir.path(), "block.sh", "#!/bin/sh\nexit 1\n");
        let config = HooksConfig {
            hooks: vec![HookDefinition::command(HookEvent::PrePhase, block).with_match("review")],
        };
        let manager = HookManager::with_config(dir.path(), config);
        let cancel = CancellationToken::new();

        let build = HookContext::pre_phase("F016", Phase::Build, None, "commit abc1234");
        assert!(manager.run_hooks(&build, &cancel).await.unwrap().should_continue());

        let review = HookContext::pre_phase("F016", Phase::Review, None, "review approved");
        assert_eq!(
            manager.run_hooks(&review, &cancel).await.unwrap().action,
            HookAction::Block
        );
    }

    #[tokio::test]
    async fn test_hooks_file_and_extra_are_merged() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".sdp")).unwrap();
        std::fs::write(
            dir.path().join(".sdp/hooks.toml"),
            "[[hooks]]\nevent = \"post_phase\"\ncommand = \"true\"\n",
        )
        .unwrap();
        let extra = HooksConfig {
            hooks: vec![HookDefinition::command(HookEvent::PrePhase, "true")],
        };
        let manager = HookManager::new(dir.path(), extra).unwrap();
        assert_eq!(manager.hook_count(), 2);
        assert!(manager.has_hooks_for(HookEvent::PostPhase));
    }
}
